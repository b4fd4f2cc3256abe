//! Session credential shared by every outbound request.
//!
//! The bearer token lives in exactly one place: a `SessionContext`. It is
//! loaded from a `TokenStore` at startup, replaced on login and cleared on
//! logout or when the server rejects it. Interested parties (the UI, the
//! CLI) learn about those transitions through `subscribe()`.

use color_eyre::Result;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Session transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
  SignedIn,
  SignedOut,
  /// The server rejected the credential. The UI should go to the login screen.
  Expired,
}

/// Durable home for the session token.
pub trait TokenStore: Send + Sync {
  fn load(&self) -> Result<Option<String>>;
  fn save(&self, token: &str) -> Result<()>;
  fn clear(&self) -> Result<()>;
}

/// Token store that forgets everything when the process exits.
#[derive(Default)]
pub struct MemoryTokenStore {
  token: Mutex<Option<String>>,
}

impl TokenStore for MemoryTokenStore {
  fn load(&self) -> Result<Option<String>> {
    Ok(self.token.lock().unwrap_or_else(PoisonError::into_inner).clone())
  }

  fn save(&self, token: &str) -> Result<()> {
    *self.token.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.to_string());
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    *self.token.lock().unwrap_or_else(PoisonError::into_inner) = None;
    Ok(())
  }
}

struct SessionInner {
  store: Box<dyn TokenStore>,
  token: RwLock<Option<String>>,
  events: broadcast::Sender<SessionEvent>,
}

/// Cheaply clonable handle to the process-wide session.
#[derive(Clone)]
pub struct SessionContext {
  inner: Arc<SessionInner>,
}

impl SessionContext {
  /// Create a session backed by `store`, restoring any saved token.
  pub fn new(store: impl TokenStore + 'static) -> Result<Self> {
    let token = store.load()?;
    let (events, _) = broadcast::channel(16);
    Ok(Self {
      inner: Arc::new(SessionInner {
        store: Box::new(store),
        token: RwLock::new(token),
        events,
      }),
    })
  }

  /// A session with no persistence and no token.
  pub fn in_memory() -> Self {
    let (events, _) = broadcast::channel(16);
    Self {
      inner: Arc::new(SessionInner {
        store: Box::new(MemoryTokenStore::default()),
        token: RwLock::new(None),
        events,
      }),
    }
  }

  /// Current token, if signed in.
  pub fn token(&self) -> Option<String> {
    self
      .inner
      .token
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn is_authenticated(&self) -> bool {
    self.token().is_some()
  }

  /// Install a new token and persist it.
  ///
  /// The in-memory token is replaced even if persisting fails, so the current
  /// process stays signed in; the error is still reported.
  pub fn set_token(&self, token: impl Into<String>) -> Result<()> {
    let token = token.into();
    let saved = self.inner.store.save(&token);
    *self
      .inner
      .token
      .write()
      .unwrap_or_else(PoisonError::into_inner) = Some(token);
    info!("session established");
    let _ = self.inner.events.send(SessionEvent::SignedIn);
    saved
  }

  /// Explicit logout.
  pub fn sign_out(&self) -> Result<()> {
    let had_token = self.take_token();
    let cleared = self.inner.store.clear();
    if had_token {
      info!("signed out");
      let _ = self.inner.events.send(SessionEvent::SignedOut);
    }
    cleared
  }

  /// Tear the session down after the server rejected the credential.
  ///
  /// Emits `SessionEvent::Expired` only on the transition from signed in to
  /// signed out, so a burst of 401s produces a single navigation signal.
  /// Returns whether the event was emitted.
  pub fn expire(&self) -> bool {
    if !self.take_token() {
      return false;
    }
    if let Err(e) = self.inner.store.clear() {
      warn!("Failed to clear stored session token: {}", e);
    }
    warn!("session expired, login required");
    let _ = self.inner.events.send(SessionEvent::Expired);
    true
  }

  /// Subscribe to session transitions.
  pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
    self.inner.events.subscribe()
  }

  fn take_token(&self) -> bool {
    self
      .inner
      .token
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
      .is_some()
  }
}

impl std::fmt::Debug for SessionContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SessionContext")
      .field("authenticated", &self.is_authenticated())
      .finish_non_exhaustive()
  }
}
