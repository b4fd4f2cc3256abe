//! Query options and the subscriber-side view of a cached query.
//!
//! Inspired by TanStack Query. A `Query<T>` is what a screen holds on to: the
//! current data, loading and error state, and a live subscription to the
//! cache entry behind it.
//!
//! # Example
//!
//! ```ignore
//! let mut users = queries
//!     .read(query_key!["users", 1, 20], &options, move |cancel| {
//!         let api = api.with_cancel(cancel);
//!         async move { api.list::<User>(PageRequest::new(1, 20)).await }
//!     })
//!     .await;
//!
//! // In event loop tick
//! if users.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! match users.status() {
//!     QueryStatus::Loading => render_spinner(),
//!     QueryStatus::Success => render_data(users.data()),
//!     QueryStatus::Error => render_error(users.error()),
//!     QueryStatus::Idle => {}
//! }
//! ```

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::api::reserialize;
use crate::cache::{Cacheable, Freshness};
use crate::transport::ApiError;

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Extra attempts after the first failure.
  pub max_retries: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl RetryPolicy {
  /// Never retry.
  pub const NONE: RetryPolicy = RetryPolicy {
    max_retries: 0,
    base_delay: Duration::ZERO,
    max_delay: Duration::ZERO,
  };

  pub fn new(max_retries: u32) -> Self {
    Self {
      max_retries,
      ..Self::default()
    }
  }

  /// Delay before retry number `attempt` (zero-based): `base * 2^attempt`,
  /// capped at `max_delay`.
  pub fn delay(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    self
      .base_delay
      .checked_mul(factor)
      .unwrap_or(self.max_delay)
      .min(self.max_delay)
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 1,
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(10),
    }
  }
}

/// Per-read cache behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
  /// How long after a fetch the data is served without re-fetching.
  pub freshness_window: Duration,
  /// How long an unobserved, unread entry survives before eviction.
  pub retention_window: Duration,
  pub refetch_on_focus: bool,
  pub refetch_on_reconnect: bool,
  /// Re-fetch when a read is the first subscriber to an entry, even if fresh.
  pub refetch_on_mount: bool,
  pub retry: RetryPolicy,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      freshness_window: Duration::from_secs(5 * 60),
      retention_window: Duration::from_secs(10 * 60),
      refetch_on_focus: false,
      refetch_on_reconnect: false,
      refetch_on_mount: false,
      retry: RetryPolicy::default(),
    }
  }
}

impl QueryOptions {
  pub fn with_freshness_window(mut self, window: Duration) -> Self {
    self.freshness_window = window;
    self
  }

  pub fn with_retention_window(mut self, window: Duration) -> Self {
    self.retention_window = window;
    self
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_refetch_on_focus(mut self, enabled: bool) -> Self {
    self.refetch_on_focus = enabled;
    self
  }

  pub fn with_refetch_on_reconnect(mut self, enabled: bool) -> Self {
    self.refetch_on_reconnect = enabled;
    self
  }

  pub fn with_refetch_on_mount(mut self, enabled: bool) -> Self {
    self.refetch_on_mount = enabled;
    self
  }
}

/// Lifecycle status of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Nothing fetched yet and nothing in flight.
  Idle,
  /// First fetch in flight, no data yet.
  Loading,
  /// Last fetch succeeded.
  Success,
  /// Last fetch failed. Earlier data, if any, is still available.
  Error,
}

/// What the cache publishes to subscribers of one key.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
  pub status: QueryStatus,
  pub data: Option<Value>,
  pub error: Option<ApiError>,
  pub fetching: bool,
  pub fetched_at: Option<Instant>,
  pub updated_at: Option<DateTime<Utc>>,
  pub invalidated: bool,
  pub freshness_window: Duration,
  /// Generation of the most recent fetch that settled.
  pub settled: u64,
}

impl Snapshot {
  pub fn idle(freshness_window: Duration) -> Self {
    Self {
      status: QueryStatus::Idle,
      data: None,
      error: None,
      fetching: false,
      fetched_at: None,
      updated_at: None,
      invalidated: false,
      freshness_window,
      settled: 0,
    }
  }
}

/// Typed view of a query at one point in time.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
  pub status: QueryStatus,
  pub data: Option<T>,
  pub error: Option<ApiError>,
  /// A fetch is running, possibly in the background of existing data.
  pub fetching: bool,
  /// Wall-clock time of the last successful fetch.
  pub updated_at: Option<DateTime<Utc>>,
  fetched_at: Option<Instant>,
  invalidated: bool,
  freshness_window: Duration,
}

impl<T: Cacheable> QueryState<T> {
  fn from_snapshot(snapshot: &Snapshot) -> Self {
    let mut state = Self {
      status: snapshot.status,
      data: None,
      error: snapshot.error.clone(),
      fetching: snapshot.fetching,
      updated_at: snapshot.updated_at,
      fetched_at: snapshot.fetched_at,
      invalidated: snapshot.invalidated,
      freshness_window: snapshot.freshness_window,
    };

    if let Some(value) = &snapshot.data {
      match reserialize::<T>(value) {
        Ok(data) => state.data = Some(data),
        Err(e) => {
          state.status = QueryStatus::Error;
          state.error = Some(ApiError::decode(e));
        }
      }
    }
    state
  }
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  pub fn freshness(&self) -> Freshness {
    Freshness::evaluate(
      self.fetched_at,
      self.invalidated,
      self.freshness_window,
      Instant::now(),
    )
  }
}

/// A subscription to one cache entry.
///
/// Dropping the `Query` unsubscribes, which makes the entry eligible for
/// eviction once its retention window passes.
pub struct Query<T> {
  receiver: watch::Receiver<Snapshot>,
  state: QueryState<T>,
}

impl<T: Cacheable> Query<T> {
  pub(crate) fn from_receiver(mut receiver: watch::Receiver<Snapshot>) -> Self {
    let state = QueryState::from_snapshot(&receiver.borrow_and_update());
    Self { receiver, state }
  }

  /// Get the current state of the query.
  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn status(&self) -> QueryStatus {
    self.state.status
  }

  /// Latest data, including stale data kept after a failed refresh.
  pub fn data(&self) -> Option<&T> {
    self.state.data.as_ref()
  }

  pub fn error(&self) -> Option<&ApiError> {
    self.state.error.as_ref()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn freshness(&self) -> Freshness {
    self.state.freshness()
  }

  /// Pick up any change published since the last look.
  ///
  /// Returns `true` if the state changed. Call this in an event loop tick.
  pub fn poll(&mut self) -> bool {
    match self.receiver.has_changed() {
      Ok(true) => {
        self.refresh();
        true
      }
      _ => false,
    }
  }

  /// Wait for the next change. Returns `false` once the entry is gone.
  pub async fn changed(&mut self) -> bool {
    if self.receiver.changed().await.is_err() {
      return false;
    }
    self.refresh();
    true
  }

  /// Collapse into the data of a successful fetch or the error of a failed one.
  pub fn into_result(self) -> Result<T, ApiError> {
    match (self.state.status, self.state.data, self.state.error) {
      (QueryStatus::Error, _, Some(error)) => Err(error),
      (_, Some(data), _) => Ok(data),
      (_, None, Some(error)) => Err(error),
      (status, None, None) => Err(ApiError::InvalidResponse(format!(
        "query has no data ({:?})",
        status
      ))),
    }
  }

  fn refresh(&mut self) {
    self.state = QueryState::from_snapshot(&self.receiver.borrow_and_update());
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("state", &self.state)
      .finish_non_exhaustive()
  }
}
