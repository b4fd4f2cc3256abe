//! Registry of in-flight requests, keyed by request identity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Slot {
  id: u64,
  cancel: CancellationToken,
}

/// At most one slot per identity key. Registering a key that is already
/// present cancels the previous holder.
#[derive(Default)]
pub(crate) struct InflightRegistry {
  slots: Mutex<HashMap<String, Slot>>,
  next_id: AtomicU64,
}

impl InflightRegistry {
  fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
    self.slots.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Claim the slot for `key`, canceling whoever held it.
  ///
  /// The slot is released when the returned guard is dropped, but only if it
  /// still belongs to this registration. A request whose token is already
  /// canceled claims nothing, so it can never displace a live successor.
  pub(crate) fn register(&self, key: String, cancel: CancellationToken) -> InflightGuard<'_> {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let mut slots = self.slots();
    if cancel.is_cancelled() {
      debug!(key = %short(&key), id, "not registering canceled request");
      drop(slots);
      return InflightGuard {
        registry: self,
        key,
        id,
      };
    }
    let previous = slots.insert(key.clone(), Slot { id, cancel });
    drop(slots);
    if let Some(previous) = previous {
      debug!(key = %short(&key), superseded = previous.id, by = id, "canceling duplicate request");
      previous.cancel.cancel();
    }
    InflightGuard {
      registry: self,
      key,
      id,
    }
  }

  pub(crate) fn len(&self) -> usize {
    self.slots().len()
  }
}

pub(crate) struct InflightGuard<'a> {
  registry: &'a InflightRegistry,
  key: String,
  id: u64,
}

impl Drop for InflightGuard<'_> {
  fn drop(&mut self) {
    let mut slots = self.registry.slots();
    if slots.get(&self.key).is_some_and(|slot| slot.id == self.id) {
      slots.remove(&self.key);
    }
  }
}

fn short(key: &str) -> &str {
  key.get(..12).unwrap_or(key)
}
