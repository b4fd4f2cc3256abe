//! In-memory storage of query entries with retention and LRU eviction.

use chrono::Utc;
use lru::LruCache;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::traits::{Freshness, QueryKey};
use crate::query::{QueryOptions, QueryStatus, Snapshot};
use crate::transport::ApiError;

/// Default cap on resident entries.
pub const DEFAULT_MAX_ENTRIES: usize = 100;

/// One cached query.
pub(crate) struct CacheEntry {
  data: Option<Value>,
  error: Option<ApiError>,
  status: QueryStatus,
  fetched_at: Option<Instant>,
  updated_at: Option<chrono::DateTime<Utc>>,
  pub invalidated: bool,
  pub fetching: bool,
  /// Generation of the most recently started fetch.
  pub generation: u64,
  settled: u64,
  last_used: Instant,
  pub options: QueryOptions,
  /// Canceled when the current generation is superseded or dropped.
  cancel: CancellationToken,
  tx: watch::Sender<Snapshot>,
}

impl CacheEntry {
  fn new(options: QueryOptions, now: Instant) -> Self {
    let (tx, _) = watch::channel(Snapshot::idle(options.freshness_window));
    Self {
      data: None,
      error: None,
      status: QueryStatus::Idle,
      fetched_at: None,
      updated_at: None,
      invalidated: false,
      fetching: false,
      generation: 0,
      settled: 0,
      last_used: now,
      options,
      cancel: CancellationToken::new(),
      tx,
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
    self.tx.subscribe()
  }

  pub fn subscriber_count(&self) -> usize {
    self.tx.receiver_count()
  }

  pub fn freshness(&self, now: Instant) -> Freshness {
    Freshness::evaluate(
      self.fetched_at,
      self.invalidated,
      self.options.freshness_window,
      now,
    )
  }

  /// Record a read with the options it was made with.
  pub fn touch(&mut self, now: Instant, options: &QueryOptions) {
    self.last_used = now;
    self.options = *options;
  }

  /// Mark a new fetch as started and return its generation.
  ///
  /// Any fetch still running for an older generation is canceled.
  pub fn begin_fetch(&mut self) -> u64 {
    self.cancel.cancel();
    self.cancel = CancellationToken::new();
    self.generation += 1;
    self.fetching = true;
    self.invalidated = false;
    if self.data.is_none() {
      self.status = QueryStatus::Loading;
    }
    self.publish();
    self.generation
  }

  /// Token of the current generation.
  pub fn cancel_token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  pub fn invalidate(&mut self) {
    self.invalidated = true;
    self.publish();
  }

  fn evictable(&self) -> bool {
    !self.fetching && self.subscriber_count() == 0
  }

  fn expired(&self, now: Instant) -> bool {
    self.evictable() && now.saturating_duration_since(self.last_used) >= self.options.retention_window
  }

  fn publish(&self) {
    self.tx.send_replace(Snapshot {
      status: self.status,
      data: self.data.clone(),
      error: self.error.clone(),
      fetching: self.fetching,
      fetched_at: self.fetched_at,
      updated_at: self.updated_at,
      invalidated: self.invalidated,
      freshness_window: self.options.freshness_window,
      settled: self.settled,
    });
  }
}

/// All cached entries, ordered by recency of use.
pub(crate) struct QueryStore {
  entries: LruCache<QueryKey, CacheEntry>,
  max_entries: usize,
}

impl QueryStore {
  pub fn new(max_entries: usize) -> Self {
    Self {
      entries: LruCache::unbounded(),
      max_entries: max_entries.max(1),
    }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn contains(&self, key: &QueryKey) -> bool {
    self.entries.contains(key)
  }

  /// Get the entry for `key`, creating it (and making room) if needed.
  /// Either way the entry becomes the most recently used.
  pub fn entry(&mut self, key: &QueryKey, options: &QueryOptions, now: Instant) -> &mut CacheEntry {
    if !self.entries.contains(key) {
      self.make_room();
    }
    self
      .entries
      .get_or_insert_mut(key.clone(), || CacheEntry::new(*options, now))
  }

  /// Entries whose key starts with `prefix`.
  pub fn matching_mut<'a>(
    &'a mut self,
    prefix: &'a QueryKey,
  ) -> impl Iterator<Item = &'a mut CacheEntry> + 'a {
    self
      .entries
      .iter_mut()
      .filter(move |(key, _)| key.starts_with(prefix))
      .map(|(_, entry)| entry)
  }

  pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CacheEntry> {
    self.entries.iter_mut().map(|(_, entry)| entry)
  }

  /// Store the outcome of fetch `generation` for `key`.
  ///
  /// Outcomes of superseded generations, and of entries evicted meanwhile,
  /// are dropped. A failure keeps the previous data visible.
  pub fn settle(
    &mut self,
    key: &QueryKey,
    generation: u64,
    outcome: Result<Value, ApiError>,
    now: Instant,
  ) -> bool {
    let Some(entry) = self.entries.peek_mut(key) else {
      debug!(%key, "discarding result for evicted query");
      return false;
    };
    if entry.generation != generation {
      debug!(%key, generation, current = entry.generation, "discarding superseded result");
      return false;
    }

    entry.fetching = false;
    entry.settled = generation;
    match outcome {
      Ok(data) => {
        entry.data = Some(data);
        entry.error = None;
        entry.status = QueryStatus::Success;
        entry.fetched_at = Some(now);
        entry.updated_at = Some(Utc::now());
      }
      Err(error) => {
        entry.error = Some(error);
        entry.status = QueryStatus::Error;
        // Old data stays visible but no longer counts as fresh.
        entry.invalidated = true;
      }
    }
    entry.publish();
    true
  }

  /// Drop entries nobody has used for longer than their retention window.
  ///
  /// Entries with live subscribers count as in use.
  pub fn collect_garbage(&mut self, now: Instant) -> usize {
    let mut expired = Vec::new();
    for (key, entry) in self.entries.iter_mut() {
      if entry.subscriber_count() > 0 {
        entry.last_used = now;
      } else if entry.expired(now) {
        expired.push(key.clone());
      }
    }
    for key in &expired {
      debug!(%key, "evicting expired query");
      self.entries.pop(key);
    }
    expired.len()
  }

  pub fn remove(&mut self, key: &QueryKey) -> bool {
    match self.entries.pop(key) {
      Some(entry) => {
        entry.cancel.cancel();
        true
      }
      None => false,
    }
  }

  /// Drop every entry, canceling fetches still in flight.
  pub fn clear(&mut self) {
    for (_, entry) in self.entries.iter() {
      entry.cancel.cancel();
    }
    self.entries.clear();
  }

  /// Evict least-recently-used entries until one more fits.
  ///
  /// Entries that are observed or mid-fetch are skipped; if nothing can go,
  /// the cap is exceeded temporarily.
  fn make_room(&mut self) {
    while self.entries.len() >= self.max_entries {
      let victim = self
        .entries
        .iter()
        .rev()
        .find(|(_, entry)| entry.evictable())
        .map(|(key, _)| key.clone());
      match victim {
        Some(key) => {
          debug!(%key, "evicting least recently used query");
          self.entries.pop(&key);
        }
        None => break,
      }
    }
  }
}

#[cfg(test)]
impl QueryStore {
  pub fn retention_of(&self, key: &QueryKey) -> Option<std::time::Duration> {
    self.entries.peek(key).map(|e| e.options.retention_window)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query_key;
  use serde_json::json;
  use std::time::Duration;

  fn options() -> QueryOptions {
    QueryOptions::default()
  }

  #[test]
  fn test_settle_ignores_superseded_generation() {
    let mut store = QueryStore::new(10);
    let key = query_key!["users"];
    let now = Instant::now();

    let first = store.entry(&key, &options(), now).begin_fetch();
    let second = store.entry(&key, &options(), now).begin_fetch();

    assert!(store.settle(&key, second, Ok(json!(["new"])), now));
    assert!(!store.settle(&key, first, Ok(json!(["old"])), now));

    let rx = store.entry(&key, &options(), now).subscribe();
    assert_eq!(rx.borrow().data, Some(json!(["new"])));
  }

  #[test]
  fn test_new_generation_cancels_previous() {
    let mut store = QueryStore::new(10);
    let key = query_key!["products", 1, 20];
    let now = Instant::now();

    let entry = store.entry(&key, &options(), now);
    entry.begin_fetch();
    let first = entry.cancel_token();
    entry.begin_fetch();
    let second = entry.cancel_token();

    assert!(first.is_cancelled());
    assert!(!second.is_cancelled());

    store.clear();
    assert!(second.is_cancelled());
  }

  #[test]
  fn test_failure_keeps_previous_data() {
    let mut store = QueryStore::new(10);
    let key = query_key!["roles"];
    let now = Instant::now();

    let generation = store.entry(&key, &options(), now).begin_fetch();
    store.settle(&key, generation, Ok(json!([1])), now);
    let generation = store.entry(&key, &options(), now).begin_fetch();
    store.settle(&key, generation, Err(ApiError::Network("down".into())), now);

    let rx = store.entry(&key, &options(), now).subscribe();
    let snapshot = rx.borrow();
    assert_eq!(snapshot.status, QueryStatus::Error);
    assert_eq!(snapshot.data, Some(json!([1])));
    assert!(snapshot.error.is_some());
    assert!(snapshot.invalidated, "a failed refresh leaves the data stale");
  }

  #[test]
  fn test_lru_eviction_skips_observed_entries() {
    let mut store = QueryStore::new(2);
    let now = Instant::now();
    let a = query_key!["a"];
    let b = query_key!["b"];
    let c = query_key!["c"];

    let _watching_a = store.entry(&a, &options(), now).subscribe();
    store.entry(&b, &options(), now);
    store.entry(&c, &options(), now);

    assert!(store.contains(&a));
    assert!(!store.contains(&b));
    assert!(store.contains(&c));
    assert_eq!(store.len(), 2);
  }

  #[test]
  fn test_lru_order_follows_use() {
    let mut store = QueryStore::new(2);
    let now = Instant::now();
    let a = query_key!["a"];
    let b = query_key!["b"];

    store.entry(&a, &options(), now);
    store.entry(&b, &options(), now);
    // Touch `a` again so `b` becomes the eviction candidate.
    store.entry(&a, &options(), now);
    store.entry(&query_key!["c"], &options(), now);

    assert!(store.contains(&a));
    assert!(!store.contains(&b));
  }

  #[test]
  fn test_garbage_collection_respects_retention() {
    let mut store = QueryStore::new(10);
    let now = Instant::now();
    let retention = Duration::from_secs(600);
    let opts = options().with_retention_window(retention);

    store.entry(&query_key!["idle"], &opts, now);
    let _rx = store.entry(&query_key!["watched"], &opts, now).subscribe();
    assert_eq!(store.retention_of(&query_key!["idle"]), Some(retention));

    assert_eq!(store.collect_garbage(now + Duration::from_secs(599)), 0);
    assert_eq!(store.collect_garbage(now + retention), 1);
    assert!(!store.contains(&query_key!["idle"]));
    assert!(store.contains(&query_key!["watched"]));
  }
}
