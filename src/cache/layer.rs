//! Query client that orchestrates caching, fetching and invalidation.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::storage::{QueryStore, DEFAULT_MAX_ENTRIES};
use super::traits::{Cacheable, Freshness, QueryKey};
use crate::query::{Query, QueryOptions, RetryPolicy};
use crate::transport::ApiError;

/// Shared cache of query results.
///
/// Sits between screens and the API client: reads are served from cache
/// while fresh, concurrent reads of one key share a single fetch, and
/// mutations invalidate the keys they affect.
#[derive(Clone)]
pub struct QueryClient {
  store: Arc<Mutex<QueryStore>>,
  defaults: QueryOptions,
}

impl Default for QueryClient {
  fn default() -> Self {
    Self::new(DEFAULT_MAX_ENTRIES)
  }
}

impl QueryClient {
  /// Create a client holding at most `max_entries` resident entries.
  pub fn new(max_entries: usize) -> Self {
    Self {
      store: Arc::new(Mutex::new(QueryStore::new(max_entries))),
      defaults: QueryOptions::default(),
    }
  }

  /// Set the options used by callers that don't bring their own.
  pub fn with_defaults(mut self, defaults: QueryOptions) -> Self {
    self.defaults = defaults;
    self
  }

  pub fn defaults(&self) -> &QueryOptions {
    &self.defaults
  }

  fn lock(&self) -> MutexGuard<'_, QueryStore> {
    lock_store(&self.store)
  }

  /// Read `key`, fetching it if it is absent or stale.
  ///
  /// 1. Fresh entry: returned immediately, `fetcher` is not called
  /// 2. Fetch already running: joined, no second call
  /// 3. Otherwise: `fetcher` runs in the background with retries, and every
  ///    subscriber of `key` sees the outcome
  ///
  /// `fetcher` receives a token that is canceled once a newer fetch of `key`
  /// starts or the entry is dropped; pass it on to the transport.
  ///
  /// On failure the returned query carries the error alongside whatever data
  /// was cached before.
  pub async fn read<T, F, Fut>(&self, key: QueryKey, options: &QueryOptions, fetcher: F) -> Query<T>
  where
    T: Cacheable,
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    let (receiver, pending) = {
      let now = Instant::now();
      let mut store = self.lock();
      store.collect_garbage(now);

      let entry = store.entry(&key, options, now);
      let mounting = entry.subscriber_count() == 0;
      let receiver = entry.subscribe();
      entry.touch(now, options);

      let pending = if entry.fetching && !entry.invalidated {
        debug!(%key, "joining in-flight fetch");
        Some(entry.generation)
      } else if entry.freshness(now) == Freshness::Fresh && !(options.refetch_on_mount && mounting) {
        debug!(%key, "cache hit");
        None
      } else {
        let generation = entry.begin_fetch();
        debug!(%key, generation, "fetching");
        let cancel = entry.cancel_token();
        self.spawn_fetch(key.clone(), generation, cancel, options.retry, fetcher);
        Some(generation)
      };
      (receiver, pending)
    };

    if let Some(generation) = pending {
      let mut waiter = receiver.clone();
      // Err means the entry was dropped (clear/remove); report what we have.
      let _ = waiter.wait_for(|s| s.settled >= generation).await;
    }

    Query::from_receiver(receiver)
  }

  /// Like `read`, but collapsed into the fetched data or the terminal error.
  pub async fn fetch<T, F, Fut>(
    &self,
    key: QueryKey,
    options: &QueryOptions,
    fetcher: F,
  ) -> Result<T, ApiError>
  where
    T: Cacheable,
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    self.read(key, options, fetcher).await.into_result()
  }

  /// Bind to `key` without fetching.
  pub fn subscribe<T: Cacheable>(&self, key: &QueryKey) -> Query<T> {
    let now = Instant::now();
    let mut store = self.lock();
    let entry = store.entry(key, &self.defaults, now);
    let receiver = entry.subscribe();
    Query::from_receiver(receiver)
  }

  /// Mark every entry under `prefix` as absent. Subscribers are notified and
  /// the next read of each entry goes to the network.
  pub fn invalidate(&self, prefix: &QueryKey) -> usize {
    let mut store = self.lock();
    let mut count = 0;
    for entry in store.matching_mut(prefix) {
      entry.invalidate();
      count += 1;
    }
    debug!(%prefix, count, "invalidated queries");
    count
  }

  /// Run a write and, if it succeeds, invalidate `related` keys.
  ///
  /// Writes are never retried.
  pub async fn mutate<T, Fut>(&self, related: &[QueryKey], mutation: Fut) -> Result<T, ApiError>
  where
    Fut: Future<Output = Result<T, ApiError>>,
  {
    let value = mutation.await?;
    for key in related {
      self.invalidate(key);
    }
    Ok(value)
  }

  /// The application regained focus.
  pub fn notify_focus(&self) -> usize {
    self.invalidate_observed(|options| options.refetch_on_focus)
  }

  /// Connectivity came back.
  pub fn notify_reconnect(&self) -> usize {
    self.invalidate_observed(|options| options.refetch_on_reconnect)
  }

  fn invalidate_observed(&self, opted_in: impl Fn(&QueryOptions) -> bool) -> usize {
    let mut store = self.lock();
    let mut count = 0;
    for entry in store.iter_mut() {
      if entry.subscriber_count() > 0 && opted_in(&entry.options) {
        entry.invalidate();
        count += 1;
      }
    }
    count
  }

  /// Drop expired entries now rather than on the next access.
  pub fn collect_garbage(&self) -> usize {
    self.lock().collect_garbage(Instant::now())
  }

  pub fn remove(&self, key: &QueryKey) -> bool {
    self.lock().remove(key)
  }

  /// Forget everything, e.g. when the signed-in user changes.
  pub fn clear(&self) {
    self.lock().clear();
  }

  pub fn contains(&self, key: &QueryKey) -> bool {
    self.lock().contains(key)
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn spawn_fetch<T, F, Fut>(
    &self,
    key: QueryKey,
    generation: u64,
    cancel: CancellationToken,
    retry: RetryPolicy,
    fetcher: F,
  ) where
    T: Cacheable,
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    let store = Arc::clone(&self.store);
    tokio::spawn(async move {
      let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
          debug!(%key, generation, "fetch superseded");
          return;
        }
        outcome = fetch_with_retry(&key, &fetcher, &cancel, retry) => outcome,
      };
      let outcome = outcome.and_then(|data| serde_json::to_value(&data).map_err(ApiError::decode));
      lock_store(&store).settle(&key, generation, outcome, Instant::now());
    });
  }
}

fn lock_store(store: &Mutex<QueryStore>) -> MutexGuard<'_, QueryStore> {
  store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Call `fetcher` until it succeeds, fails permanently, or runs out of retries.
async fn fetch_with_retry<T, F, Fut>(
  key: &QueryKey,
  fetcher: &F,
  cancel: &CancellationToken,
  retry: RetryPolicy,
) -> Result<T, ApiError>
where
  F: Fn(CancellationToken) -> Fut,
  Fut: Future<Output = Result<T, ApiError>>,
{
  let mut attempt = 0;
  loop {
    match fetcher(cancel.clone()).await {
      Ok(data) => return Ok(data),
      Err(e) if e.is_transient() && attempt < retry.max_retries => {
        let delay = retry.delay(attempt);
        warn!(%key, attempt = attempt + 1, ?delay, "fetch failed, retrying: {}", e);
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
      Err(e) => return Err(e),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query::QueryStatus;
  use crate::query_key;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  /// Fetcher that counts calls and answers with the call number.
  fn counting(
    calls: &Arc<AtomicUsize>,
    latency: Duration,
  ) -> impl Fn(CancellationToken) -> futures::future::BoxFuture<'static, Result<usize, ApiError>> + Send + Sync + 'static
  {
    let calls = Arc::clone(calls);
    move |_| {
      let calls = Arc::clone(&calls);
      Box::pin(async move {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(latency).await;
        Ok(n)
      })
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_fresh_entry_is_served_without_fetching() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = QueryOptions::default();

    let first: Query<usize> = client
      .read(query_key!["users"], &options, counting(&calls, Duration::ZERO))
      .await;
    tokio::time::advance(Duration::from_secs(60)).await;
    let second: Query<usize> = client
      .read(query_key!["users"], &options, counting(&calls, Duration::ZERO))
      .await;

    assert_eq!(first.data(), Some(&1));
    assert_eq!(second.data(), Some(&1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_entry_is_refetched() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = QueryOptions::default().with_freshness_window(Duration::from_secs(5));

    let _ = client
      .fetch(query_key!["roles"], &options, counting(&calls, Duration::ZERO))
      .await;
    tokio::time::advance(Duration::from_secs(6)).await;
    let value = client
      .fetch(query_key!["roles"], &options, counting(&calls, Duration::ZERO))
      .await;

    assert_eq!(value, Ok(2));
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_forces_refetch() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = QueryOptions::default();

    let _ = client
      .fetch(query_key!["users"], &options, counting(&calls, Duration::ZERO))
      .await;
    assert_eq!(client.invalidate(&query_key!["users"]), 1);
    let value = client
      .fetch(query_key!["users"], &options, counting(&calls, Duration::ZERO))
      .await;

    assert_eq!(value, Ok(2));
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_matches_prefix_only() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = QueryOptions::default();

    for key in [
      query_key!["products", 1, 20],
      query_key!["products", 2, 20],
      query_key!["warehouses"],
    ] {
      let _ = client.fetch(key, &options, counting(&calls, Duration::ZERO)).await;
    }

    assert_eq!(client.invalidate(&query_key!["products"]), 2);
    let warehouses: Query<usize> = client.subscribe(&query_key!["warehouses"]);
    assert_eq!(warehouses.freshness(), Freshness::Fresh);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_reads_share_one_fetch() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = QueryOptions::default();
    let key = query_key!["products", 1, 20];

    let (a, b): (Query<usize>, Query<usize>) = tokio::join!(
      client.read(key.clone(), &options, counting(&calls, Duration::from_millis(100))),
      client.read(key.clone(), &options, counting(&calls, Duration::from_millis(100))),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.data(), Some(&1));
    assert_eq!(b.data(), Some(&1));
  }

  #[tokio::test(start_paused = true)]
  async fn test_subscribers_are_notified() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = query_key!["permissions"];

    let mut watcher: Query<usize> = client.subscribe(&key);
    assert_eq!(watcher.status(), QueryStatus::Idle);

    let _ = client
      .fetch(key.clone(), &QueryOptions::default(), counting(&calls, Duration::ZERO))
      .await;

    assert!(watcher.poll());
    assert_eq!(watcher.data(), Some(&1));

    client.invalidate(&key);
    assert!(watcher.changed().await);
    assert_eq!(watcher.freshness(), Freshness::Absent);
    // Data stays visible until the re-fetch replaces it.
    assert_eq!(watcher.data(), Some(&1));
  }

  #[tokio::test(start_paused = true)]
  async fn test_retries_with_backoff_then_keeps_last_good_value() {
    let client = QueryClient::default();
    let key = query_key!["inventories"];
    let options = QueryOptions::default().with_freshness_window(Duration::ZERO);

    let _ = client
      .fetch(key.clone(), &options, |_| async { Ok::<_, ApiError>(vec![7u32]) })
      .await;

    let attempts = Arc::new(Mutex::new(Vec::new()));
    let retry = RetryPolicy {
      max_retries: 4,
      base_delay: Duration::from_secs(2),
      max_delay: Duration::from_secs(10),
    };
    let failing = {
      let attempts = Arc::clone(&attempts);
      move |_| {
        let attempts = Arc::clone(&attempts);
        async move {
          attempts.lock().unwrap().push(Instant::now());
          Err::<Vec<u32>, _>(ApiError::Server {
            status: 503,
            message: "unavailable".to_string(),
          })
        }
      }
    };
    let query: Query<Vec<u32>> = client.read(key, &options.with_retry(retry), failing).await;

    let attempts = attempts.lock().unwrap().clone();
    assert_eq!(attempts.len(), 5, "one call plus max_retries retries");
    let gaps: Vec<u64> = attempts
      .windows(2)
      .map(|w| (w[1] - w[0]).as_secs())
      .collect();
    assert_eq!(gaps, vec![2, 4, 8, 10]);

    assert!(query.is_error());
    assert_eq!(query.error().map(ApiError::kind), Some(crate::transport::ErrorKind::Server));
    assert_eq!(query.data(), Some(&vec![7]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_default_policy_retries_once() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = {
      let calls = Arc::clone(&calls);
      move |_| {
        let calls = Arc::clone(&calls);
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          Err::<u32, _>(ApiError::Network("connection reset".to_string()))
        }
      }
    };

    let result = client
      .fetch(query_key!["users"], &QueryOptions::default(), fetcher.clone())
      .await;
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // A failed entry is not fresh: the next read tries again.
    let _ = client
      .fetch(query_key!["users"], &QueryOptions::default(), fetcher)
      .await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);
  }

  #[tokio::test(start_paused = true)]
  async fn test_permanent_failures_are_not_retried() {
    for error in [
      ApiError::Unauthenticated("expired".to_string()),
      ApiError::RateLimited("slow down".to_string()),
      ApiError::Canceled,
    ] {
      let client = QueryClient::default();
      let calls = Arc::new(AtomicUsize::new(0));
      let fetcher = {
        let calls = Arc::clone(&calls);
        let error = error.clone();
        move |_| {
          let calls = Arc::clone(&calls);
          let error = error.clone();
          async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<u32, _>(error)
          }
        }
      };
      let options = QueryOptions::default().with_retry(RetryPolicy::new(3));
      let result = client.fetch(query_key!["users"], &options, fetcher).await;

      assert_eq!(result, Err(error));
      assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_superseded_fetch_does_not_overwrite_newer_result() {
    let client = QueryClient::default();
    let key = query_key!["products", 1, 20];
    let options = QueryOptions::default();
    let calls = Arc::new(AtomicUsize::new(0));

    // First call is slow, the second is quick.
    let fetcher = {
      let calls = Arc::clone(&calls);
      move |_| {
        let calls = Arc::clone(&calls);
        async move {
          let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
          let latency = if n == 1 { 100 } else { 10 };
          tokio::time::sleep(Duration::from_millis(latency)).await;
          Ok::<_, ApiError>(n)
        }
      }
    };

    let slow = tokio::spawn({
      let client = client.clone();
      let key = key.clone();
      let fetcher = fetcher.clone();
      async move { client.read::<usize, _, _>(key, &options, fetcher).await.into_result() }
    });
    tokio::time::sleep(Duration::from_millis(5)).await;
    client.invalidate(&key);
    let fast: Query<usize> = client.read(key.clone(), &options, fetcher).await;
    assert_eq!(fast.data(), Some(&2));

    // The slow reader wakes up with the newest outcome.
    assert_eq!(slow.await.unwrap(), Ok(2));
    tokio::time::sleep(Duration::from_millis(200)).await;
    let after: Query<usize> = client.subscribe(&key);
    assert_eq!(after.data(), Some(&2));
  }

  #[tokio::test(start_paused = true)]
  async fn test_newer_fetch_cancels_older_one() {
    let client = QueryClient::default();
    let key = query_key!["warehouses"];
    let options = QueryOptions::default();
    let tokens = Arc::new(Mutex::new(Vec::new()));

    let fetcher = {
      let tokens = Arc::clone(&tokens);
      move |cancel: CancellationToken| {
        let tokens = Arc::clone(&tokens);
        async move {
          let n = {
            let mut tokens = tokens.lock().unwrap();
            tokens.push(cancel);
            tokens.len()
          };
          tokio::time::sleep(Duration::from_millis(100)).await;
          Ok::<_, ApiError>(n)
        }
      }
    };

    let (first, second): (Query<usize>, Query<usize>) = tokio::join!(
      client.read(key.clone(), &options, fetcher.clone()),
      async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.invalidate(&key);
        client.read(key.clone(), &options, fetcher.clone()).await
      },
    );

    let tokens = tokens.lock().unwrap().clone();
    assert_eq!(tokens.len(), 2);
    assert!(tokens[0].is_cancelled());
    assert!(!tokens[1].is_cancelled());
    assert_eq!(first.data(), Some(&2));
    assert_eq!(second.data(), Some(&2));
    assert!(first.error().is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_mutate_invalidates_only_on_success() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = QueryOptions::default();
    let users = query_key!["users"];

    let _ = client
      .fetch(users.clone(), &options, counting(&calls, Duration::ZERO))
      .await;

    let failed = client
      .mutate(&[users.clone()], async {
        Err::<(), _>(ApiError::Request {
          status: 400,
          message: "duplicate username".to_string(),
        })
      })
      .await;
    assert!(failed.is_err());
    assert_eq!(client.subscribe::<usize>(&users).freshness(), Freshness::Fresh);

    let created = client
      .mutate(&[users.clone()], async { Ok::<_, ApiError>(42) })
      .await;
    assert_eq!(created, Ok(42));
    assert_eq!(client.subscribe::<usize>(&users).freshness(), Freshness::Absent);

    let refetched = client
      .fetch(users, &options, counting(&calls, Duration::ZERO))
      .await;
    assert_eq!(refetched, Ok(2));
  }

  #[tokio::test(start_paused = true)]
  async fn test_unobserved_entries_expire() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = QueryOptions::default().with_retention_window(Duration::from_secs(600));

    let kept: Query<usize> = client
      .read(query_key!["kept"], &options, counting(&calls, Duration::ZERO))
      .await;
    let dropped: Query<usize> = client
      .read(query_key!["dropped"], &options, counting(&calls, Duration::ZERO))
      .await;
    drop(dropped);

    tokio::time::advance(Duration::from_secs(601)).await;
    assert_eq!(client.collect_garbage(), 1);
    assert!(client.contains(&query_key!["kept"]));
    assert!(!client.contains(&query_key!["dropped"]));
    drop(kept);
  }

  #[tokio::test(start_paused = true)]
  async fn test_resident_entries_are_capped() {
    let client = QueryClient::new(3);
    let calls = Arc::new(AtomicUsize::new(0));
    let options = QueryOptions::default();

    for page in 1..=5u32 {
      let _ = client
        .fetch(query_key!["products", page, 20], &options, counting(&calls, Duration::ZERO))
        .await;
    }

    assert_eq!(client.len(), 3);
    assert!(!client.contains(&query_key!["products", 1u32, 20]));
    assert!(client.contains(&query_key!["products", 5u32, 20]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_focus_refetch_is_opt_in() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let plain = QueryOptions::default();
    let on_focus = QueryOptions::default().with_refetch_on_focus(true);

    let _a: Query<usize> = client
      .read(query_key!["users"], &plain, counting(&calls, Duration::ZERO))
      .await;
    let _b: Query<usize> = client
      .read(query_key!["roles"], &on_focus, counting(&calls, Duration::ZERO))
      .await;

    assert_eq!(client.notify_reconnect(), 0);
    assert_eq!(client.notify_focus(), 1);
    assert_eq!(
      client.subscribe::<usize>(&query_key!["roles"]).freshness(),
      Freshness::Absent
    );
    assert_eq!(
      client.subscribe::<usize>(&query_key!["users"]).freshness(),
      Freshness::Fresh
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_refetch_on_mount() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = QueryOptions::default().with_refetch_on_mount(true);

    let first: Query<usize> = client
      .read(query_key!["roles"], &options, counting(&calls, Duration::ZERO))
      .await;
    // Still mounted: a second reader joins the fresh entry.
    let second: Query<usize> = client
      .read(query_key!["roles"], &options, counting(&calls, Duration::ZERO))
      .await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    drop(first);
    drop(second);
    let remounted: Query<usize> = client
      .read(query_key!["roles"], &options, counting(&calls, Duration::ZERO))
      .await;
    assert_eq!(remounted.data(), Some(&2));
  }
}
