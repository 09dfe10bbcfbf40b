//! Three-tier stale-while-revalidate data loading.
//!
//! `DataLoader::load` resolves a key against memory, then the persistent
//! store, then the network. Cached values are returned immediately while a
//! tracked background task refreshes them for next time. The only path on
//! which a caller waits for the network is a miss in both tiers.
//!
//! # Example
//!
//! ```ignore
//! let api = api.clone();
//! let timetable = loader
//!     .load(
//!         LoadOptions::new("timetable:week", move || {
//!             let api = api.clone();
//!             async move { api.timetable().await }
//!         })
//!         .with_ttl_minutes(30)
//!         .on_sync_state(|state| tracing::debug!(?state, "timetable")),
//!     )
//!     .await;
//! ```

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinSet;

use crate::cache::{Cacheable, MemoryCache, PersistentCache, SyncState};
use crate::offline::OfflineDetector;

/// Default time-to-live for loaded values.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

/// A boxed fetch future.
pub type FetchFuture<T> = BoxFuture<'static, Result<T>>;

/// A factory creating one network request per call.
pub type FetcherFn<T> = Arc<dyn Fn() -> FetchFuture<T> + Send + Sync>;

/// Called with every value handed to the caller.
pub type LoadedCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Decides from the cached value whether a background refresh is worth it.
pub type RevalidatePredicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Receives sync-state changes for one load.
pub type SyncStateCallback = Arc<dyn Fn(SyncState) + Send + Sync>;

/// Configuration for a single `load` call.
pub struct LoadOptions<T> {
  /// Cache key shared by both tiers
  pub key: String,
  /// How long stored values stay live
  pub ttl: Duration,
  /// Performs the network request
  pub fetcher: FetcherFn<T>,
  /// Invoked with the value returned to the caller
  pub on_loaded: Option<LoadedCallback<T>>,
  /// `None` always revalidates
  pub should_revalidate: Option<RevalidatePredicate<T>>,
  /// Skip both tiers entirely and fetch
  pub bypass_cache: bool,
  /// Invoke `on_loaded` again when a background refresh succeeds
  pub reinvoke_on_revalidate: bool,
  /// Receives `Cached`/`Fresh`/`Syncing`/`Failed`
  pub on_sync_state: Option<SyncStateCallback>,
}

impl<T: Cacheable> LoadOptions<T> {
  /// Options for `key` fetched by `fetcher`, with defaults for everything else.
  pub fn new<F, Fut>(key: impl Into<String>, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    Self {
      key: key.into(),
      ttl: DEFAULT_TTL,
      fetcher: Arc::new(move || fetcher().boxed()),
      on_loaded: None,
      should_revalidate: None,
      bypass_cache: false,
      reinvoke_on_revalidate: false,
      on_sync_state: None,
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  pub fn with_ttl_minutes(self, minutes: u64) -> Self {
    self.with_ttl(Duration::from_secs(minutes.saturating_mul(60)))
  }

  pub fn on_loaded(mut self, callback: impl Fn(&T) + Send + Sync + 'static) -> Self {
    self.on_loaded = Some(Arc::new(callback));
    self
  }

  pub fn should_revalidate(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
    self.should_revalidate = Some(Arc::new(predicate));
    self
  }

  pub fn bypass_cache(mut self, bypass: bool) -> Self {
    self.bypass_cache = bypass;
    self
  }

  pub fn reinvoke_on_revalidate(mut self, reinvoke: bool) -> Self {
    self.reinvoke_on_revalidate = reinvoke;
    self
  }

  pub fn on_sync_state(mut self, callback: impl Fn(SyncState) + Send + Sync + 'static) -> Self {
    self.on_sync_state = Some(Arc::new(callback));
    self
  }

  fn report(&self, state: SyncState) {
    if let Some(callback) = &self.on_sync_state {
      callback(state);
    }
  }

  fn loaded(&self, value: &T) {
    if let Some(callback) = &self.on_loaded {
      callback(value);
    }
  }

  fn wants_revalidation(&self, cached: &T) -> bool {
    self
      .should_revalidate
      .as_ref()
      .map_or(true, |predicate| predicate(cached))
  }

  /// Run the fetcher, turning a panic into an error.
  async fn fetch(&self) -> Result<T> {
    match AssertUnwindSafe((self.fetcher)()).catch_unwind().await {
      Ok(result) => result,
      Err(_) => Err(eyre!("Fetcher for {} panicked", self.key)),
    }
  }
}

struct LoaderInner {
  memory: Arc<MemoryCache>,
  persistent: PersistentCache,
  offline: OfflineDetector,
  tasks: Mutex<JoinSet<()>>,
  /// Keys with a background refresh in flight
  revalidating: Arc<Mutex<HashSet<String>>>,
}

/// Removes a key from the in-flight registry when the refresh ends or is aborted.
struct RevalidationGuard {
  revalidating: Arc<Mutex<HashSet<String>>>,
  key: String,
}

impl Drop for RevalidationGuard {
  fn drop(&mut self) {
    lock(&self.revalidating).remove(&self.key);
  }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Orchestrates memory → persistent → network reads.
///
/// Cheap to clone; clones share tiers and background tasks.
#[derive(Clone)]
pub struct DataLoader {
  inner: Arc<LoaderInner>,
}

impl DataLoader {
  pub fn new(memory: Arc<MemoryCache>, persistent: PersistentCache, offline: OfflineDetector) -> Self {
    Self {
      inner: Arc::new(LoaderInner {
        memory,
        persistent,
        offline,
        tasks: Mutex::new(JoinSet::new()),
        revalidating: Arc::new(Mutex::new(HashSet::new())),
      }),
    }
  }

  pub fn memory(&self) -> &MemoryCache {
    &self.inner.memory
  }

  pub fn persistent(&self) -> &PersistentCache {
    &self.inner.persistent
  }

  /// Load the value for `options.key`.
  ///
  /// Returns the best value available without surfacing any error: a cached
  /// value (refreshed in the background), a freshly fetched one, or `None`
  /// when nothing is cached and the fetch fails.
  pub async fn load<T: Cacheable>(&self, options: LoadOptions<T>) -> Option<T> {
    if options.bypass_cache {
      return match options.fetch().await {
        Ok(value) => {
          options.report(SyncState::Fresh);
          options.loaded(&value);
          Some(value)
        }
        Err(e) => {
          tracing::warn!(key = %options.key, error = %e, "uncached fetch failed");
          options.report(SyncState::Failed);
          None
        }
      };
    }

    if let Some(value) = self.read_memory::<T>(&options.key) {
      tracing::trace!(key = %options.key, "memory hit");
      self.serve_cached(options, &value);
      return Some(value);
    }

    if let Some(value) = self.read_persistent::<T>(&options.key).await {
      tracing::trace!(key = %options.key, "persistent hit");
      if let Ok(raw) = serde_json::to_value(&value) {
        self.inner.memory.set(&options.key, raw, ttl_of(&options));
      }
      self.serve_cached(options, &value);
      return Some(value);
    }

    match options.fetch().await {
      Ok(value) => {
        self.write_tiers(&options, &value).await;
        options.report(SyncState::Fresh);
        options.loaded(&value);
        Some(value)
      }
      Err(e) => {
        tracing::warn!(key = %options.key, error = %e, "fetch failed with nothing cached");
        options.report(SyncState::Failed);
        None
      }
    }
  }

  fn read_memory<T: Cacheable>(&self, key: &str) -> Option<T> {
    let raw = self.inner.memory.get(key)?;
    match serde_json::from_value(raw) {
      Ok(value) => Some(value),
      Err(e) => {
        tracing::debug!(key, error = %e, "memory entry has unexpected shape, dropping");
        self.inner.memory.remove(key);
        None
      }
    }
  }

  async fn read_persistent<T: Cacheable>(&self, key: &str) -> Option<T> {
    let raw = self.inner.persistent.get(key).await?;
    match serde_json::from_value(raw) {
      Ok(value) => Some(value),
      Err(e) => {
        tracing::debug!(key, error = %e, "persistent entry has unexpected shape, dropping");
        self.inner.persistent.remove(key).await;
        None
      }
    }
  }

  async fn write_tiers<T: Cacheable>(&self, options: &LoadOptions<T>, value: &T) {
    write_tiers(&self.inner, options, value).await;
  }

  fn serve_cached<T: Cacheable>(&self, options: LoadOptions<T>, value: &T) {
    options.report(SyncState::Cached);
    options.loaded(value);

    if options.wants_revalidation(value) {
      self.spawn_revalidation(options);
    }
  }

  fn spawn_revalidation<T: Cacheable>(&self, options: LoadOptions<T>) {
    if !lock(&self.inner.revalidating).insert(options.key.clone()) {
      tracing::trace!(key = %options.key, "revalidation already in flight");
      return;
    }
    let guard = RevalidationGuard {
      revalidating: Arc::clone(&self.inner.revalidating),
      key: options.key.clone(),
    };

    let inner = Arc::clone(&self.inner);
    let mut tasks = lock(&self.inner.tasks);
    // Reap finished refreshes so the set doesn't grow without bound
    while tasks.try_join_next().is_some() {}

    tasks.spawn(async move {
      let _guard = guard;

      if inner.offline.is_offline_mode().await {
        tracing::trace!(key = %options.key, "offline, skipping revalidation");
        return;
      }

      options.report(SyncState::Syncing);
      match options.fetch().await {
        Ok(value) => {
          write_tiers(&inner, &options, &value).await;
          options.report(SyncState::Fresh);
          if options.reinvoke_on_revalidate {
            options.loaded(&value);
          }
        }
        Err(e) => {
          tracing::debug!(key = %options.key, error = %e, "background revalidation failed");
          options.report(SyncState::Cached);
        }
      }
    });
  }

  /// Remove `key` from both tiers.
  pub async fn invalidate(&self, key: &str) {
    self.inner.memory.remove(key);
    self.inner.persistent.remove(key).await;
  }

  /// Drop every entry in the memory tier.
  pub fn clear_memory(&self) {
    self.inner.memory.clear();
  }

  /// Wait for every background refresh started so far.
  pub async fn settle(&self) {
    let mut tasks = std::mem::take(&mut *lock(&self.inner.tasks));
    while let Some(result) = tasks.join_next().await {
      if let Err(e) = result {
        if e.is_panic() {
          tracing::warn!(error = %e, "revalidation task panicked");
        }
      }
    }
  }

  /// Abort outstanding background refreshes.
  pub async fn shutdown(&self) {
    let mut tasks = std::mem::take(&mut *lock(&self.inner.tasks));
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
  }
}

/// Longest TTL stored; larger ones are clamped, never turned into "no expiry".
fn max_ttl() -> chrono::Duration {
  chrono::Duration::days(365 * 100)
}

fn ttl_of<T>(options: &LoadOptions<T>) -> Option<chrono::Duration> {
  let ttl = chrono::Duration::from_std(options.ttl).unwrap_or_else(|_| max_ttl());
  Some(ttl.min(max_ttl()))
}

async fn write_tiers<T: Cacheable>(inner: &LoaderInner, options: &LoadOptions<T>, value: &T) {
  let raw = match serde_json::to_value(value) {
    Ok(raw) => raw,
    Err(e) => {
      tracing::warn!(key = %options.key, error = %e, "value cannot be cached");
      return;
    }
  };
  let ttl = ttl_of(options);
  inner.memory.set(&options.key, raw.clone(), ttl);
  inner.persistent.set(&options.key, raw, ttl).await;
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::platform::ManualReachability;
  use crate::testing::{SpyStore, ToggleSettings};
  use serde::{Deserialize, Serialize};
  use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Counter {
    n: u32,
  }

  fn loader(store: Arc<SpyStore>, force_offline: bool) -> DataLoader {
    let offline = OfflineDetector::new(
      Arc::new(ToggleSettings::new(force_offline)),
      Arc::new(ManualReachability::new(true)),
    );
    DataLoader::new(
      Arc::new(MemoryCache::new()),
      PersistentCache::new(store),
      offline,
    )
  }

  /// Fetcher returning `Counter { n: source }` and counting calls.
  fn counting(
    key: &str,
    source: &Arc<AtomicU32>,
    calls: &Arc<AtomicU32>,
  ) -> LoadOptions<Counter> {
    let source = Arc::clone(source);
    let calls = Arc::clone(calls);
    LoadOptions::new(key, move || {
      let source = Arc::clone(&source);
      let calls = Arc::clone(&calls);
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(Counter {
          n: source.load(Ordering::SeqCst),
        })
      }
    })
  }

  fn failing(key: &str) -> LoadOptions<Counter> {
    LoadOptions::new(key, || async { Err(eyre!("network down")) })
  }

  fn recorder() -> (Arc<Mutex<Vec<SyncState>>>, impl Fn(SyncState) + Send + Sync + 'static) {
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    (states, move |state| lock(&sink).push(state))
  }

  #[tokio::test]
  async fn test_stale_value_served_then_revalidated() {
    let loader = loader(Arc::new(SpyStore::default()), false);
    let source = Arc::new(AtomicU32::new(1));
    let calls = Arc::new(AtomicU32::new(0));

    let first = loader.load(counting("x", &source, &calls).with_ttl_minutes(10)).await;
    assert_eq!(first, Some(Counter { n: 1 }));
    assert!(loader.memory().get("x").is_some());

    source.store(2, Ordering::SeqCst);
    let second = loader.load(counting("x", &source, &calls)).await;
    assert_eq!(second, Some(Counter { n: 1 }));

    loader.settle().await;
    let third = loader.load(counting("x", &source, &calls)).await;
    assert_eq!(third, Some(Counter { n: 2 }));
  }

  #[tokio::test]
  async fn test_memory_hit_does_not_wait_for_fetcher() {
    let loader = loader(Arc::new(SpyStore::default()), false);
    let slow = Arc::new(AtomicBool::new(false));

    let make = |slow: Arc<AtomicBool>| {
      LoadOptions::new("x", move || {
        let slow = Arc::clone(&slow);
        async move {
          if slow.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
          }
          Ok(Counter { n: 7 })
        }
      })
    };

    assert_eq!(loader.load(make(slow.clone())).await, Some(Counter { n: 7 }));
    slow.store(true, Ordering::SeqCst);

    let hit = tokio::time::timeout(Duration::from_secs(1), loader.load(make(slow.clone()))).await;
    assert_eq!(hit.unwrap(), Some(Counter { n: 7 }));
    loader.shutdown().await;
  }

  #[tokio::test]
  async fn test_persistent_round_trip_after_memory_eviction() {
    let loader = loader(Arc::new(SpyStore::default()), false);
    let source = Arc::new(AtomicU32::new(5));
    let calls = Arc::new(AtomicU32::new(0));

    loader.load(counting("grades", &source, &calls)).await;
    loader.clear_memory();

    let value = loader.load(failing("grades")).await;
    assert_eq!(value, Some(Counter { n: 5 }));
    // Memory tier was warmed from the persistent one
    assert!(loader.memory().get("grades").is_some());
    loader.settle().await;
  }

  #[tokio::test]
  async fn test_bypass_never_touches_tiers() {
    let store = Arc::new(SpyStore::default());
    let loader = loader(store.clone(), false);
    let source = Arc::new(AtomicU32::new(3));
    let calls = Arc::new(AtomicU32::new(0));

    let value = loader
      .load(counting("x", &source, &calls).bypass_cache(true))
      .await;
    assert_eq!(value, Some(Counter { n: 3 }));
    assert_eq!(store.gets.load(Ordering::SeqCst), 0);
    assert_eq!(store.sets.load(Ordering::SeqCst), 0);
    assert!(loader.memory().is_empty());
  }

  #[tokio::test]
  async fn test_cold_failure_returns_none_and_reports_failed() {
    let loader = loader(Arc::new(SpyStore::default()), false);
    let (states, sink) = recorder();

    let value = loader.load(failing("x").on_sync_state(sink)).await;
    assert_eq!(value, None);
    assert_eq!(*lock(&states), vec![SyncState::Failed]);
  }

  #[tokio::test]
  async fn test_panicking_fetcher_is_contained() {
    let loader = loader(Arc::new(SpyStore::default()), false);
    let options = LoadOptions::new("x", || async {
      let payload: Option<Counter> = None;
      Ok(payload.expect("bad payload"))
    });
    assert_eq!(loader.load(options).await, None);
  }

  #[tokio::test]
  async fn test_background_failure_reports_back_to_cached() {
    let loader = loader(Arc::new(SpyStore::default()), false);
    let source = Arc::new(AtomicU32::new(1));
    let calls = Arc::new(AtomicU32::new(0));
    loader.load(counting("x", &source, &calls)).await;

    let (states, sink) = recorder();
    let value = loader.load(failing("x").on_sync_state(sink)).await;
    loader.settle().await;

    assert_eq!(value, Some(Counter { n: 1 }));
    assert_eq!(
      *lock(&states),
      vec![SyncState::Cached, SyncState::Syncing, SyncState::Cached]
    );
  }

  #[tokio::test]
  async fn test_reinvoke_callback_after_revalidation() {
    let loader = loader(Arc::new(SpyStore::default()), false);
    let source = Arc::new(AtomicU32::new(1));
    let calls = Arc::new(AtomicU32::new(0));
    loader.load(counting("x", &source, &calls)).await;
    source.store(2, Ordering::SeqCst);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let (states, state_sink) = recorder();
    loader
      .load(
        counting("x", &source, &calls)
          .reinvoke_on_revalidate(true)
          .on_loaded(move |value: &Counter| lock(&sink).push(value.n))
          .on_sync_state(state_sink),
      )
      .await;
    loader.settle().await;

    assert_eq!(*lock(&seen), vec![1, 2]);
    assert_eq!(
      *lock(&states),
      vec![SyncState::Cached, SyncState::Syncing, SyncState::Fresh]
    );
  }

  #[tokio::test]
  async fn test_predicate_can_skip_revalidation() {
    let loader = loader(Arc::new(SpyStore::default()), false);
    let source = Arc::new(AtomicU32::new(1));
    let calls = Arc::new(AtomicU32::new(0));
    loader.load(counting("x", &source, &calls)).await;

    loader
      .load(counting("x", &source, &calls).should_revalidate(|cached: &Counter| cached.n > 1))
      .await;
    loader.settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_no_revalidation_while_offline() {
    let loader = loader(Arc::new(SpyStore::default()), true);
    let source = Arc::new(AtomicU32::new(1));
    let calls = Arc::new(AtomicU32::new(0));
    loader.load(counting("x", &source, &calls)).await;

    let (states, sink) = recorder();
    loader.load(counting("x", &source, &calls).on_sync_state(sink)).await;
    loader.settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*lock(&states), vec![SyncState::Cached]);
  }

  #[tokio::test]
  async fn test_concurrent_revalidations_are_deduplicated() {
    let loader = loader(Arc::new(SpyStore::default()), false);
    let calls = Arc::new(AtomicU32::new(0));

    let slow = |calls: Arc<AtomicU32>| {
      LoadOptions::new("x", move || {
        let calls = Arc::clone(&calls);
        async move {
          let n = calls.fetch_add(1, Ordering::SeqCst);
          if n > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
          }
          Ok(Counter { n })
        }
      })
    };

    loader.load(slow(calls.clone())).await;
    loader.load(slow(calls.clone())).await;
    loader.load(slow(calls.clone())).await;
    loader.settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_huge_ttl_still_expires_eventually() {
    let loader = loader(Arc::new(SpyStore::default()), false);
    let source = Arc::new(AtomicU32::new(1));
    let calls = Arc::new(AtomicU32::new(0));

    let options = counting("x", &source, &calls).with_ttl_minutes(u64::MAX);
    assert_eq!(ttl_of(&options), Some(max_ttl()));
    assert_eq!(loader.load(options).await, Some(Counter { n: 1 }));
    assert!(loader.memory().get("x").is_some());
    assert!(loader.persistent().get("x").await.is_some());
  }

  #[tokio::test]
  async fn test_invalidate_clears_both_tiers() {
    let store = Arc::new(SpyStore::default());
    let loader = loader(store.clone(), false);
    let source = Arc::new(AtomicU32::new(1));
    let calls = Arc::new(AtomicU32::new(0));
    loader.load(counting("x", &source, &calls)).await;

    loader.invalidate("x").await;
    assert!(loader.memory().get("x").is_none());
    assert!(loader.persistent().get("x").await.is_none());
    assert_eq!(loader.load(failing("x")).await, None);
  }
}
