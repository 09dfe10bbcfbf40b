//! Offline-mode detection.
//!
//! The system is offline when the force-offline override is set OR the
//! platform reports the network as unreachable. The override lives in the
//! settings store, so it is cached for a short TTL and concurrent lookups
//! share a single in-flight request.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::platform::{Reachability, SettingsStore};

/// How long a fetched override value is trusted.
pub const DEFAULT_FLAG_TTL: Duration = Duration::from_secs(60);

type SharedLookup = Shared<BoxFuture<'static, bool>>;

#[derive(Debug, Clone, Copy)]
struct CachedFlag {
  value: bool,
  fetched_at: Instant,
}

#[derive(Default)]
struct FlagState {
  cached: Option<CachedFlag>,
  inflight: Option<SharedLookup>,
  /// Bumped on every invalidation so lookups started earlier don't repopulate the cache.
  generation: u64,
}

/// Decides whether the system should behave as offline.
#[derive(Clone)]
pub struct OfflineDetector {
  settings: Arc<dyn SettingsStore>,
  reachability: Arc<dyn Reachability>,
  ttl: Duration,
  state: Arc<Mutex<FlagState>>,
}

impl OfflineDetector {
  pub fn new(settings: Arc<dyn SettingsStore>, reachability: Arc<dyn Reachability>) -> Self {
    Self {
      settings,
      reachability,
      ttl: DEFAULT_FLAG_TTL,
      state: Arc::new(Mutex::new(FlagState::default())),
    }
  }

  /// Set how long a fetched override value is trusted.
  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  fn state(&self) -> MutexGuard<'_, FlagState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn fresh_cached(&self, state: &FlagState) -> Option<bool> {
    state
      .cached
      .filter(|flag| flag.fetched_at.elapsed() < self.ttl)
      .map(|flag| flag.value)
  }

  /// Whether the system should treat itself as offline.
  ///
  /// An active override wins regardless of actual reachability.
  pub async fn is_offline_mode(&self) -> bool {
    self.override_active().await || !self.reachability.is_reachable()
  }

  /// Best-effort variant that never performs I/O.
  ///
  /// Uses the cached override if it is fresh and set, otherwise the live
  /// reachability flag. May lag an override change by up to the TTL.
  pub fn is_offline_mode_sync(&self) -> bool {
    if self.fresh_cached(&self.state()) == Some(true) {
      return true;
    }
    !self.reachability.is_reachable()
  }

  /// Whether the force-offline override is set.
  ///
  /// Served from the cache when fresh; otherwise joins the in-flight lookup
  /// or starts one. A failed lookup counts as `false` and is cached.
  pub async fn override_active(&self) -> bool {
    let lookup = {
      let mut state = self.state();
      if let Some(value) = self.fresh_cached(&state) {
        return value;
      }

      match &state.inflight {
        Some(lookup) => lookup.clone(),
        None => {
          let lookup = self.start_lookup(state.generation);
          state.inflight = Some(lookup.clone());
          lookup
        }
      }
    };

    lookup.await
  }

  fn start_lookup(&self, generation: u64) -> SharedLookup {
    let settings = Arc::clone(&self.settings);
    let state = Arc::clone(&self.state);

    async move {
      let value = match settings.force_offline().await {
        Ok(value) => value,
        Err(e) => {
          tracing::warn!(error = %e, "force-offline lookup failed, assuming override is off");
          false
        }
      };

      let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
      if state.generation == generation {
        state.cached = Some(CachedFlag {
          value,
          fetched_at: Instant::now(),
        });
        state.inflight = None;
      }

      value
    }
    .boxed()
    .shared()
  }

  /// Drop the cached override so the next call re-reads the settings store.
  ///
  /// Must be called whenever the override changes.
  pub fn invalidate_cache(&self) {
    let mut state = self.state();
    state.cached = None;
    state.inflight = None;
    state.generation = state.generation.wrapping_add(1);
  }
}
