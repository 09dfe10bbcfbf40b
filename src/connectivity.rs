//! Connectivity state machine.
//!
//! Tracks whether the remote API is usable and whether local writes are
//! waiting to be synced:
//!
//! - `Online`: reachable and the last heartbeat succeeded
//! - `Offline`: the platform reports no network, or offline mode is forced
//! - `Degraded`: the network is up but the API's heartbeat fails
//! - `Queued`: unsynced writes exist (shown in preference to online/offline)
//! - `Syncing`: the write queue is being flushed
//!
//! All transitions go through a `watch` channel, which serializes mutations
//! from the heartbeat task, the platform listener and the write queue.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::offline::OfflineDetector;
use crate::platform::{HeartbeatProbe, NetworkEvent, Reachability};

/// Default interval between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Default bound on a single heartbeat probe.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Supplies the number of queued writes when the monitor starts.
pub type QueueCountFn = Arc<dyn Fn() -> BoxFuture<'static, usize> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityStatus {
  Online,
  Offline,
  Syncing,
  Degraded,
  Queued,
}

impl fmt::Display for ConnectivityStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ConnectivityStatus::Online => "online",
      ConnectivityStatus::Offline => "offline",
      ConnectivityStatus::Syncing => "syncing",
      ConnectivityStatus::Degraded => "degraded",
      ConnectivityStatus::Queued => "queued",
    };
    f.write_str(name)
  }
}

/// Snapshot observed by the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityState {
  pub status: ConnectivityStatus,
  pub queued_count: usize,
  pub last_heartbeat: Option<DateTime<Utc>>,
  pub is_offline: bool,
}

impl Default for ConnectivityState {
  fn default() -> Self {
    Self {
      status: ConnectivityStatus::Online,
      queued_count: 0,
      last_heartbeat: None,
      is_offline: false,
    }
  }
}

impl ConnectivityState {
  /// Status after a full recompute. Degraded is only entered via a failed heartbeat.
  fn derive_status(&self, syncing: bool) -> ConnectivityStatus {
    if syncing {
      ConnectivityStatus::Syncing
    } else if self.queued_count > 0 {
      ConnectivityStatus::Queued
    } else if self.is_offline {
      ConnectivityStatus::Offline
    } else {
      ConnectivityStatus::Online
    }
  }
}

struct MonitorInner {
  state: watch::Sender<ConnectivityState>,
  offline: OfflineDetector,
  reachability: Arc<dyn Reachability>,
  probe: Arc<dyn HeartbeatProbe>,
  interval: Duration,
  timeout: Duration,
  syncing: AtomicBool,
  /// Whether the last heartbeat since going offline succeeded
  confirmed: AtomicBool,
  started: AtomicBool,
  recovery: broadcast::Sender<()>,
  heartbeat: Mutex<Option<JoinHandle<()>>>,
  listener: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Owner of the connectivity state.
///
/// Inert until [`start`](Self::start); [`stop`](Self::stop) tears down the
/// heartbeat timer and the platform listener.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
  pub fn new(
    offline: OfflineDetector,
    reachability: Arc<dyn Reachability>,
    probe: Arc<dyn HeartbeatProbe>,
  ) -> Self {
    Self::with_heartbeat(
      offline,
      reachability,
      probe,
      DEFAULT_HEARTBEAT_INTERVAL,
      DEFAULT_HEARTBEAT_TIMEOUT,
    )
  }

  pub fn with_heartbeat(
    offline: OfflineDetector,
    reachability: Arc<dyn Reachability>,
    probe: Arc<dyn HeartbeatProbe>,
    interval: Duration,
    timeout: Duration,
  ) -> Self {
    let (state, _) = watch::channel(ConnectivityState::default());
    let (recovery, _) = broadcast::channel(4);
    Self {
      inner: Arc::new(MonitorInner {
        state,
        offline,
        reachability,
        probe,
        interval,
        timeout,
        syncing: AtomicBool::new(false),
        confirmed: AtomicBool::new(false),
        started: AtomicBool::new(false),
        recovery,
        heartbeat: Mutex::new(None),
        listener: Mutex::new(None),
      }),
    }
  }

  /// Current state.
  pub fn state(&self) -> ConnectivityState {
    self.inner.state.borrow().clone()
  }

  /// Watch state changes.
  pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
    self.inner.state.subscribe()
  }

  /// Notified whenever a heartbeat confirms the API is usable after an
  /// outage, or while writes are still queued.
  pub fn subscribe_recovery(&self) -> broadcast::Receiver<()> {
    self.inner.recovery.subscribe()
  }

  /// Recompute everything once, then follow platform events and heartbeats.
  pub async fn start(&self, queue_count: QueueCountFn) {
    if self.inner.started.swap(true, Ordering::SeqCst) {
      tracing::warn!("connectivity monitor already started");
      return;
    }

    let queued_count = queue_count().await;
    let is_offline = self.inner.offline.is_offline_mode().await;
    let syncing = self.inner.syncing.load(Ordering::SeqCst);
    self.inner.state.send_modify(|state| {
      state.queued_count = queued_count;
      state.is_offline = is_offline;
      state.status = state.derive_status(syncing);
    });

    if !is_offline {
      self.heartbeat_once().await;
      self.start_heartbeat();
    }

    let mut events = self.inner.reachability.subscribe();
    let monitor = self.clone();
    let listener = tokio::spawn(async move {
      loop {
        match events.recv().await {
          Ok(NetworkEvent::Reachable) => monitor.handle_reachable().await,
          Ok(NetworkEvent::Unreachable) => monitor.handle_unreachable(),
          Err(broadcast::error::RecvError::Lagged(missed)) => {
            tracing::debug!(missed, "missed network events, resyncing");
            if monitor.inner.reachability.is_reachable() {
              monitor.handle_reachable().await;
            } else {
              monitor.handle_unreachable();
            }
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    });
    *lock(&self.inner.listener) = Some(listener);

    tracing::info!(state = ?self.state(), "connectivity monitor started");
  }

  /// Stop the heartbeat timer and detach from platform events.
  pub fn stop(&self) {
    self.stop_heartbeat();
    if let Some(listener) = lock(&self.inner.listener).take() {
      listener.abort();
    }
    self.inner.started.store(false, Ordering::SeqCst);
  }

  async fn handle_reachable(&self) {
    if self.inner.offline.override_active().await {
      tracing::info!("network reachable, but offline mode is forced");
      return;
    }

    tracing::info!("network reachable");
    let syncing = self.inner.syncing.load(Ordering::SeqCst);
    self.inner.state.send_modify(|state| {
      state.is_offline = false;
      state.status = state.derive_status(syncing);
    });

    self.heartbeat_once().await;
    self.start_heartbeat();
  }

  fn handle_unreachable(&self) {
    tracing::info!("network unreachable");
    self.stop_heartbeat();
    self.inner.confirmed.store(false, Ordering::SeqCst);
    self.inner.state.send_modify(|state| {
      state.is_offline = true;
      state.status = if state.queued_count > 0 {
        ConnectivityStatus::Queued
      } else {
        ConnectivityStatus::Offline
      };
    });
  }

  fn start_heartbeat(&self) {
    let mut slot = lock(&self.inner.heartbeat);
    if slot.as_ref().is_some_and(|task| !task.is_finished()) {
      return;
    }

    let monitor = self.clone();
    let period = self.inner.interval;
    *slot = Some(tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let is_offline = monitor.inner.state.borrow().is_offline;
        if is_offline {
          continue;
        }
        monitor.heartbeat_once().await;
      }
    }));
  }

  fn stop_heartbeat(&self) {
    if let Some(task) = lock(&self.inner.heartbeat).take() {
      task.abort();
    }
  }

  /// Probe the API once and apply the outcome.
  pub async fn heartbeat_once(&self) {
    let outcome = tokio::time::timeout(self.inner.timeout, self.inner.probe.probe()).await;

    match outcome {
      Ok(Ok(())) => {
        let was_confirmed = self.inner.confirmed.swap(true, Ordering::SeqCst);
        let syncing = self.inner.syncing.load(Ordering::SeqCst);
        let mut queued_count = 0;
        self.inner.state.send_modify(|state| {
          state.last_heartbeat = Some(Utc::now());
          // The network dropped while the probe was in flight
          if !syncing && !state.is_offline {
            state.status = if state.queued_count > 0 {
              ConnectivityStatus::Queued
            } else {
              ConnectivityStatus::Online
            };
          }
          queued_count = state.queued_count;
        });

        if !was_confirmed || queued_count > 0 {
          tracing::debug!(queued_count, "heartbeat confirmed connectivity");
          // No subscribers is fine
          let _ = self.inner.recovery.send(());
        }
      }
      Ok(Err(e)) => self.mark_degraded(&e.to_string()),
      Err(_) => self.mark_degraded("heartbeat timed out"),
    }
  }

  fn mark_degraded(&self, reason: &str) {
    tracing::info!(reason, "heartbeat failed, connectivity degraded");
    self.inner.confirmed.store(false, Ordering::SeqCst);
    let syncing = self.inner.syncing.load(Ordering::SeqCst);
    self.inner.state.send_modify(|state| {
      if !state.is_offline && !syncing {
        state.status = ConnectivityStatus::Degraded;
      }
    });
  }

  /// Record the number of queued writes.
  pub fn set_queued_count(&self, count: usize) {
    let syncing = self.inner.syncing.load(Ordering::SeqCst);
    self.inner.state.send_modify(|state| {
      state.queued_count = count;
      // A running flush keeps Syncing until set_syncing(false)
      state.status = if syncing {
        ConnectivityStatus::Syncing
      } else if count > 0 {
        ConnectivityStatus::Queued
      } else if state.is_offline {
        ConnectivityStatus::Offline
      } else {
        ConnectivityStatus::Online
      };
    });
  }

  /// Flag a queue flush as running. Clearing the flag recomputes everything.
  pub async fn set_syncing(&self, syncing: bool) {
    self.inner.syncing.store(syncing, Ordering::SeqCst);
    if syncing {
      self.inner.state.send_modify(|state| {
        state.status = ConnectivityStatus::Syncing;
      });
    } else {
      self.update_connectivity().await;
    }
  }

  /// Re-derive the offline flag and status, e.g. after the override changed.
  pub async fn update_connectivity(&self) {
    let is_offline = self.inner.offline.is_offline_mode().await;
    let syncing = self.inner.syncing.load(Ordering::SeqCst);
    let mut was_offline = false;
    self.inner.state.send_modify(|state| {
      was_offline = state.is_offline;
      state.is_offline = is_offline;
      state.status = state.derive_status(syncing);
    });

    if !self.inner.started.load(Ordering::SeqCst) {
      return;
    }
    if is_offline {
      self.stop_heartbeat();
      self.inner.confirmed.store(false, Ordering::SeqCst);
    } else {
      if was_offline {
        // Confirm the API right away so queued writes don't wait a full interval
        self.heartbeat_once().await;
      }
      self.start_heartbeat();
    }
  }
}
