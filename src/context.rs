//! Application context owning every long-lived component.

use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{MemoryCache, PersistentCache, PersistentStore};
use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::loader::DataLoader;
use crate::offline::OfflineDetector;
use crate::platform::{HeartbeatProbe, Reachability, StoredSettings};
use crate::sync::{WriteQueue, WriteReplayer};

/// Collaborators supplied by the host.
pub struct Collaborators {
  pub store: Arc<dyn PersistentStore>,
  pub reachability: Arc<dyn Reachability>,
  pub probe: Arc<dyn HeartbeatProbe>,
  pub replayer: Arc<dyn WriteReplayer>,
}

/// Wires the cache tiers, offline detector, connectivity monitor and write
/// queue together. Construct one per process and call [`start`](Self::start).
pub struct SatchelContext {
  settings: Arc<StoredSettings>,
  offline: OfflineDetector,
  loader: DataLoader,
  monitor: ConnectivityMonitor,
  queue: WriteQueue,
  default_ttl: Duration,
}

impl SatchelContext {
  pub fn new(config: &Config, collaborators: Collaborators) -> Self {
    let Collaborators {
      store,
      reachability,
      probe,
      replayer,
    } = collaborators;

    let settings = Arc::new(StoredSettings::new(store.clone()));
    let offline = OfflineDetector::new(settings.clone(), reachability.clone())
      .with_ttl(config.offline.flag_ttl());

    let memory = Arc::new(match config.cache.memory_max_entries {
      Some(max) => MemoryCache::new().with_max_entries(max),
      None => MemoryCache::new(),
    });
    let loader = DataLoader::new(memory, PersistentCache::new(store.clone()), offline.clone());

    let monitor = ConnectivityMonitor::with_heartbeat(
      offline.clone(),
      reachability,
      probe,
      config.heartbeat.interval(),
      config.heartbeat.timeout(),
    );
    let queue = WriteQueue::new(store, replayer, offline.clone(), Some(monitor.clone()));

    Self {
      settings,
      offline,
      loader,
      monitor,
      queue,
      default_ttl: config.default_ttl(),
    }
  }

  /// TTL applied to loads that don't set their own.
  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  pub fn loader(&self) -> &DataLoader {
    &self.loader
  }

  pub fn monitor(&self) -> &ConnectivityMonitor {
    &self.monitor
  }

  pub fn queue(&self) -> &WriteQueue {
    &self.queue
  }

  pub fn offline(&self) -> &OfflineDetector {
    &self.offline
  }

  /// Start connectivity monitoring and flush-on-recovery.
  pub async fn start(&self) {
    self.queue.spawn_auto_flush(&self.monitor);
    self.monitor.start(self.queue.queue_count_fn()).await;
  }

  /// Turn the force-offline override on or off and re-evaluate connectivity.
  pub async fn set_force_offline(&self, enabled: bool) -> Result<()> {
    self.settings.set_force_offline(enabled).await?;
    self.offline.invalidate_cache();
    self.monitor.update_connectivity().await;
    tracing::info!(enabled, "force-offline override changed");
    Ok(())
  }

  /// Stop every background task owned by the context.
  pub async fn shutdown(&self) {
    self.monitor.stop();
    self.queue.stop_auto_flush();
    self.loader.shutdown().await;
    tracing::debug!("context shut down");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::connectivity::ConnectivityStatus;
  use crate::loader::LoadOptions;
  use crate::platform::ManualReachability;
  use crate::sync::{AbsenceNote, MessageDraft, SettingsPatch, WriteOp};
  use crate::testing::FakeProbe;
  use async_trait::async_trait;
  use chrono::NaiveDate;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[derive(Default)]
  struct CountingReplayer {
    notes: AtomicUsize,
  }

  #[async_trait]
  impl WriteReplayer for CountingReplayer {
    async fn settings_patch(&self, _patch: &SettingsPatch) -> Result<()> {
      Err(eyre!("unexpected settings patch"))
    }

    async fn message_draft(&self, _draft: &MessageDraft) -> Result<()> {
      Err(eyre!("unexpected message"))
    }

    async fn absence_note(&self, _note: &AbsenceNote) -> Result<()> {
      self.notes.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  }

  struct Harness {
    context: SatchelContext,
    reachability: Arc<ManualReachability>,
    replayer: Arc<CountingReplayer>,
  }

  fn harness(reachable: bool) -> Harness {
    let mut config = Config::default();
    config.heartbeat.interval_secs = 1;
    let reachability = Arc::new(ManualReachability::new(reachable));
    let replayer = Arc::new(CountingReplayer::default());
    let context = SatchelContext::new(
      &config,
      Collaborators {
        store: Arc::new(SqliteStorage::open_in_memory().unwrap()),
        reachability: reachability.clone(),
        probe: Arc::new(FakeProbe::new(true)),
        replayer: replayer.clone(),
      },
    );
    Harness {
      context,
      reachability,
      replayer,
    }
  }

  fn note() -> WriteOp {
    WriteOp::AbsenceNote(AbsenceNote {
      student_id: "s-42".to_string(),
      date: NaiveDate::from_ymd_opt(2026, 10, 16).unwrap(),
      reason: "Flu".to_string(),
    })
  }

  #[tokio::test]
  async fn test_force_offline_round_trip() {
    let h = harness(true);
    h.context.start().await;
    assert_eq!(h.context.monitor().state().status, ConnectivityStatus::Online);

    h.context.set_force_offline(true).await.unwrap();
    assert!(h.context.offline().is_offline_mode().await);
    assert_eq!(h.context.monitor().state().status, ConnectivityStatus::Offline);

    h.context.set_force_offline(false).await.unwrap();
    assert!(!h.context.offline().is_offline_mode().await);
    assert_eq!(h.context.monitor().state().status, ConnectivityStatus::Online);

    h.context.shutdown().await;
  }

  #[tokio::test]
  async fn test_queued_write_flushes_after_reconnect() {
    let h = harness(false);
    h.context.start().await;

    h.context.queue().enqueue(note()).await.unwrap();
    assert_eq!(h.context.monitor().state().status, ConnectivityStatus::Queued);

    let mut rx = h.context.monitor().subscribe();
    h.reachability.set_reachable(true);
    tokio::time::timeout(
      Duration::from_secs(2),
      rx.wait_for(|state| state.status == ConnectivityStatus::Online && state.queued_count == 0),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(h.replayer.notes.load(Ordering::SeqCst), 1);
    assert!(h.context.queue().is_empty().await);
    h.context.shutdown().await;
  }

  #[tokio::test]
  async fn test_loader_serves_persisted_value_while_offline() {
    let h = harness(true);
    let first = h
      .context
      .loader()
      .load(LoadOptions::new("timetable", || async { Ok(vec![1u32, 2, 3]) }))
      .await;
    assert_eq!(first, Some(vec![1, 2, 3]));

    h.context.set_force_offline(true).await.unwrap();
    h.context.loader().clear_memory();
    let cached = h
      .context
      .loader()
      .load(LoadOptions::new("timetable", || async {
        Err::<Vec<u32>, _>(eyre!("offline"))
      }))
      .await;
    assert_eq!(cached, Some(vec![1, 2, 3]));

    h.context.shutdown().await;
  }
}
