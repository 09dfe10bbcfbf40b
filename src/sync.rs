//! Offline write queue.
//!
//! Writes attempted while offline are persisted as [`QueuedWrite`]s and
//! replayed in FIFO order once connectivity recovers. Each replayed item is
//! deleted individually; a failing item stays queued without blocking the
//! ones behind it.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cache::PersistentStore;
use crate::connectivity::{ConnectivityMonitor, QueueCountFn};
use crate::offline::OfflineDetector;

/// Store key holding the queue.
pub const QUEUE_KEY: &str = "sync:queue";

/// Partial update of user settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsPatch {
  pub values: Map<String, Value>,
}

/// Message composed while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDraft {
  pub recipients: Vec<String>,
  pub subject: String,
  pub body: String,
}

/// Absence excuse submitted by a parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbsenceNote {
  pub student_id: String,
  pub date: NaiveDate,
  pub reason: String,
}

/// A write that can be queued. Adding a kind means adding a variant here and
/// a method on [`WriteReplayer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WriteOp {
  SettingsPatch(SettingsPatch),
  MessageDraft(MessageDraft),
  AbsenceNote(AbsenceNote),
}

impl WriteOp {
  pub fn kind(&self) -> &'static str {
    match self {
      WriteOp::SettingsPatch(_) => "settings_patch",
      WriteOp::MessageDraft(_) => "message_draft",
      WriteOp::AbsenceNote(_) => "absence_note",
    }
  }
}

/// A persisted write awaiting replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedWrite {
  pub id: u64,
  pub op: WriteOp,
  pub enqueued_at: DateTime<Utc>,
  /// Failed replay attempts so far
  #[serde(default)]
  pub attempts: u32,
}

/// Sends queued writes to the remote API, one method per write kind.
#[async_trait]
pub trait WriteReplayer: Send + Sync {
  async fn settings_patch(&self, patch: &SettingsPatch) -> Result<()>;

  async fn message_draft(&self, draft: &MessageDraft) -> Result<()>;

  async fn absence_note(&self, note: &AbsenceNote) -> Result<()>;
}

async fn replay(replayer: &dyn WriteReplayer, op: &WriteOp) -> Result<()> {
  match op {
    WriteOp::SettingsPatch(patch) => replayer.settings_patch(patch).await,
    WriteOp::MessageDraft(draft) => replayer.message_draft(draft).await,
    WriteOp::AbsenceNote(note) => replayer.absence_note(note).await,
  }
}

/// Outcome of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
  pub replayed: usize,
  pub failed: usize,
  pub remaining: usize,
  /// The flush did not run (offline, already flushing, or unreadable queue)
  pub skipped: bool,
}

struct QueueInner {
  store: Arc<dyn PersistentStore>,
  replayer: Arc<dyn WriteReplayer>,
  offline: OfflineDetector,
  monitor: Option<ConnectivityMonitor>,
  /// Serializes read-modify-write cycles on the persisted list
  edit: tokio::sync::Mutex<()>,
  flushing: AtomicBool,
  auto_flush: Mutex<Option<JoinHandle<()>>>,
}

/// Clears the flushing flag when a flush ends, however it ends.
struct FlushFlag<'a>(&'a AtomicBool);

impl Drop for FlushFlag<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

/// Durable FIFO of writes made while offline.
#[derive(Clone)]
pub struct WriteQueue {
  inner: Arc<QueueInner>,
}

impl WriteQueue {
  pub fn new(
    store: Arc<dyn PersistentStore>,
    replayer: Arc<dyn WriteReplayer>,
    offline: OfflineDetector,
    monitor: Option<ConnectivityMonitor>,
  ) -> Self {
    Self {
      inner: Arc::new(QueueInner {
        store,
        replayer,
        offline,
        monitor,
        edit: tokio::sync::Mutex::new(()),
        flushing: AtomicBool::new(false),
        auto_flush: Mutex::new(None),
      }),
    }
  }

  async fn load_items(&self) -> Result<Vec<QueuedWrite>> {
    match self.inner.store.get(QUEUE_KEY).await? {
      None => Ok(Vec::new()),
      Some(raw) => serde_json::from_value(raw).map_err(|e| eyre!("Corrupt write queue: {}", e)),
    }
  }

  async fn save_items(&self, items: &[QueuedWrite]) -> Result<()> {
    let raw = serde_json::to_value(items).map_err(|e| eyre!("Failed to serialize write queue: {}", e))?;
    self.inner.store.set(QUEUE_KEY, raw).await
  }

  fn report_count(&self, count: usize) {
    if let Some(monitor) = &self.inner.monitor {
      monitor.set_queued_count(count);
    }
  }

  /// Persist a write for later replay.
  pub async fn enqueue(&self, op: WriteOp) -> Result<QueuedWrite> {
    let (item, count) = {
      let _edit = self.inner.edit.lock().await;
      let mut items = self.load_items().await?;
      let id = items.iter().map(|item| item.id).max().map_or(1, |max| max + 1);
      let item = QueuedWrite {
        id,
        op,
        enqueued_at: Utc::now(),
        attempts: 0,
      };
      items.push(item.clone());
      self.save_items(&items).await?;
      (item, items.len())
    };

    tracing::info!(id = item.id, kind = item.op.kind(), queued = count, "write queued");
    self.report_count(count);
    Ok(item)
  }

  /// Queued writes in replay order.
  pub async fn pending(&self) -> Result<Vec<QueuedWrite>> {
    self.load_items().await
  }

  /// Number of queued writes; an unreadable queue counts as empty.
  pub async fn len(&self) -> usize {
    match self.load_items().await {
      Ok(items) => items.len(),
      Err(e) => {
        tracing::warn!(error = %e, "failed to read write queue");
        0
      }
    }
  }

  pub async fn is_empty(&self) -> bool {
    self.len().await == 0
  }

  /// Supplier for [`ConnectivityMonitor::start`].
  pub fn queue_count_fn(&self) -> QueueCountFn {
    let queue = self.clone();
    Arc::new(move || {
      let queue = queue.clone();
      async move { queue.len().await }.boxed()
    })
  }

  /// Remove a replayed item. Returns how many remain.
  async fn remove(&self, id: u64) -> Result<usize> {
    let _edit = self.inner.edit.lock().await;
    let mut items = self.load_items().await?;
    items.retain(|item| item.id != id);
    self.save_items(&items).await?;
    Ok(items.len())
  }

  async fn record_failure(&self, id: u64) -> Result<()> {
    let _edit = self.inner.edit.lock().await;
    let mut items = self.load_items().await?;
    if let Some(item) = items.iter_mut().find(|item| item.id == id) {
      item.attempts += 1;
    }
    self.save_items(&items).await
  }

  /// Replay every queued write in FIFO order.
  ///
  /// Successful items are deleted one by one; failed items stay queued and
  /// the flush moves on to the next one.
  pub async fn flush_all(&self) -> FlushReport {
    if self.inner.flushing.swap(true, Ordering::SeqCst) {
      tracing::debug!("flush already running");
      return FlushReport {
        skipped: true,
        ..Default::default()
      };
    }
    let _flag = FlushFlag(&self.inner.flushing);

    if self.inner.offline.is_offline_mode().await {
      tracing::debug!("offline, not flushing write queue");
      return FlushReport {
        remaining: self.len().await,
        skipped: true,
        ..Default::default()
      };
    }

    let items = match self.load_items().await {
      Ok(items) => items,
      Err(e) => {
        tracing::warn!(error = %e, "failed to read write queue");
        return FlushReport {
          skipped: true,
          ..Default::default()
        };
      }
    };
    if items.is_empty() {
      return FlushReport::default();
    }

    if let Some(monitor) = &self.inner.monitor {
      monitor.set_syncing(true).await;
    }

    let mut report = FlushReport::default();
    for item in items {
      match replay(self.inner.replayer.as_ref(), &item.op).await {
        Ok(()) => {
          report.replayed += 1;
          match self.remove(item.id).await {
            Ok(remaining) => self.report_count(remaining),
            // It will be replayed again on the next flush
            Err(e) => tracing::warn!(id = item.id, error = %e, "failed to delete replayed write"),
          }
        }
        Err(e) => {
          report.failed += 1;
          tracing::warn!(
            id = item.id,
            kind = item.op.kind(),
            attempts = item.attempts + 1,
            error = %e,
            "replay failed, keeping write queued"
          );
          if let Err(e) = self.record_failure(item.id).await {
            tracing::warn!(id = item.id, error = %e, "failed to record replay failure");
          }
        }
      }
    }

    report.remaining = self.len().await;
    self.report_count(report.remaining);
    if let Some(monitor) = &self.inner.monitor {
      monitor.set_syncing(false).await;
    }

    tracing::info!(
      replayed = report.replayed,
      failed = report.failed,
      remaining = report.remaining,
      "write queue flushed"
    );
    report
  }

  /// Flush whenever `monitor` signals that connectivity recovered.
  pub fn spawn_auto_flush(&self, monitor: &ConnectivityMonitor) {
    let mut recovery = monitor.subscribe_recovery();
    let queue = self.clone();
    let task = tokio::spawn(async move {
      loop {
        match recovery.recv().await {
          Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
            queue.flush_all().await;
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    });

    let mut slot = self.inner.auto_flush.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(previous) = slot.replace(task) {
      previous.abort();
    }
  }

  pub fn stop_auto_flush(&self) {
    let task = self
      .inner
      .auto_flush
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .take();
    if let Some(task) = task {
      task.abort();
    }
  }
}
