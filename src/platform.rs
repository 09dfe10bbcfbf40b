//! Platform collaborators: settings, network reachability and liveness probing.
//!
//! The core never talks to the operating system or the remote API directly;
//! it goes through these traits. Concrete implementations for hosts and the
//! CLI live here too.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cache::PersistentStore;

/// Settings key holding the force-offline override.
pub const FORCE_OFFLINE_KEY: &str = "settings:force_offline";

/// Reachability change reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
  /// The network interface came up
  Reachable,
  /// The network interface went down
  Unreachable,
}

/// Source of the force-offline override.
#[async_trait]
pub trait SettingsStore: Send + Sync {
  async fn force_offline(&self) -> Result<bool>;
}

/// Live network-interface state plus change notifications.
pub trait Reachability: Send + Sync {
  fn is_reachable(&self) -> bool;

  fn subscribe(&self) -> broadcast::Receiver<NetworkEvent>;
}

/// Lightweight liveness check against the remote API.
#[async_trait]
pub trait HeartbeatProbe: Send + Sync {
  async fn probe(&self) -> Result<()>;
}

/// Settings kept in the persistent store next to the cache.
pub struct StoredSettings {
  store: Arc<dyn PersistentStore>,
}

impl StoredSettings {
  pub fn new(store: Arc<dyn PersistentStore>) -> Self {
    Self { store }
  }

  /// Persist the override. Callers must invalidate the offline detector after this.
  pub async fn set_force_offline(&self, enabled: bool) -> Result<()> {
    self.store.set(FORCE_OFFLINE_KEY, Value::Bool(enabled)).await
  }
}

#[async_trait]
impl SettingsStore for StoredSettings {
  async fn force_offline(&self) -> Result<bool> {
    match self.store.get(FORCE_OFFLINE_KEY).await? {
      None => Ok(false),
      Some(Value::Bool(enabled)) => Ok(enabled),
      Some(other) => Err(eyre!("Invalid force_offline setting: {}", other)),
    }
  }
}

/// Reachability driven explicitly by the host.
///
/// Hosts that receive connectivity callbacks from their platform forward them
/// through `set_reachable`; tests use it to simulate network changes.
pub struct ManualReachability {
  reachable: AtomicBool,
  tx: broadcast::Sender<NetworkEvent>,
}

impl ManualReachability {
  pub fn new(reachable: bool) -> Self {
    let (tx, _) = broadcast::channel(16);
    Self {
      reachable: AtomicBool::new(reachable),
      tx,
    }
  }

  /// Update the flag and notify subscribers if it changed.
  pub fn set_reachable(&self, reachable: bool) {
    let was = self.reachable.swap(reachable, Ordering::SeqCst);
    if was != reachable {
      self.emit(reachable);
    }
  }

  /// Notify subscribers even if the flag did not change.
  pub fn emit(&self, reachable: bool) {
    self.reachable.store(reachable, Ordering::SeqCst);
    let event = if reachable {
      NetworkEvent::Reachable
    } else {
      NetworkEvent::Unreachable
    };
    // No subscribers is fine
    let _ = self.tx.send(event);
  }
}

impl Reachability for ManualReachability {
  fn is_reachable(&self) -> bool {
    self.reachable.load(Ordering::SeqCst)
  }

  fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
    self.tx.subscribe()
  }
}

/// Reachability derived from periodically opening a TCP connection.
///
/// Used by the CLI, which has no platform connectivity callbacks.
pub struct PolledReachability {
  inner: Arc<ManualReachability>,
  task: JoinHandle<()>,
}

impl PolledReachability {
  /// Start polling `addr` (host:port) every `interval`.
  pub fn spawn(addr: String, interval: Duration, timeout: Duration) -> Self {
    let inner = Arc::new(ManualReachability::new(true));
    let state = Arc::clone(&inner);

    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        let reachable = matches!(
          tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr.as_str())).await,
          Ok(Ok(_))
        );
        tracing::trace!(addr = %addr, reachable, "reachability poll");
        state.set_reachable(reachable);
      }
    });

    Self { inner, task }
  }
}

impl Reachability for PolledReachability {
  fn is_reachable(&self) -> bool {
    self.inner.is_reachable()
  }

  fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
    self.inner.subscribe()
  }
}

impl Drop for PolledReachability {
  fn drop(&mut self) {
    self.task.abort();
  }
}

/// Heartbeat probe issuing a GET against a health endpoint.
pub struct HttpProbe {
  client: reqwest::Client,
  url: url::Url,
}

impl HttpProbe {
  pub fn new(client: reqwest::Client, url: url::Url) -> Self {
    Self { client, url }
  }
}

#[async_trait]
impl HeartbeatProbe for HttpProbe {
  async fn probe(&self) -> Result<()> {
    self
      .client
      .get(self.url.clone())
      .send()
      .await
      .and_then(|response| response.error_for_status())
      .map_err(|e| eyre!("Heartbeat to {} failed: {}", self.url, e))?;
    Ok(())
  }
}
