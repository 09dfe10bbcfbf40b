//! Fakes for the platform collaborators, shared by unit tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::cache::PersistentStore;
use crate::platform::{HeartbeatProbe, SettingsStore};

/// In-memory store counting reads and writes.
#[derive(Default)]
pub struct SpyStore {
  values: Mutex<HashMap<String, Value>>,
  pub gets: AtomicUsize,
  pub sets: AtomicUsize,
}

#[async_trait]
impl PersistentStore for SpyStore {
  async fn get(&self, key: &str) -> Result<Option<Value>> {
    self.gets.fetch_add(1, Ordering::SeqCst);
    Ok(self.values.lock().unwrap().get(key).cloned())
  }

  async fn set(&self, key: &str, value: Value) -> Result<()> {
    self.sets.fetch_add(1, Ordering::SeqCst);
    self.values.lock().unwrap().insert(key.to_string(), value);
    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<()> {
    self.values.lock().unwrap().remove(key);
    Ok(())
  }
}

/// Force-offline override that tests can flip.
#[derive(Default)]
pub struct ToggleSettings {
  pub force_offline: AtomicBool,
}

impl ToggleSettings {
  pub fn new(force_offline: bool) -> Self {
    Self {
      force_offline: AtomicBool::new(force_offline),
    }
  }
}

#[async_trait]
impl SettingsStore for ToggleSettings {
  async fn force_offline(&self) -> Result<bool> {
    Ok(self.force_offline.load(Ordering::SeqCst))
  }
}

/// Heartbeat probe whose outcome tests control.
pub struct FakeProbe {
  pub healthy: AtomicBool,
  pub calls: AtomicUsize,
  pub delay: Option<Duration>,
}

impl FakeProbe {
  pub fn new(healthy: bool) -> Self {
    Self {
      healthy: AtomicBool::new(healthy),
      calls: AtomicUsize::new(0),
      delay: None,
    }
  }

  pub fn hanging(delay: Duration) -> Self {
    Self {
      delay: Some(delay),
      ..Self::new(true)
    }
  }
}

#[async_trait]
impl HeartbeatProbe for FakeProbe {
  async fn probe(&self) -> Result<()> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    if self.healthy.load(Ordering::SeqCst) {
      Ok(())
    } else {
      Err(eyre!("503 Service Unavailable"))
    }
  }
}
