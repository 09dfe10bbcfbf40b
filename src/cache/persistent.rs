//! Persistent tier layered over a [`PersistentStore`].

use chrono::Duration;
use serde_json::Value;
use std::sync::Arc;

use super::traits::{CacheEntry, PersistentStore};

/// Store keys used by this tier are prefixed so cached data never collides
/// with the write queue or settings kept in the same store.
const KEY_PREFIX: &str = "cache:";

/// Durable cache tier. Survives restarts; slower than memory.
///
/// Every store failure is logged and degrades to a miss (reads) or a no-op
/// (writes).
#[derive(Clone)]
pub struct PersistentCache {
  store: Arc<dyn PersistentStore>,
}

impl PersistentCache {
  pub fn new(store: Arc<dyn PersistentStore>) -> Self {
    Self { store }
  }

  fn store_key(key: &str) -> String {
    format!("{}{}", KEY_PREFIX, key)
  }

  /// Get a live value for `key`.
  pub async fn get(&self, key: &str) -> Option<Value> {
    let raw = match self.store.get(&Self::store_key(key)).await {
      Ok(Some(raw)) => raw,
      Ok(None) => return None,
      Err(e) => {
        tracing::warn!(key, error = %e, "persistent cache read failed");
        return None;
      }
    };

    let entry: CacheEntry = match serde_json::from_value(raw) {
      Ok(entry) => entry,
      Err(e) => {
        tracing::warn!(key, error = %e, "discarding unreadable persistent cache entry");
        self.remove(key).await;
        return None;
      }
    };

    if entry.is_expired() {
      self.remove(key).await;
      return None;
    }

    Some(entry.value)
  }

  /// Store `value` under `key`, expiring after `ttl` (never if `None`).
  pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
    let entry = CacheEntry::new(key, value, ttl);
    let raw = match serde_json::to_value(&entry) {
      Ok(raw) => raw,
      Err(e) => {
        tracing::warn!(key, error = %e, "failed to serialize cache entry");
        return;
      }
    };

    if let Err(e) = self.store.set(&Self::store_key(key), raw).await {
      tracing::warn!(key, error = %e, "persistent cache write failed");
    }
  }

  pub async fn remove(&self, key: &str) {
    if let Err(e) = self.store.delete(&Self::store_key(key)).await {
      tracing::warn!(key, error = %e, "persistent cache delete failed");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::SqliteStorage;
  use async_trait::async_trait;
  use color_eyre::{eyre::eyre, Result};
  use serde_json::json;

  struct BrokenStore;

  #[async_trait]
  impl PersistentStore for BrokenStore {
    async fn get(&self, _key: &str) -> Result<Option<Value>> {
      Err(eyre!("disk on fire"))
    }

    async fn set(&self, _key: &str, _value: Value) -> Result<()> {
      Err(eyre!("disk on fire"))
    }

    async fn delete(&self, _key: &str) -> Result<()> {
      Err(eyre!("disk on fire"))
    }
  }

  #[tokio::test]
  async fn test_round_trip() {
    let cache = PersistentCache::new(Arc::new(SqliteStorage::open_in_memory().unwrap()));
    let value = json!({"lessons": [{"subject": "Biology", "room": "B12"}]});
    cache.set("timetable", value.clone(), Some(Duration::minutes(10))).await;
    assert_eq!(cache.get("timetable").await, Some(value));
  }

  #[tokio::test]
  async fn test_expired_entry_is_absent() {
    let store = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let cache = PersistentCache::new(store.clone());
    cache.set("timetable", json!(1), Some(Duration::milliseconds(-1))).await;
    assert_eq!(cache.get("timetable").await, None);
    assert_eq!(store.get("cache:timetable").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_store_failures_degrade_to_miss() {
    let cache = PersistentCache::new(Arc::new(BrokenStore));
    cache.set("timetable", json!(1), None).await;
    assert_eq!(cache.get("timetable").await, None);
  }

  #[tokio::test]
  async fn test_unreadable_entry_is_discarded() {
    let store = Arc::new(SqliteStorage::open_in_memory().unwrap());
    store.set("cache:timetable", json!("not an entry")).await.unwrap();
    let cache = PersistentCache::new(store.clone());
    assert_eq!(cache.get("timetable").await, None);
    assert_eq!(store.get("cache:timetable").await.unwrap(), None);
  }
}
