//! Core traits and types for the caching system.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// Values that can live in any cache tier.
///
/// Both tiers hold values as JSON, so anything serde can round-trip and that
/// can cross task boundaries qualifies.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Cacheable for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A single cached value with its expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: String,
  pub value: Value,
  /// `None` never expires
  pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
  /// Create an entry that expires `ttl` from now.
  pub fn new(key: impl Into<String>, value: Value, ttl: Option<Duration>) -> Self {
    Self {
      key: key.into(),
      value,
      expires_at: ttl.map(|ttl| {
        Utc::now()
          .checked_add_signed(ttl)
          .unwrap_or(DateTime::<Utc>::MAX_UTC)
      }),
    }
  }

  /// Expired entries are treated as absent on read.
  pub fn is_expired(&self) -> bool {
    self.is_expired_at(Utc::now())
  }

  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    self.expires_at.is_some_and(|at| at <= now)
  }
}

/// Outcome of the most recent tier resolution or revalidation for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
  /// Served from a cache tier, possibly stale
  Cached,
  /// Just fetched from the network
  Fresh,
  /// Background revalidation in progress
  Syncing,
  /// Network fetch failed and nothing was cached
  Failed,
}

/// Durable key-value store backing the persistent tier and the write queue.
///
/// Implementations may fail; callers in this crate log failures and degrade
/// to a miss or a no-op.
#[async_trait]
pub trait PersistentStore: Send + Sync {
  /// Read a value, `None` if the key is absent.
  async fn get(&self, key: &str) -> Result<Option<Value>>;

  /// Insert or replace a value.
  async fn set(&self, key: &str, value: Value) -> Result<()>;

  /// Remove a value. Removing an absent key is not an error.
  async fn delete(&self, key: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_entry_without_ttl_never_expires() {
    let entry = CacheEntry::new("k", json!(1), None);
    assert!(!entry.is_expired());
  }

  #[test]
  fn test_huge_ttl_is_clamped_not_unbounded() {
    let entry = CacheEntry::new("k", json!(1), Some(Duration::MAX));
    assert_eq!(entry.expires_at, Some(DateTime::<Utc>::MAX_UTC));
    assert!(!entry.is_expired());
  }

  #[test]
  fn test_entry_expiry_boundary() {
    let entry = CacheEntry::new("k", json!(1), Some(Duration::minutes(10)));
    let expires_at = entry.expires_at.unwrap();
    assert!(!entry.is_expired_at(expires_at - Duration::seconds(1)));
    assert!(entry.is_expired_at(expires_at));
  }
}
