//! Process-local memory tier.

use chrono::{Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::traits::CacheEntry;

/// TTL-based in-memory cache. Fastest tier, lost on restart.
///
/// Expired entries are dropped lazily on read. When `max_entries` is set,
/// inserting into a full cache first sweeps expired entries and then evicts
/// the entry closest to expiry.
#[derive(Debug, Default)]
pub struct MemoryCache {
  entries: Mutex<HashMap<String, CacheEntry>>,
  max_entries: Option<usize>,
}

impl MemoryCache {
  pub fn new() -> Self {
    Self::default()
  }

  /// Bound the number of live entries.
  pub fn with_max_entries(mut self, max_entries: usize) -> Self {
    self.max_entries = Some(max_entries.max(1));
    self
  }

  // Nothing panics while holding the lock, so a poisoned map is still consistent.
  fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Get a live value for `key`.
  pub fn get(&self, key: &str) -> Option<Value> {
    let mut entries = self.entries();
    match entries.get(key) {
      Some(entry) if entry.is_expired() => {
        entries.remove(key);
        None
      }
      Some(entry) => Some(entry.value.clone()),
      None => None,
    }
  }

  /// Store `value` under `key`, expiring after `ttl` (never if `None`).
  pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
    let mut entries = self.entries();

    if let Some(max) = self.max_entries {
      if !entries.contains_key(key) && entries.len() >= max {
        let now = Utc::now();
        entries.retain(|_, entry| !entry.is_expired_at(now));

        if entries.len() >= max {
          let victim = entries
            .values()
            .min_by_key(|entry| entry.expires_at.unwrap_or(chrono::DateTime::<Utc>::MAX_UTC))
            .map(|entry| entry.key.clone());
          if let Some(victim) = victim {
            tracing::debug!(key = %victim, "memory cache full, evicting");
            entries.remove(&victim);
          }
        }
      }
    }

    entries.insert(key.to_string(), CacheEntry::new(key, value, ttl));
  }

  pub fn remove(&self, key: &str) -> bool {
    self.entries().remove(key).is_some()
  }

  pub fn clear(&self) {
    self.entries().clear();
  }

  /// Number of stored entries, including expired ones not yet swept.
  pub fn len(&self) -> usize {
    self.entries().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Drop every expired entry. Returns how many were removed.
  pub fn sweep_expired(&self) -> usize {
    let now = Utc::now();
    let mut entries = self.entries();
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired_at(now));
    before - entries.len()
  }
}
