//! Tiered cache storage.
//!
//! This module provides the two cache tiers checked before the network:
//! - `MemoryCache`: process-local, TTL-based, optionally size-bounded
//! - `PersistentCache`: durable tier over any `PersistentStore`
//!
//! Both tiers expire lazily: an entry past its expiry reads as absent.

mod memory;
mod persistent;
mod storage;
mod traits;

pub use memory::MemoryCache;
pub use persistent::PersistentCache;
pub use storage::{NoopStorage, SqliteStorage};
pub use traits::{CacheEntry, Cacheable, PersistentStore, SyncState};
