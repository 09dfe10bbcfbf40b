//! Offline-aware data loading for the school portal client.
//!
//! Reads go through a memory tier, a persistent tier and finally the network
//! ([`loader::DataLoader`]); cached values are served immediately and
//! refreshed in the background. Connectivity is tracked by
//! [`connectivity::ConnectivityMonitor`], and writes made while offline are
//! queued by [`sync::WriteQueue`] until the API is reachable again.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod loader;
pub mod offline;
pub mod platform;
pub mod remote;
pub mod sync;

#[cfg(test)]
mod testing;

pub use context::{Collaborators, SatchelContext};
