//! Supervisor for an embedded Raft-replicated key-value store.
//!
//! Co-locates, on every node, a peer-discovery gossip membership layer
//! ([`membership`]), a cluster bootstrap/join/recovery state machine
//! ([`bootstrap`]) that drives the embedded engine through its lifecycle, a
//! quorum-gated eviction controller ([`eviction`]), and a periodic snapshot
//! pipeline ([`snapshot`]) with optional compression and authenticated
//! encryption. [`supervisor`] owns the lifecycle of all four.

pub mod admin;
pub mod bootstrap;
pub mod cluster_info;
pub mod common;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod eviction;
pub mod lock;
pub mod membership;
pub mod snapshot;
pub mod supervisor;

pub use config::Config;
pub use error::{CoreError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
