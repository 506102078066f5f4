//! Shared types and lifecycle traits used across the supervisor's subsystems.
//!
//! A small, dependency-free place for identifiers and the lifecycle trait
//! every long-running subsystem implements, so the supervisor can treat
//! gossip membership, eviction, snapshotting, and bootstrap uniformly.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Identifier for a cluster member, keyed by [`crate::membership::Member::name`].
pub type NodeId = String;

/// Health of a supervised subsystem, surfaced through the admin listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Fully operational.
    Healthy,
    /// Operational but degraded (e.g. below quorum).
    Degraded,
    /// Not operational.
    Unhealthy,
    /// Not yet started or status could not be determined.
    Unknown,
}

impl HealthStatus {
    pub fn is_functional(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

/// Lifecycle contract for a subsystem owned by the [`crate::supervisor::Supervisor`].
///
/// Unlike a synchronous component trait, every method here suspends: starting
/// a subsystem means spawning tasks and waiting for their first tick, and
/// shutting one down means waiting for those tasks to observe cancellation.
#[async_trait]
pub trait SupervisedComponent: Send + Sync {
    /// Human-readable name used in log fields and health reports.
    fn name(&self) -> &str;

    /// Tear the subsystem down. Must be idempotent.
    async fn shutdown(&self) -> Result<()>;

    /// Current health, used by the admin `Health` endpoint and by tests.
    async fn health_check(&self) -> HealthStatus;
}
