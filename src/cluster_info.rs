//! The single persisted row the supervisor keeps inside the engine's own
//! keyspace, plus the volatile-prefix bookkeeping around snapshot restore.
//!
//! Rather than a general reflection/ORM layer, `ClusterInfo` gets a
//! hand-written codec pair on the type itself: `encode`/`decode` backed by
//! `serde_json`, an explicit codec per persisted type instead of a generic
//! serialization framework.

use crate::engine::KvEngine;
use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved key-prefix. Everything under it is discarded on snapshot restore.
pub const VOLATILE_PREFIX: &[u8] = b"/_e2d";

/// Key holding the encoded [`ClusterInfo`] row.
pub const CLUSTER_INFO_KEY: &[u8] = b"/_e2d/cluster_info";

/// Key written after a snapshot restore, value is an RFC3339 timestamp.
pub const SNAPSHOT_MARKER_KEY: &[u8] = b"/_e2d/snapshot";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub id: u64,
    pub created: DateTime<Utc>,
    pub required_cluster_size: u32,
}

impl ClusterInfo {
    pub fn new(required_cluster_size: u32) -> Self {
        Self {
            id: 1,
            created: Utc::now(),
            required_cluster_size,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(CoreError::from)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(CoreError::from)
    }
}

/// Read `ClusterInfo`, or insert it if absent. Fails loudly with
/// [`CoreError::MembershipViolation`] if a row already exists with a
/// different `required_cluster_size`: the invariant is immutable for the
/// life of the cluster.
///
/// Callers are expected to hold the cluster-info distributed lock (see
/// `crate::lock`) for the duration of this call.
pub async fn read_or_insert(engine: &dyn KvEngine, required_cluster_size: u32) -> Result<ClusterInfo> {
    match engine.get(CLUSTER_INFO_KEY).await? {
        Some(bytes) => {
            let existing = ClusterInfo::decode(&bytes)?;
            if existing.required_cluster_size != required_cluster_size {
                return Err(CoreError::MembershipViolation(format!(
                    "cluster RequiredClusterSize is {}, this node is configured with {}",
                    existing.required_cluster_size, required_cluster_size
                )));
            }
            Ok(existing)
        }
        None => {
            let info = ClusterInfo::new(required_cluster_size);
            engine.put(CLUSTER_INFO_KEY, &info.encode()?).await?;
            Ok(info)
        }
    }
}

/// Clear everything under [`VOLATILE_PREFIX`] and write the snapshot
/// marker. Both writes bypass Raft ordering and are deterministic across
/// members, so every node in a restored cluster reaches the same state
/// without coordination.
pub async fn clear_volatile_and_mark_restored(engine: &dyn KvEngine) -> Result<()> {
    engine.delete_prefix(VOLATILE_PREFIX).await?;
    let marker = Utc::now().to_rfc3339();
    engine.put(SNAPSHOT_MARKER_KEY, marker.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::FakeEngine;

    #[test]
    fn encode_decode_round_trips() {
        let info = ClusterInfo::new(3);
        let bytes = info.encode().unwrap();
        let back = ClusterInfo::decode(&bytes).unwrap();
        assert_eq!(info, back);
    }

    #[tokio::test]
    async fn read_or_insert_rejects_size_mismatch() {
        let engine = FakeEngine::new();
        read_or_insert(&engine, 3).await.unwrap();
        let err = read_or_insert(&engine, 5).await.unwrap_err();
        assert!(matches!(err, CoreError::MembershipViolation(_)));
    }

    #[tokio::test]
    async fn restore_leaves_only_marker_under_volatile_prefix() {
        let engine = FakeEngine::new();
        read_or_insert(&engine, 3).await.unwrap();
        clear_volatile_and_mark_restored(&engine).await.unwrap();
        assert!(engine.get(CLUSTER_INFO_KEY).await.unwrap().is_none());
        assert!(engine.get(SNAPSHOT_MARKER_KEY).await.unwrap().is_some());
    }
}
