//! Thin orchestrator owning the cancellable root context and every
//! subsystem's lifecycle.
//!
//! Sequences the five fixed components (bootstrap, eviction, snapshot,
//! gossip, and the engine itself) rather than driving an open-ended
//! component registry, since the set never changes at runtime.

use crate::bootstrap::{BootstrapConfig, BootstrapController};
use crate::cluster_info;
use crate::common::{HealthStatus, SupervisedComponent};
use crate::engine::{KvEngine, PeerSpec};
use crate::error::Result;
use crate::eviction::{EvictionConfig, EvictionController};
use crate::membership::GossipMembership;
use crate::snapshot::SnapshotPipeline;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct SupervisorConfig {
    pub required_cluster_size: u32,
    pub self_peer: PeerSpec,
    pub gossip: Option<Arc<GossipMembership>>,
    pub snapshot: Option<Arc<SnapshotPipeline>>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    engine: Arc<dyn KvEngine>,
    root_cancel: CancellationToken,
    restarting: Arc<AtomicBool>,
    eviction: RwLock<Option<Arc<EvictionController>>>,
}

impl Supervisor {
    /// `restarting` is shared with this supervisor's `SnapshotPipeline` (if
    /// any), so a snapshot tick and an engine restart never race: the
    /// pipeline skips its tick while the flag is set.
    pub fn new(config: SupervisorConfig, engine: Arc<dyn KvEngine>, restarting: Arc<AtomicBool>) -> Self {
        Self {
            config,
            engine,
            root_cancel: CancellationToken::new(),
            restarting,
            eviction: RwLock::new(None),
        }
    }

    /// Validate config, bring BootstrapController -> EvictionController ->
    /// SnapshotPipeline up in order, and block until the engine stops,
    /// fails fatally, or the root context is cancelled.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let ctx = self.root_cancel.clone();

        let bootstrap_config = BootstrapConfig {
            required_cluster_size: self.config.required_cluster_size,
            self_peer: self.config.self_peer.clone(),
            name_lock_ttl: Duration::from_secs(10),
            bootstrap_timeout: Duration::from_secs(30 * 60),
            join_attempt_timeout: Duration::from_secs(5 * 60),
        };
        let bootstrap = BootstrapController::new(
            bootstrap_config,
            self.engine.clone(),
            self.config.gossip.clone(),
            self.config.snapshot.clone(),
        );
        bootstrap.run(ctx.clone()).await?;

        if let Some(gossip) = &self.config.gossip {
            let eviction_config = EvictionConfig {
                required_cluster_size: self.config.required_cluster_size,
                health_check_timeout: Duration::from_secs(10),
            };
            let controller = Arc::new(EvictionController::new(
                eviction_config,
                gossip.clone(),
                self.engine.clone(),
                self.config.self_peer.peer_url.clone(),
            ));
            controller.start(ctx.clone()).await?;
            *self.eviction.write() = Some(controller);
        }

        if let Some(snapshot) = &self.config.snapshot {
            snapshot.start(ctx.clone());
        }

        ctx.cancelled().await;
        Ok(())
    }

    /// Set the `restarting` marker, hard-stop the engine, and restart it
    /// with the current live Raft member set as the initial cluster in
    /// "new" mode. A no-op if a restart is already in progress.
    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        if self.restarting.swap(true, Ordering::SeqCst) {
            warn!("supervisor: restart requested while already restarting, ignoring");
            return Ok(());
        }
        info!(name = %self.config.self_peer.name, "supervisor: restarting engine");

        let result = async {
            self.engine.hard_stop().await?;
            let peers = self.live_member_set().await;
            self.engine.start(&peers, crate::engine::StartMode::NewCluster).await
        }
        .await;

        self.restarting.store(false, Ordering::SeqCst);
        result
    }

    /// Cancel context, close the removed-notification channel, hard-stop
    /// the engine (no leadership transfer), shut down gossip. Idempotent.
    pub async fn hard_stop(&self) -> Result<()> {
        info!("supervisor: hard stop requested");
        self.root_cancel.cancel();
        if let Some(eviction) = self.eviction.write().take() {
            eviction.shutdown().await?;
        }
        self.engine.hard_stop().await?;
        if let Some(gossip) = &self.config.gossip {
            gossip.shutdown().await?;
        }
        Ok(())
    }

    /// Like `hard_stop`, but allows the engine to finish in-flight calls.
    pub async fn graceful_stop(&self) -> Result<()> {
        self.root_cancel.cancel();
        if let Some(eviction) = self.eviction.write().take() {
            eviction.shutdown().await?;
        }
        self.engine.graceful_stop().await?;
        if let Some(gossip) = &self.config.gossip {
            gossip.shutdown().await?;
        }
        Ok(())
    }

    /// The current live Raft member set, used to restart the engine as a
    /// "new" cluster of exactly those members rather than reforming a
    /// single-node cluster and silently dropping every other voter.
    async fn live_member_set(&self) -> Vec<PeerSpec> {
        match &self.config.gossip {
            Some(gossip) => {
                let peers: Vec<PeerSpec> = gossip
                    .running_members()
                    .await
                    .into_iter()
                    .map(|m| PeerSpec { name: m.name, peer_url: m.peer_url })
                    .collect();
                if peers.is_empty() {
                    vec![self.config.self_peer.clone()]
                } else {
                    peers
                }
            }
            None => vec![self.config.self_peer.clone()],
        }
    }

    /// `true` when the local engine is healthy and current membership has
    /// at least `ClusterInfo.required_cluster_size` members. Backs the
    /// admin `Health` endpoint.
    pub async fn is_cluster_healthy(&self) -> bool {
        if !self.engine.is_ready().await {
            return false;
        }

        let required = match self.engine.get(cluster_info::CLUSTER_INFO_KEY).await {
            Ok(Some(bytes)) => match cluster_info::ClusterInfo::decode(&bytes) {
                Ok(info) => info.required_cluster_size,
                Err(_) => return false,
            },
            _ => self.config.required_cluster_size,
        };

        let member_count = match &self.config.gossip {
            Some(gossip) => gossip.members().await.len() as u32,
            None => 1,
        };

        member_count >= required
    }

    pub fn health_status(&self) -> HealthStatus {
        if self.restarting.load(Ordering::SeqCst) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn root_cancellation(&self) -> CancellationToken {
        self.root_cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::FakeEngine;

    #[tokio::test]
    async fn single_node_run_reaches_ready_and_stop_is_idempotent() {
        let engine = Arc::new(FakeEngine::new());
        let config = SupervisorConfig {
            required_cluster_size: 1,
            self_peer: PeerSpec { name: "n1".into(), peer_url: "http://n1".into() },
            gossip: None,
            snapshot: None,
        };
        let supervisor = Arc::new(Supervisor::new(config, engine.clone(), Arc::new(AtomicBool::new(false))));
        let ctx = supervisor.root_cancellation();

        let run_handle = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.run().await })
        };

        // Give bootstrap a moment to reach Ready, then request shutdown.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(supervisor.is_cluster_healthy().await);

        supervisor.hard_stop().await.unwrap();
        supervisor.hard_stop().await.unwrap(); // idempotent
        ctx.cancel();
        run_handle.await.unwrap().unwrap();
    }
}
