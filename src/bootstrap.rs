//! The central state machine: decides, once at startup, whether this node
//! starts a fresh cluster, joins an existing one, or restores from
//! snapshot, then drives the embedded engine through that transition.
//!
//! `BootstrapState` marks the outcome; `run()` is the single entry point
//! that dispatches to the single-node, join-or-form, and restore paths
//! around this crate's gossip loop and snapshot-restore ordering.

use crate::cluster_info;
use crate::engine::{KvEngine, PeerSpec, StartMode};
use crate::error::{CoreError, Result};
use crate::lock::LockGuard;
use crate::membership::{GossipMembership, Member, NodeStatus};
use crate::snapshot::SnapshotPipeline;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Discovering,
    JoiningExisting,
    StartingNew,
    RestoringSnapshot,
    Ready,
}

pub struct BootstrapConfig {
    pub required_cluster_size: u32,
    pub self_peer: PeerSpec,
    pub name_lock_ttl: Duration,
    pub bootstrap_timeout: Duration,
    pub join_attempt_timeout: Duration,
}

pub struct BootstrapController {
    config: BootstrapConfig,
    engine: Arc<dyn KvEngine>,
    gossip: Option<Arc<GossipMembership>>,
    snapshot: Option<Arc<SnapshotPipeline>>,
}

impl BootstrapController {
    pub fn new(
        config: BootstrapConfig,
        engine: Arc<dyn KvEngine>,
        gossip: Option<Arc<GossipMembership>>,
        snapshot: Option<Arc<SnapshotPipeline>>,
    ) -> Self {
        Self { config, engine, gossip, snapshot }
    }

    /// Run the full bootstrap decision and bring the engine to `Ready`.
    pub async fn run(&self, ctx: CancellationToken) -> Result<BootstrapState> {
        if self.config.required_cluster_size == 1 {
            return self.bootstrap_single_node().await;
        }
        self.bootstrap_cluster(ctx).await
    }

    async fn bootstrap_single_node(&self) -> Result<BootstrapState> {
        let restored = self.try_restore().await?;
        self.engine.start(&[self.config.self_peer.clone()], StartMode::NewCluster).await?;
        self.finish_startup(restored).await?;
        Ok(BootstrapState::Ready)
    }

    async fn bootstrap_cluster(&self, ctx: CancellationToken) -> Result<BootstrapState> {
        let gossip = self
            .gossip
            .as_ref()
            .ok_or_else(|| CoreError::Configuration("gossip membership is required when required_cluster_size > 1".into()))?;

        gossip.start(ctx.clone()).await?;

        let deadline = Instant::now() + self.config.bootstrap_timeout;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));

        loop {
            if Instant::now() >= deadline {
                return Err(CoreError::Engine("bootstrap deadline exceeded before a cluster could be formed or joined".into()));
            }

            let members = gossip.members().await;
            for m in members.iter() {
                if m.peer_url == self.config.self_peer.peer_url {
                    continue;
                }
                if m.status != NodeStatus::Running {
                    continue;
                }
                match self.try_join(m, ctx.clone()).await {
                    Ok(()) => {
                        self.finish_startup(false).await?;
                        return Ok(BootstrapState::Ready);
                    }
                    Err(e) => {
                        warn!(candidate = %m.client_url, error = %e, "bootstrap: join attempt failed, will try a different peer next tick");
                    }
                }
            }

            if members.len() as u32 >= self.config.required_cluster_size {
                gossip.update(NodeStatus::Pending).await?;
            }

            let pending_count = gossip.pending_members().await.len() as u32;
            if pending_count >= self.config.required_cluster_size {
                let restored = self.try_restore().await?;
                let peers: Vec<PeerSpec> = gossip
                    .members()
                    .await
                    .into_iter()
                    .map(|m| PeerSpec { name: m.name, peer_url: m.peer_url })
                    .collect();
                self.engine.start(&peers, StartMode::NewCluster).await?;
                self.finish_startup(restored).await?;
                return Ok(BootstrapState::Ready);
            }

            tokio::select! {
                _ = ctx.cancelled() => return Err(CoreError::Cancelled),
                _ = ticker.tick() => {}
            }
        }
    }

    /// Attempt to join the cluster reachable through `candidate`. See the
    /// module doc for the five-step join flow.
    async fn try_join(&self, candidate: &Member, _ctx: CancellationToken) -> Result<()> {
        let listed: Vec<PeerSpec> = self.engine.list_members(&candidate.client_url).await?;

        let already_member = listed.iter().any(|p| p.name == self.config.self_peer.name);
        if already_member {
            match self.engine.start(&listed, StartMode::ExistingCluster).await {
                Ok(()) => return Ok(()),
                Err(_) => {
                    let guard = LockGuard::acquire(self.engine.clone(), &self.config.self_peer.name, self.config.name_lock_ttl).await?;
                    let _ = self.engine.remove_member_by_name(&self.config.self_peer.name).await;
                    guard.release().await?;
                }
            }
        }

        let guard = LockGuard::acquire(self.engine.clone(), &self.config.self_peer.name, self.config.name_lock_ttl).await?;
        let new_id = self.engine.add_member(&self.config.self_peer.peer_url).await;
        guard.release().await?;
        let new_id = new_id?;

        let mut peers: Vec<PeerSpec> = vec![self.config.self_peer.clone()];
        peers.extend(listed.into_iter().filter(|p| p.name != self.config.self_peer.name));

        if let Err(e) = self.engine.start(&peers, StartMode::ExistingCluster).await {
            let _ = self.engine.remove_member_by_name(&self.config.self_peer.name).await;
            let _ = new_id;
            return Err(e);
        }
        Ok(())
    }

    async fn try_restore(&self) -> Result<bool> {
        let Some(snapshot) = &self.snapshot else { return Ok(false) };
        let peers = [self.config.self_peer.clone()];
        match snapshot.restore(&peers).await {
            Ok(()) => Ok(true),
            Err(CoreError::Io(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write (or verify) the ClusterInfo invariant, clear the volatile
    /// prefix if this startup came from a restore, then transition to
    /// Running.
    async fn finish_startup(&self, restored: bool) -> Result<()> {
        {
            let guard = LockGuard::acquire(self.engine.clone(), "cluster-info", Duration::from_secs(10)).await?;
            let result = cluster_info::read_or_insert(self.engine.as_ref(), self.config.required_cluster_size).await;
            guard.release().await?;
            result?;
        }

        if restored {
            cluster_info::clear_volatile_and_mark_restored(self.engine.as_ref()).await?;
            info!("bootstrap: volatile prefix cleared after snapshot restore");
        }

        if let Some(gossip) = &self.gossip {
            gossip.update(NodeStatus::Running).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::FakeEngine;

    #[tokio::test]
    async fn single_node_reaches_ready_with_cluster_info() {
        let engine: Arc<dyn KvEngine> = Arc::new(FakeEngine::new());
        let config = BootstrapConfig {
            required_cluster_size: 1,
            self_peer: PeerSpec { name: "n1".into(), peer_url: "http://n1".into() },
            name_lock_ttl: Duration::from_secs(10),
            bootstrap_timeout: Duration::from_secs(30 * 60),
            join_attempt_timeout: Duration::from_secs(300),
        };
        let controller = BootstrapController::new(config, engine.clone(), None, None);
        let state = controller.run(CancellationToken::new()).await.unwrap();
        assert_eq!(state, BootstrapState::Ready);
        assert!(engine.is_ready().await);

        let info_bytes = engine.get(cluster_info::CLUSTER_INFO_KEY).await.unwrap().unwrap();
        let info = cluster_info::ClusterInfo::decode(&info_bytes).unwrap();
        assert_eq!(info.required_cluster_size, 1);
    }
}
