//! Translates gossip churn into authoritative engine membership changes,
//! gated on local quorum so a minority partition can never mutate the
//! cluster's member list.
//!
//! The suspect map is a name-keyed map of first-suspected timestamps,
//! driven by gossip join/leave events, and every eviction it decides on
//! goes through [`crate::engine::KvEngine`] rather than a local SWIM state
//! machine.

use crate::common::{HealthStatus, SupervisedComponent};
use crate::engine::KvEngine;
use crate::error::Result;
use crate::membership::{GossipMembership, MembershipEventKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct EvictionConfig {
    pub required_cluster_size: u32,
    pub health_check_timeout: Duration,
}

/// Name -> first-suspected-time. Guarded by a sync mutex since all accesses
/// are brief map operations with no `.await` held across them.
struct SuspectMap {
    entries: HashMap<String, Instant>,
    has_quorum: bool,
}

pub struct EvictionController {
    config: EvictionConfig,
    gossip: Arc<GossipMembership>,
    engine: Arc<dyn KvEngine>,
    suspects: Mutex<SuspectMap>,
    removed_tx: mpsc::Sender<String>,
    removed_rx: Mutex<Option<mpsc::Receiver<String>>>,
    self_peer_url: String,
    cancel: CancellationToken,
}

impl EvictionController {
    pub fn new(
        config: EvictionConfig,
        gossip: Arc<GossipMembership>,
        engine: Arc<dyn KvEngine>,
        self_peer_url: impl Into<String>,
    ) -> Self {
        let (removed_tx, removed_rx) = mpsc::channel(10);
        Self {
            config,
            gossip,
            engine,
            suspects: Mutex::new(SuspectMap {
                entries: HashMap::new(),
                has_quorum: false,
            }),
            removed_tx,
            removed_rx: Mutex::new(Some(removed_rx)),
            self_peer_url: self_peer_url.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// One-shot notification channel, fired after each successful eviction.
    /// Can only be taken once.
    pub fn removed_channel(&self) -> Option<mpsc::Receiver<String>> {
        self.removed_rx.lock().take()
    }

    pub async fn start(self: &Arc<Self>, ctx: CancellationToken) -> Result<()> {
        let Some(mut events) = self.gossip.events().await else {
            warn!("eviction: gossip event stream already consumed, running tick-only");
            return self.clone().spawn_tick_loop(ctx);
        };

        let this = self.clone();
        let events_ctx = ctx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = events_ctx.cancelled() => break,
                    _ = this.cancel.cancelled() => break,
                    maybe_event = events.recv() => {
                        let Some(event) = maybe_event else { break };
                        this.handle_event(event.kind, event.member).await;
                    }
                }
            }
        });

        self.clone().spawn_tick_loop(ctx)
    }

    fn spawn_tick_loop(self: Arc<Self>, ctx: CancellationToken) -> Result<()> {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }
        });
        Ok(())
    }

    async fn handle_event(&self, kind: MembershipEventKind, member: crate::membership::Member) {
        if member.peer_url == self.self_peer_url {
            return;
        }

        match kind {
            MembershipEventKind::Join => {
                let duplicate = self
                    .engine
                    .find_member_by_peer_url(&member.peer_url)
                    .await
                    .ok()
                    .flatten();

                if let Some(old_name) = duplicate {
                    if old_name != member.name {
                        if self.suspects.lock().has_quorum {
                            info!(old_name = %old_name, new_name = %member.name, peer_url = %member.peer_url, "eviction: duplicate PeerURL, evicting stale member immediately");
                            self.evict(&old_name).await;
                        } else {
                            warn!(old_name = %old_name, new_name = %member.name, peer_url = %member.peer_url, "eviction: duplicate PeerURL detected but quorum is absent, deferring eviction");
                        }
                    }
                }

                self.suspects.lock().entries.remove(&member.name);
            }
            MembershipEventKind::Leave => {
                self.suspects.lock().entries.insert(member.name.clone(), Instant::now());
            }
            MembershipEventKind::Update => {}
        }
    }

    async fn tick(&self) {
        let running = self.gossip.running_members().await.len() as u32;
        let now_has_quorum = running > self.config.required_cluster_size / 2;

        let due: Vec<String> = {
            let mut guard = self.suspects.lock();
            if now_has_quorum != guard.has_quorum {
                guard.has_quorum = now_has_quorum;
                let now = Instant::now();
                for ts in guard.entries.values_mut() {
                    *ts = now;
                }
            }

            if !guard.has_quorum {
                Vec::new()
            } else {
                let now = Instant::now();
                guard
                    .entries
                    .iter()
                    .filter(|(_, ts)| now.duration_since(**ts) >= self.config.health_check_timeout)
                    .map(|(name, _)| name.clone())
                    .collect()
            }
        };

        for name in due {
            self.evict(&name).await;
        }
    }

    async fn evict(&self, name: &str) {
        match self.engine.remove_member_by_name(name).await {
            Ok(()) => {
                self.suspects.lock().entries.remove(name);
                let _ = self.removed_tx.try_send(name.to_string());
                info!(name, "eviction: member removed");
            }
            Err(crate::error::CoreError::NotFound(_)) => {
                // Already removed by a racing peer; treat as success.
                self.suspects.lock().entries.remove(name);
            }
            Err(e) => {
                warn!(name, error = %e, "eviction: remove_member failed, will retry next tick");
            }
        }
    }
}

#[async_trait]
impl SupervisedComponent for EvictionController {
    fn name(&self) -> &str {
        "eviction-controller"
    }

    async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        if self.suspects.lock().has_quorum {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::FakeEngine;
    use crate::membership::{Member, MembershipConfig};

    async fn make_gossip(name: &str) -> Arc<GossipMembership> {
        let local = Member::new(name, "http://127.0.0.1:0", format!("http://127.0.0.1:0/{name}"), "127.0.0.1:0".parse().unwrap());
        let cfg = MembershipConfig {
            local,
            bootstrap_addrs: vec![],
            protocol_period: Duration::from_millis(50),
            transport_key: None,
        };
        Arc::new(GossipMembership::bind(cfg).await.unwrap())
    }

    #[tokio::test]
    async fn quorum_gate_blocks_eviction_below_threshold() {
        let gossip = make_gossip("self").await;
        let engine = Arc::new(FakeEngine::new());
        let config = EvictionConfig {
            required_cluster_size: 3,
            health_check_timeout: Duration::from_millis(10),
        };
        let controller = Arc::new(EvictionController::new(config, gossip, engine.clone(), "http://127.0.0.1:0/self"));
        controller.suspects.lock().entries.insert("stale".to_string(), Instant::now() - Duration::from_secs(5));
        controller.tick().await;
        assert!(!engine.was_removed("stale"));
    }
}
