//! SWIM-style peer-discovery gossip membership.
//!
//! A best-effort epidemic broadcast of per-member status, piggybacking a
//! length-prefixed serialized [`Member`] struct so newly-joined peers learn
//! full identity, not just a name. The supervisor only ever needs this one
//! gossip backend, so there's a single concrete `GossipMembership` type
//! rather than a pluggable-backend trait object.

pub mod gossip;

use crate::common::{HealthStatus, SupervisedComponent};
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Lifecycle status of a gossip participant. Wire representation is a single
/// byte (0/1/2) to keep the piggybacked `StatusMsg` tiny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeStatus {
    Unknown = 0,
    Pending = 1,
    Running = 2,
}

impl NodeStatus {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => NodeStatus::Pending,
            2 => NodeStatus::Running,
            _ => NodeStatus::Unknown,
        }
    }
}

/// A gossip participant. Identified by [`Member::peer_url`]; `name` is a
/// secondary key used for logging and for the engine's member table, `id` is
/// authoritative only once the embedded engine has assigned one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: u64,
    pub name: String,
    pub client_url: String,
    pub peer_url: String,
    pub gossip_addr: SocketAddr,
    pub bootstrap_addrs: Vec<SocketAddr>,
    pub status: NodeStatus,
}

impl Member {
    pub fn new(name: impl Into<String>, client_url: impl Into<String>, peer_url: impl Into<String>, gossip_addr: SocketAddr) -> Self {
        Self {
            id: 0,
            name: name.into(),
            client_url: client_url.into(),
            peer_url: peer_url.into(),
            gossip_addr,
            bootstrap_addrs: Vec::new(),
            status: NodeStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEventKind {
    Join,
    Leave,
    Update,
}

#[derive(Debug, Clone)]
pub struct MembershipEvent {
    pub kind: MembershipEventKind,
    pub member: Member,
}

/// Default UDP port used when a bootstrap address omits one.
pub const DEFAULT_GOSSIP_PORT: u16 = 7946;

/// Retransmit multiplier for piggybacked broadcasts, fixed per the wire
/// format so all nodes agree on how long a rumor keeps circulating.
pub const GOSSIP_RETRANSMIT_MULT: u32 = 4;

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub local: Member,
    pub bootstrap_addrs: Vec<SocketAddr>,
    pub protocol_period: Duration,
    /// 32-byte transport key derived from the CA private key. `None` when no
    /// CA is configured, in which case gossip traffic is sent in the clear.
    pub transport_key: Option<[u8; 32]>,
}

/// How many missed protocol periods before a quiet peer is declared gone.
const FAILURE_MULTIPLIER: u32 = 5;

/// Metadata known about one peer: the latest `Member` blob that has
/// propagated, plus any locally-known status override.
#[derive(Debug, Clone)]
struct KnownMember {
    meta: Member,
    local_status_override: Option<NodeStatus>,
    last_seen: std::time::Instant,
}

impl KnownMember {
    fn new(meta: Member) -> Self {
        Self {
            meta,
            local_status_override: None,
            last_seen: std::time::Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_seen = std::time::Instant::now();
    }
}

struct SharedState {
    members: HashMap<String, KnownMember>,
    local: Member,
}

impl SharedState {
    fn visible_member(&self, km: &KnownMember) -> Member {
        let mut m = km.meta.clone();
        if let Some(status) = km.local_status_override {
            m.status = status;
        }
        m
    }
}

/// SWIM-style gossip membership layer.
pub struct GossipMembership {
    config: MembershipConfig,
    state: Arc<RwLock<SharedState>>,
    event_tx: mpsc::Sender<MembershipEvent>,
    event_rx: Arc<Mutex<Option<mpsc::Receiver<MembershipEvent>>>>,
    cancel: CancellationToken,
    transport: Arc<gossip::Transport>,
}

impl GossipMembership {
    /// Bind the transport and prepare internal state. Does not start the
    /// join loop; call [`GossipMembership::start`] for that.
    pub async fn bind(config: MembershipConfig) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::channel(100);
        let transport = gossip::Transport::bind(config.local.gossip_addr, config.transport_key.clone()).await?;
        let local = config.local.clone();
        let state = Arc::new(RwLock::new(SharedState {
            members: HashMap::new(),
            local: local.clone(),
        }));

        Ok(Self {
            config,
            state,
            event_tx,
            event_rx: Arc::new(Mutex::new(Some(event_rx))),
            cancel: CancellationToken::new(),
            transport: Arc::new(transport),
        })
    }

    /// Start the join/gossip loop. Normalizes each bootstrap address (empty
    /// host -> 127.0.0.1, missing port -> [`DEFAULT_GOSSIP_PORT`]) and
    /// retries joins on a 1-second ticker until cancelled.
    pub async fn start(&self, ctx: CancellationToken) -> Result<()> {
        let bootstrap_addrs: Vec<SocketAddr> = self
            .config
            .bootstrap_addrs
            .iter()
            .copied()
            .collect();

        let transport = self.transport.clone();
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        let local = self.config.local.clone();
        let cancel = self.cancel.clone();
        let protocol_period = self.config.protocol_period;

        tokio::spawn(gossip::run_loop(
            transport,
            state,
            event_tx,
            local,
            bootstrap_addrs,
            protocol_period,
            ctx,
            cancel,
        ));

        Ok(())
    }

    /// Atomically update the local member's status and metadata blob. The
    /// next anti-entropy tick in the run loop broadcasts the change; this
    /// keeps `update` itself non-blocking on the network.
    pub async fn update(&self, status: NodeStatus) -> Result<()> {
        let mut state = self.state.write().await;
        state.local.status = status;
        let name = state.local.name.clone();
        drop(state);

        info!(node = %name, ?status, "gossip: local status updated");
        Ok(())
    }

    /// Snapshot of every member whose metadata has propagated. A locally
    /// known status override (set via peer-observed `StatusMsg`) wins over
    /// the (possibly stale) status embedded in the metadata blob.
    pub async fn members(&self) -> Vec<Member> {
        let state = self.state.read().await;
        let mut out: Vec<Member> = state
            .members
            .values()
            .map(|km| state.visible_member(km))
            .collect();
        out.push(state.local.clone());
        out
    }

    pub async fn pending_members(&self) -> Vec<Member> {
        self.members()
            .await
            .into_iter()
            .filter(|m| m.status == NodeStatus::Pending)
            .collect()
    }

    pub async fn running_members(&self) -> Vec<Member> {
        self.members()
            .await
            .into_iter()
            .filter(|m| m.status == NodeStatus::Running)
            .collect()
    }

    /// Take the event receiver. Can only be called once; subsequent calls
    /// return `None` (single-consumer subscription).
    pub async fn events(&self) -> Option<mpsc::Receiver<MembershipEvent>> {
        self.event_rx.lock().await.take()
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        self.transport.close().await;
        Ok(())
    }
}

#[async_trait]
impl SupervisedComponent for GossipMembership {
    fn name(&self) -> &str {
        "gossip-membership"
    }

    async fn shutdown(&self) -> Result<()> {
        GossipMembership::shutdown(self).await
    }

    async fn health_check(&self) -> HealthStatus {
        if self.running_members().await.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Normalize a bootstrap address string: empty host becomes `127.0.0.1`,
/// a missing port becomes [`DEFAULT_GOSSIP_PORT`].
pub fn normalize_bootstrap_addr(raw: &str) -> Result<SocketAddr> {
    let raw = raw.trim();
    let with_host = if raw.starts_with(':') {
        format!("127.0.0.1{}", raw)
    } else {
        raw.to_string()
    };

    if let Ok(addr) = with_host.parse::<SocketAddr>() {
        return Ok(addr);
    }

    // No port at all: try treating the whole string as a host.
    let candidate = format!("{}:{}", with_host, DEFAULT_GOSSIP_PORT);
    candidate
        .parse::<SocketAddr>()
        .map_err(|e| CoreError::Configuration(format!("invalid bootstrap address '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_missing_port() {
        let addr = normalize_bootstrap_addr("10.0.0.5").unwrap();
        assert_eq!(addr.port(), DEFAULT_GOSSIP_PORT);
    }

    #[test]
    fn normalizes_missing_host() {
        let addr = normalize_bootstrap_addr(":7946").unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_eq!(addr.port(), 7946);
    }

    #[test]
    fn node_status_roundtrips_wire_byte() {
        for s in [NodeStatus::Unknown, NodeStatus::Pending, NodeStatus::Running] {
            assert_eq!(NodeStatus::from_u8(s as u8), s);
        }
    }

    #[tokio::test]
    async fn members_includes_local_and_overrides_status() {
        let local = Member::new("n1", "http://127.0.0.1:2379", "http://127.0.0.1:2380", "127.0.0.1:0".parse().unwrap());
        let cfg = MembershipConfig {
            local: local.clone(),
            bootstrap_addrs: vec![],
            protocol_period: Duration::from_millis(50),
            transport_key: None,
        };
        let gm = GossipMembership::bind(cfg).await.unwrap();
        let members = gm.members().await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "n1");
        gm.shutdown().await.unwrap();
    }
}
