//! UDP wire transport for [`super::GossipMembership`].
//!
//! Binds a `tokio::net::UdpSocket` and `tokio::select!`s between a protocol
//! ticker and inbound datagrams, bincode-framed. The message set is the
//! StatusMsg/NodeMeta pair and last-write-wins-by-Name merge rule this
//! supervisor's wire format calls for, not SWIM ping/ack failure detection.

use super::{Member, MembershipEvent, MembershipEventKind, NodeStatus, SharedState};
use crate::crypto;
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MAX_DATAGRAM: usize = 65_507;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum WireMessage {
    /// Full member record, piggybacked so peers learn identity, not just a name.
    NodeMeta(Member),
    /// Lightweight status broadcast: `(Name, Status)`.
    StatusMsg { name: String, status: u8 },
}

pub struct Transport {
    socket: UdpSocket,
    key: Option<[u8; crypto::KEY_LEN]>,
}

impl Transport {
    pub async fn bind(addr: SocketAddr, key: Option<[u8; crypto::KEY_LEN]>) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| CoreError::Network(format!("failed to bind gossip socket on {addr}: {e}")))?;
        Ok(Self { socket, key })
    }

    async fn send(&self, msg: &WireMessage, addr: SocketAddr) -> Result<()> {
        let encoded = bincode::serde::encode_to_vec(msg, bincode::config::standard())
            .map_err(|e| CoreError::Serialization(e.to_string()))?;
        let payload = match &self.key {
            Some(k) => crypto::seal(k, &encoded),
            None => encoded,
        };
        self.socket
            .send_to(&payload, addr)
            .await
            .map_err(|e| CoreError::Network(format!("gossip send to {addr} failed: {e}")))?;
        Ok(())
    }

    async fn broadcast_to(&self, msg: &WireMessage, peers: &[SocketAddr]) {
        for _ in 0..super::GOSSIP_RETRANSMIT_MULT {
            for addr in peers {
                if let Err(e) = self.send(msg, *addr).await {
                    debug!(%addr, error = %e, "gossip: retransmit failed");
                }
            }
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<WireMessage> {
        let raw = match &self.key {
            Some(k) => crypto::open(k, bytes)?,
            None => bytes.to_vec(),
        };
        bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map(|(msg, _)| msg)
            .map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub async fn close(&self) {
        // UdpSocket has no explicit close; dropping it releases the fd. The
        // run loop observes cancellation and returns, dropping its Arc.
    }
}

pub(super) async fn run_loop(
    transport: Arc<Transport>,
    state: Arc<RwLock<SharedState>>,
    event_tx: mpsc::Sender<MembershipEvent>,
    local: Member,
    bootstrap_addrs: Vec<SocketAddr>,
    protocol_period: std::time::Duration,
    ctx: CancellationToken,
    cancel: CancellationToken,
) {
    let mut ticker = interval(protocol_period);
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut joined = bootstrap_addrs.is_empty();
    let failure_threshold = protocol_period * super::FAILURE_MULTIPLIER;

    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                debug!("gossip: outer context cancelled");
                break;
            }
            _ = cancel.cancelled() => {
                debug!("gossip: shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                if !joined {
                    for addr in &bootstrap_addrs {
                        let msg = WireMessage::NodeMeta(local.clone());
                        if let Err(e) = transport.send(&msg, *addr).await {
                            warn!(%addr, error = %e, "gossip: join attempt failed, retrying next tick");
                        } else {
                            joined = true;
                        }
                    }
                }

                // Anti-entropy push: broadcast our current status to every
                // peer we currently know about.
                let (self_status, peers) = {
                    let guard = state.read().await;
                    let peers: Vec<SocketAddr> = guard.members.values().map(|km| km.meta.gossip_addr).collect();
                    (guard.local.status, peers)
                };
                if !peers.is_empty() {
                    let msg = WireMessage::StatusMsg { name: local.name.clone(), status: self_status as u8 };
                    transport.broadcast_to(&msg, &peers).await;
                }

                let stale: Vec<Member> = {
                    let mut guard = state.write().await;
                    let now = std::time::Instant::now();
                    let stale_names: Vec<String> = guard
                        .members
                        .iter()
                        .filter(|(_, km)| now.duration_since(km.last_seen) > failure_threshold)
                        .map(|(name, _)| name.clone())
                        .collect();
                    stale_names
                        .into_iter()
                        .filter_map(|name| guard.members.remove(&name).map(|km| km.meta))
                        .collect()
                };
                for member in stale {
                    debug!(name = %member.name, "gossip: peer went quiet, declaring Leave");
                    let _ = event_tx.try_send(MembershipEvent { kind: MembershipEventKind::Leave, member });
                }
            }
            result = transport.socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, from)) => {
                        match transport.decode(&buf[..len]) {
                            Ok(msg) => handle_message(msg, from, &state, &event_tx, &local).await,
                            Err(e) => debug!(%from, error = %e, "gossip: dropping undecodable datagram"),
                        }
                    }
                    Err(e) => warn!(error = %e, "gossip: recv_from failed"),
                }
            }
        }
    }
}

async fn handle_message(
    msg: WireMessage,
    from: SocketAddr,
    state: &Arc<RwLock<SharedState>>,
    event_tx: &mpsc::Sender<MembershipEvent>,
    local: &Member,
) {
    match msg {
        WireMessage::NodeMeta(mut member) => {
            if member.gossip_addr.ip().is_unspecified() {
                member.gossip_addr = from;
            }
            if member.peer_url == local.peer_url {
                return;
            }

            let mut guard = state.write().await;
            let is_new = !guard.members.contains_key(&member.name);
            guard
                .members
                .entry(member.name.clone())
                .and_modify(|km| {
                    km.meta = member.clone();
                    km.touch();
                })
                .or_insert_with(|| super::KnownMember::new(member.clone()));
            drop(guard);

            let kind = if is_new { MembershipEventKind::Join } else { MembershipEventKind::Update };
            let _ = event_tx.try_send(MembershipEvent { kind, member });
        }
        WireMessage::StatusMsg { name, status } => {
            if name == local.name {
                return;
            }
            let status = NodeStatus::from_u8(status);

            let mut guard = state.write().await;
            if !guard.members.contains_key(&name) {
                // Status for a member we haven't seen NodeMeta for yet;
                // nothing to merge into until the blob arrives.
                return;
            }
            if let Some(km) = guard.members.get_mut(&name) {
                km.local_status_override = Some(status);
                km.touch();
            }
            let member = guard.visible_member(guard.members.get(&name).unwrap());
            drop(guard);

            let _ = event_tx.try_send(MembershipEvent { kind: MembershipEventKind::Update, member });
        }
    }
}
