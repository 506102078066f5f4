//! The embedded Raft-replicated key-value engine, modeled as an external
//! black box.
//!
//! The engine's own Raft log, election, and storage format are out of
//! scope; the supervisor only ever needs the handful of lifecycle
//! operations below. [`KvEngine`] is a small async trait object the rest
//! of the crate programs against, covering exactly the surface the
//! bootstrap and snapshot paths need: start/join/restart/snapshot/
//! member-add/member-remove plus the distributed-lock primitives.

use crate::error::Result;
use async_trait::async_trait;
use std::net::SocketAddr;

/// A `(Name, PeerURL)` pair used to build the engine's initial-cluster
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSpec {
    pub name: String,
    pub peer_url: String,
}

/// How the engine should interpret the peer list passed to `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Forming a brand-new cluster from this peer list.
    NewCluster,
    /// Joining a cluster that already has these members.
    ExistingCluster,
}

/// The async interface the supervisor drives the embedded engine through.
/// A production build wires this to the real embedded store; tests wire it
/// to the in-process fake in [`tests::FakeEngine`].
#[async_trait]
pub trait KvEngine: Send + Sync {
    /// Start the engine with the given initial-cluster peer list.
    async fn start(&self, peers: &[PeerSpec], mode: StartMode) -> Result<()>;

    /// Hard-stop: no leadership transfer, no in-flight call draining.
    async fn hard_stop(&self) -> Result<()>;

    /// Graceful stop: allow in-flight client calls to finish first.
    async fn graceful_stop(&self) -> Result<()>;

    /// `true` once the engine has reported ready after `start`.
    async fn is_ready(&self) -> bool;

    /// `true` when this node is the current Raft leader.
    async fn is_leader(&self) -> bool;

    /// Current committed revision, used by the snapshot pipeline to avoid
    /// redundant snapshots.
    async fn current_revision(&self) -> u64;

    /// Stream a consistent point-in-time snapshot at a revision strictly
    /// greater than `after_rev`. Fails if the engine's revision hasn't
    /// advanced past `after_rev`.
    async fn snapshot(&self, after_rev: u64) -> Result<(u64, Vec<u8>)>;

    /// Restore the engine's data directory from a previously captured
    /// snapshot blob, then bring it up with the given initial cluster.
    async fn restore_from_snapshot(&self, blob: &[u8], peers: &[PeerSpec]) -> Result<()>;

    /// Add a member (self or a peer) by PeerURL, returning the engine's
    /// newly assigned numeric ID.
    async fn add_member(&self, peer_url: &str) -> Result<u64>;

    /// Remove a member by name. Idempotent: removing an already-absent
    /// member must be treated as success by callers, via `CoreError::NotFound`.
    async fn remove_member_by_name(&self, name: &str) -> Result<()>;

    /// Look up the current member name bound to a PeerURL, if any. Used by
    /// the eviction controller to detect duplicate PeerURL assignment.
    async fn find_member_by_peer_url(&self, peer_url: &str) -> Result<Option<String>>;

    /// Open a client against `client_url` and list the members that engine
    /// instance currently knows about. Used by the join flow's step 1 to
    /// discover membership before deciding whether this node is already a
    /// member of the cluster reachable through that URL.
    async fn list_members(&self, client_url: &str) -> Result<Vec<PeerSpec>>;

    /// Read a single key from the engine's own keyspace (used for
    /// ClusterInfo and the volatile-prefix operations).
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Write a single key, bypassing Raft ordering guarantees for
    /// deterministic post-restore bookkeeping (see `cluster_info`).
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Delete every key under a prefix. Used to clear `VolatilePrefix` after
    /// a snapshot restore.
    async fn delete_prefix(&self, prefix: &[u8]) -> Result<()>;

    /// Local client listener address, used by join-flow callers opening a
    /// client against themselves for the cluster-info invariant write.
    fn client_addr(&self) -> SocketAddr;

    /// Acquire a TTL-bound distributed lock keyed on `name`. Blocks (subject
    /// to the caller's own timeout) until the lock is free. The returned
    /// token identifies this acquisition for `release_lock` and must be
    /// refreshed via `renew_lock` before `ttl` elapses to keep holding it.
    async fn acquire_lock(&self, name: &str, ttl: std::time::Duration) -> Result<u64>;

    /// Refresh a held lock's lease.
    async fn renew_lock(&self, name: &str, token: u64, ttl: std::time::Duration) -> Result<()>;

    /// Release a held lock. Idempotent.
    async fn release_lock(&self, name: &str, token: u64) -> Result<()>;
}

/// Placeholder engine wired by the binary entry point when no concrete
/// engine has been linked in. Every operation fails with
/// [`crate::error::CoreError::Engine`]; wiring a real embedded store here is
/// deployment-specific glue outside this crate's scope.
pub struct UnimplementedEngine;

#[async_trait]
impl KvEngine for UnimplementedEngine {
    async fn start(&self, _peers: &[PeerSpec], _mode: StartMode) -> Result<()> {
        Err(unimplemented_err())
    }
    async fn hard_stop(&self) -> Result<()> {
        Err(unimplemented_err())
    }
    async fn graceful_stop(&self) -> Result<()> {
        Err(unimplemented_err())
    }
    async fn is_ready(&self) -> bool {
        false
    }
    async fn is_leader(&self) -> bool {
        false
    }
    async fn current_revision(&self) -> u64 {
        0
    }
    async fn snapshot(&self, _after_rev: u64) -> Result<(u64, Vec<u8>)> {
        Err(unimplemented_err())
    }
    async fn restore_from_snapshot(&self, _blob: &[u8], _peers: &[PeerSpec]) -> Result<()> {
        Err(unimplemented_err())
    }
    async fn add_member(&self, _peer_url: &str) -> Result<u64> {
        Err(unimplemented_err())
    }
    async fn remove_member_by_name(&self, _name: &str) -> Result<()> {
        Err(unimplemented_err())
    }
    async fn find_member_by_peer_url(&self, _peer_url: &str) -> Result<Option<String>> {
        Err(unimplemented_err())
    }
    async fn list_members(&self, _client_url: &str) -> Result<Vec<PeerSpec>> {
        Err(unimplemented_err())
    }
    async fn get(&self, _key: &[u8]) -> Result<Option<Vec<u8>>> {
        Err(unimplemented_err())
    }
    async fn put(&self, _key: &[u8], _value: &[u8]) -> Result<()> {
        Err(unimplemented_err())
    }
    async fn delete_prefix(&self, _prefix: &[u8]) -> Result<()> {
        Err(unimplemented_err())
    }
    fn client_addr(&self) -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }
    async fn acquire_lock(&self, _name: &str, _ttl: std::time::Duration) -> Result<u64> {
        Err(unimplemented_err())
    }
    async fn renew_lock(&self, _name: &str, _token: u64, _ttl: std::time::Duration) -> Result<()> {
        Err(unimplemented_err())
    }
    async fn release_lock(&self, _name: &str, _token: u64) -> Result<()> {
        Err(unimplemented_err())
    }
}

fn unimplemented_err() -> crate::error::CoreError {
    crate::error::CoreError::Engine("no KvEngine implementation has been wired into this binary".into())
}

#[cfg(any(test, feature = "test-support"))]
pub mod tests {
    use super::*;
    use crate::error::CoreError;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;

    /// Maps a ClientURL to the `FakeEngine` instance bound to it, standing in
    /// for the KV client dialing a remote node would do against the real
    /// engine. Shared by every `FakeEngine` in a simulated cluster so the
    /// join flow's `list_members(candidate_client_url)` can "reach" a peer.
    pub type EngineRegistry = Arc<Mutex<HashMap<String, Arc<FakeEngine>>>>;

    pub fn new_registry() -> EngineRegistry {
        Arc::new(Mutex::new(HashMap::new()))
    }

    /// In-process fake standing in for the real embedded engine in tests:
    /// an in-memory keyspace plus a member table, with no actual Raft
    /// replication (single-process tests only ever exercise one instance's
    /// worth of state machine logic at a time).
    pub struct FakeEngine {
        inner: Mutex<Inner>,
        addr: SocketAddr,
        client_url: String,
        registry: Option<EngineRegistry>,
    }

    struct Inner {
        ready: bool,
        leader: bool,
        revision: u64,
        kv: HashMap<Vec<u8>, Vec<u8>>,
        members: HashMap<String, String>, // name -> peer_url
        removed: HashSet<String>,
        next_id: u64,
        locks: HashMap<String, (u64, std::time::Instant, std::time::Duration)>,
        next_lock_token: u64,
    }

    impl FakeEngine {
        pub fn new() -> Self {
            Self::with_client_url(format!("fake-client-{}", rand::random::<u64>()))
        }

        pub fn with_client_url(client_url: impl Into<String>) -> Self {
            Self {
                inner: Mutex::new(Inner {
                    ready: false,
                    leader: true,
                    revision: 0,
                    kv: HashMap::new(),
                    members: HashMap::new(),
                    removed: HashSet::new(),
                    next_id: 1,
                    locks: HashMap::new(),
                    next_lock_token: 1,
                }),
                addr: "127.0.0.1:0".parse().unwrap(),
                client_url: client_url.into(),
                registry: None,
            }
        }

        /// Build an engine bound to `client_url` and register it in `registry`
        /// so other engines' `list_members(client_url)` calls can reach it,
        /// simulating a KV client dialing a remote candidate.
        pub fn new_registered(client_url: impl Into<String>, registry: &EngineRegistry) -> Arc<Self> {
            let client_url = client_url.into();
            let engine = Arc::new(Self { registry: Some(registry.clone()), ..Self::with_client_url(client_url.clone()) });
            registry.lock().insert(client_url, engine.clone());
            engine
        }

        /// Build an engine with access to `registry` for its own outbound
        /// `list_members` calls, without registering itself under it yet.
        /// Models a node that is about to join a cluster it isn't a member
        /// of: it can look candidates up, but candidates can't look it up.
        pub fn new_joining(client_url: impl Into<String>, registry: &EngineRegistry) -> Arc<Self> {
            Arc::new(Self { registry: Some(registry.clone()), ..Self::with_client_url(client_url) })
        }

        pub fn was_removed(&self, name: &str) -> bool {
            self.inner.lock().removed.contains(name)
        }

        pub fn member_count(&self) -> usize {
            self.inner.lock().members.len()
        }

        fn members_as_peer_specs(&self) -> Vec<PeerSpec> {
            self.inner
                .lock()
                .members
                .iter()
                .map(|(name, peer_url)| PeerSpec { name: name.clone(), peer_url: peer_url.clone() })
                .collect()
        }
    }

    #[async_trait]
    impl KvEngine for FakeEngine {
        async fn start(&self, peers: &[PeerSpec], _mode: StartMode) -> Result<()> {
            let mut inner = self.inner.lock();
            for p in peers {
                inner.members.insert(p.name.clone(), p.peer_url.clone());
            }
            inner.ready = true;
            Ok(())
        }

        async fn hard_stop(&self) -> Result<()> {
            self.inner.lock().ready = false;
            Ok(())
        }

        async fn graceful_stop(&self) -> Result<()> {
            self.inner.lock().ready = false;
            Ok(())
        }

        async fn is_ready(&self) -> bool {
            self.inner.lock().ready
        }

        async fn is_leader(&self) -> bool {
            self.inner.lock().leader
        }

        async fn current_revision(&self) -> u64 {
            self.inner.lock().revision
        }

        async fn snapshot(&self, after_rev: u64) -> Result<(u64, Vec<u8>)> {
            let mut inner = self.inner.lock();
            if inner.revision <= after_rev {
                inner.revision += 1;
            }
            if inner.revision <= after_rev {
                return Err(CoreError::Engine("no new revision to snapshot".into()));
            }
            let blob = serde_json::to_vec(&inner.kv.iter().collect::<Vec<_>>())
                .map_err(CoreError::from)?;
            Ok((inner.revision, blob))
        }

        async fn restore_from_snapshot(&self, blob: &[u8], peers: &[PeerSpec]) -> Result<()> {
            let entries: Vec<(Vec<u8>, Vec<u8>)> = serde_json::from_slice(blob).map_err(CoreError::from)?;
            let mut inner = self.inner.lock();
            inner.kv = entries.into_iter().collect();
            for p in peers {
                inner.members.insert(p.name.clone(), p.peer_url.clone());
            }
            inner.ready = true;
            Ok(())
        }

        async fn add_member(&self, peer_url: &str) -> Result<u64> {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.members.insert(format!("member-{id}"), peer_url.to_string());
            Ok(id)
        }

        async fn remove_member_by_name(&self, name: &str) -> Result<()> {
            let mut inner = self.inner.lock();
            if inner.members.remove(name).is_none() {
                return Err(CoreError::NotFound(format!("member {name} not found")));
            }
            inner.removed.insert(name.to_string());
            Ok(())
        }

        async fn find_member_by_peer_url(&self, peer_url: &str) -> Result<Option<String>> {
            let inner = self.inner.lock();
            Ok(inner
                .members
                .iter()
                .find(|(_, url)| url.as_str() == peer_url)
                .map(|(name, _)| name.clone()))
        }

        async fn list_members(&self, client_url: &str) -> Result<Vec<PeerSpec>> {
            if client_url == self.client_url {
                return Ok(self.members_as_peer_specs());
            }
            let registry = self
                .registry
                .as_ref()
                .ok_or_else(|| CoreError::Network(format!("cannot reach '{client_url}': no engine registry configured")))?;
            let candidate = registry
                .lock()
                .get(client_url)
                .cloned()
                .ok_or_else(|| CoreError::Network(format!("no engine reachable at '{client_url}'")))?;
            Ok(candidate.members_as_peer_specs())
        }

        async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            Ok(self.inner.lock().kv.get(key).cloned())
        }

        async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
            self.inner.lock().kv.insert(key.to_vec(), value.to_vec());
            Ok(())
        }

        async fn delete_prefix(&self, prefix: &[u8]) -> Result<()> {
            let mut inner = self.inner.lock();
            inner.kv.retain(|k, _| !k.starts_with(prefix));
            Ok(())
        }

        fn client_addr(&self) -> SocketAddr {
            self.addr
        }

        async fn acquire_lock(&self, name: &str, ttl: std::time::Duration) -> Result<u64> {
            let mut inner = self.inner.lock();
            let now = std::time::Instant::now();
            if let Some((_, acquired_at, lease_ttl)) = inner.locks.get(name) {
                if now.duration_since(*acquired_at) < *lease_ttl {
                    return Err(CoreError::Network(format!("lock '{name}' held")));
                }
            }
            let token = inner.next_lock_token;
            inner.next_lock_token += 1;
            inner.locks.insert(name.to_string(), (token, now, ttl));
            Ok(token)
        }

        async fn renew_lock(&self, name: &str, token: u64, ttl: std::time::Duration) -> Result<()> {
            let mut inner = self.inner.lock();
            match inner.locks.get_mut(name) {
                Some((held_token, acquired_at, lease_ttl)) if *held_token == token => {
                    *acquired_at = std::time::Instant::now();
                    *lease_ttl = ttl;
                    Ok(())
                }
                _ => Err(CoreError::NotFound(format!("lock '{name}' not held by this token"))),
            }
        }

        async fn release_lock(&self, name: &str, token: u64) -> Result<()> {
            let mut inner = self.inner.lock();
            if let Some((held_token, _, _)) = inner.locks.get(name) {
                if *held_token == token {
                    inner.locks.remove(name);
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn fake_engine_removes_and_flags_not_found() {
        let engine = FakeEngine::new();
        engine
            .start(&[PeerSpec { name: "a".into(), peer_url: "http://a".into() }], StartMode::NewCluster)
            .await
            .unwrap();
        engine.remove_member_by_name("a").await.unwrap();
        assert!(engine.was_removed("a"));
        let err = engine.remove_member_by_name("a").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
