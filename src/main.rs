// Supervisor entry point.
//
// Loads configuration, validates it, and brings the supervisor up against
// the embedded engine. The embedded engine itself is out of this crate's
// scope (see `kvsupervisor::engine::KvEngine`); this binary is wired
// against whatever concrete engine implementation the deployment provides.

use kvsupervisor::engine::PeerSpec;
use kvsupervisor::supervisor::{Supervisor, SupervisorConfig};
use kvsupervisor::{Config, Result, VERSION};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    print_banner();

    let install_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config_path = install_dir.join("kvsupervisor.toml");

    let config = if config_path.exists() {
        Config::from_toml_file(&config_path).await?
    } else {
        Config::default()
    }
    .apply_env_overrides();

    config.validate()?;
    tokio::fs::create_dir_all(&config.data_dir).await?;

    info!(version = VERSION, data_dir = %config.data_dir.display(), "kvsupervisor starting");
    info!(
        required_cluster_size = config.required_cluster_size,
        client_addr = %config.client_addr,
        peer_addr = %config.peer_addr,
        gossip_addr = %config.gossip_addr,
        "startup configuration"
    );

    let name = resolve_node_name(&config).await?;
    let self_peer = PeerSpec {
        name: name.clone(),
        peer_url: format!("http://{}", config.peer_addr),
    };

    // NOTE: wiring a real `KvEngine` here is deployment-specific glue outside
    // this crate's budget; this binary wires the placeholder engine, which
    // fails loudly if actually exercised, until a concrete embedded store is
    // linked in. Gossip and the snapshot pipeline are real, since both are
    // this crate's own responsibility.
    let engine = std::sync::Arc::new(kvsupervisor::engine::UnimplementedEngine);

    let ca_key = match &config.ca_key {
        Some(path) => {
            let der = tokio::fs::read(path).await?;
            Some(kvsupervisor::crypto::derive_key_from_ca_der(&der))
        }
        None => None,
    };

    let gossip = if config.required_cluster_size > 1 {
        let gossip_addr = kvsupervisor::config::parse_and_default_host(&config.gossip_addr)?;
        let bootstrap_addrs = config
            .discovery
            .initial_peers
            .iter()
            .map(|addr| kvsupervisor::membership::normalize_bootstrap_addr(addr))
            .collect::<Result<Vec<_>>>()?;
        let local = kvsupervisor::membership::Member::new(
            name.clone(),
            format!("http://{}", config.client_addr),
            self_peer.peer_url.clone(),
            gossip_addr,
        );
        let membership_config = kvsupervisor::membership::MembershipConfig {
            local,
            bootstrap_addrs,
            protocol_period: Duration::from_millis(200),
            transport_key: ca_key,
        };
        Some(std::sync::Arc::new(
            kvsupervisor::membership::GossipMembership::bind(membership_config).await?,
        ))
    } else {
        None
    };

    let restarting = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

    let snapshot = {
        let target = kvsupervisor::snapshot::blob::BackupTarget::parse(&config.snapshot.file)?;
        let store: std::sync::Arc<dyn kvsupervisor::snapshot::blob::BlobStore> = match target {
            kvsupervisor::snapshot::blob::BackupTarget::File { path } => {
                std::sync::Arc::new(kvsupervisor::snapshot::blob::FileBlobStore::new(path))
            }
            other => {
                return Err(kvsupervisor::CoreError::Configuration(format!(
                    "backup target {other:?} has no blob store implementation in this binary"
                )));
            }
        };
        let encryption_key = if config.snapshot.encryption { ca_key } else { None };
        let snapshot_config = kvsupervisor::snapshot::SnapshotConfig {
            interval: config.snapshot.interval,
            compression: config.snapshot.compression,
            encryption_key,
            store,
        };
        std::sync::Arc::new(kvsupervisor::snapshot::SnapshotPipeline::new(
            snapshot_config,
            engine.clone(),
            restarting.clone(),
        ))
    };

    let supervisor_config = SupervisorConfig {
        required_cluster_size: config.required_cluster_size,
        self_peer,
        gossip,
        snapshot: Some(snapshot),
    };
    let supervisor = std::sync::Arc::new(Supervisor::new(supervisor_config, engine, restarting));

    let admin_addr = config.admin_addr.parse().map_err(|e| {
        kvsupervisor::CoreError::Configuration(format!("invalid admin_addr '{}': {e}", config.admin_addr))
    })?;
    let admin_supervisor = supervisor.clone();
    tokio::spawn(async move {
        if let Err(e) = kvsupervisor::admin::serve(admin_addr, admin_supervisor).await {
            error!(error = %e, "admin listener exited");
        }
    });

    match supervisor.run().await {
        Ok(()) => {
            info!("kvsupervisor shut down cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "kvsupervisor exiting on fatal error");
            Err(e)
        }
    }
}

/// File under `data_dir` recording this node's Name across restarts, the
/// local stand-in for "a prior embedded member record from the data
/// directory (key path `members`)" since the embedded engine's own on-disk
/// format is outside this crate's scope.
const NODE_NAME_FILE: &str = "node_name";

/// Resolve this node's Name: explicit config, else a prior run's persisted
/// Name, else a fresh random 64-bit hex identity (persisted for next time).
async fn resolve_node_name(config: &kvsupervisor::Config) -> Result<String> {
    if let Some(name) = &config.name {
        return Ok(name.clone());
    }

    let name_path = config.data_dir.join(NODE_NAME_FILE);
    match tokio::fs::read_to_string(&name_path).await {
        Ok(name) => Ok(name.trim().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let name = random_node_name();
            tokio::fs::write(&name_path, &name).await?;
            Ok(name)
        }
        Err(e) => Err(e.into()),
    }
}

fn random_node_name() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn print_banner() {
    println!(
        r#"
  _           _
 | | ____   _| |_   _ _ __   ___ _ ____   __(_)___  ___  _ __
 | |/ /\ \ / / | | | | '_ \ / _ \ '__\ \ / /| / __|/ _ \| '__|
 |   <  \ V /| | |_| | |_) |  __/ |   \ V / | \__ \ (_) | |
 |_|\_\  \_/ |_|\__,_| .__/ \___|_|    \_/  |_|___/\___/|_|
                     |_|
"#
    );
}
