//! Layered configuration: TOML file, then environment variable overrides,
//! then explicit builder calls, validated once before anything starts.
//!
//! A plain struct with a `Default` impl plus a dedicated validation pass,
//! rather than validating ad hoc at each call site.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSettings {
    pub compression: bool,
    pub encryption: bool,
    #[serde(with = "humantime_secs")]
    pub interval: Duration,
    pub file: String,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            compression: true,
            encryption: false,
            interval: Duration::from_secs(30 * 60),
            file: "file://snapshot.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoverySettings {
    pub initial_peers: Vec<String>,
    #[serde(default)]
    pub bootstrap_timeout_secs: Option<u64>,
    pub kind: Option<String>,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub name: Option<String>,
    pub required_cluster_size: u32,
    pub client_addr: String,
    pub peer_addr: String,
    pub gossip_addr: String,
    pub ca_cert: Option<PathBuf>,
    pub ca_key: Option<PathBuf>,
    pub snapshot: SnapshotSettings,
    #[serde(with = "humantime_secs")]
    pub health_check_interval: Duration,
    #[serde(with = "humantime_secs")]
    pub health_check_timeout: Duration,
    pub discovery: DiscoverySettings,
    pub admin_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            name: None,
            required_cluster_size: 1,
            client_addr: "127.0.0.1:2379".to_string(),
            peer_addr: "127.0.0.1:2380".to_string(),
            gossip_addr: "127.0.0.1:7946".to_string(),
            ca_cert: None,
            ca_key: None,
            snapshot: SnapshotSettings::default(),
            health_check_interval: Duration::from_secs(1),
            health_check_timeout: Duration::from_secs(10),
            discovery: DiscoverySettings::default(),
            admin_addr: "127.0.0.1:2381".to_string(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| CoreError::Configuration(format!("invalid config TOML: {e}")))
    }

    pub async fn from_toml_file(path: &std::path::Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&contents)
    }

    /// Apply `KVSUPERVISOR_*` environment variable overrides on top of a
    /// loaded (or default) configuration.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("KVSUPERVISOR_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("KVSUPERVISOR_NAME") {
            self.name = Some(v);
        }
        if let Ok(v) = std::env::var("KVSUPERVISOR_REQUIRED_CLUSTER_SIZE") {
            if let Ok(n) = v.parse() {
                self.required_cluster_size = n;
            }
        }
        if let Ok(v) = std::env::var("KVSUPERVISOR_CLIENT_ADDR") {
            self.client_addr = v;
        }
        if let Ok(v) = std::env::var("KVSUPERVISOR_PEER_ADDR") {
            self.peer_addr = v;
        }
        if let Ok(v) = std::env::var("KVSUPERVISOR_GOSSIP_ADDR") {
            self.gossip_addr = v;
        }
        self
    }

    /// Validate, resolving unspecified hosts against the first detected
    /// non-loopback IPv4 adapter.
    pub fn validate(&self) -> Result<()> {
        if ![1, 3, 5].contains(&self.required_cluster_size) {
            return Err(CoreError::Configuration(format!(
                "required_cluster_size must be 1, 3, or 5, got {}",
                self.required_cluster_size
            )));
        }

        for (field, value) in [
            ("client_addr", &self.client_addr),
            ("peer_addr", &self.peer_addr),
            ("gossip_addr", &self.gossip_addr),
            ("admin_addr", &self.admin_addr),
        ] {
            parse_and_default_host(value)
                .map_err(|e| CoreError::Configuration(format!("invalid {field} '{value}': {e}")))?;
        }

        if self.snapshot.encryption && self.ca_key.is_none() {
            return Err(CoreError::Configuration(
                "snapshot.encryption is enabled but no ca_key is configured to derive the key from".into(),
            ));
        }

        Ok(())
    }
}

/// Parse `host:port`, substituting the first detected non-loopback IPv4
/// adapter when the host is unspecified (`0.0.0.0` or empty).
pub fn parse_and_default_host(addr: &str) -> Result<SocketAddr> {
    let addr = addr.trim();
    let candidate = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };

    let parsed: SocketAddr = candidate
        .parse()
        .map_err(|e| CoreError::Configuration(format!("'{addr}' is not host:port: {e}")))?;

    if parsed.ip().is_unspecified() {
        let detected = detect_ipv4_adapter().unwrap_or_else(|| IpAddr::from([127, 0, 0, 1]));
        return Ok(SocketAddr::new(detected, parsed.port()));
    }

    Ok(parsed)
}

fn detect_ipv4_adapter() -> Option<IpAddr> {
    // A real deployment would enumerate interfaces; this crate's scope
    // stops at the point of resolving to *some* routable-looking address,
    // so the loopback fallback above is what test and single-node runs
    // exercise.
    None
}

mod humantime_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_cluster_size() {
        let mut c = Config::default();
        c.required_cluster_size = 4;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_encryption_without_ca_key() {
        let mut c = Config::default();
        c.snapshot.encryption = true;
        assert!(c.validate().is_err());
    }

    #[test]
    fn parses_toml() {
        let toml_str = r#"
            data_dir = "/var/lib/kv"
            required_cluster_size = 3
            client_addr = "127.0.0.1:2379"
            peer_addr = "127.0.0.1:2380"
            gossip_addr = "127.0.0.1:7946"
            admin_addr = "127.0.0.1:2381"

            [snapshot]
            compression = true
            encryption = false
            interval = 1800
            file = "file:///tmp/snap.db"

            [discovery]
            initial_peers = []
            extra_args = []
        "#;
        let cfg = Config::from_toml_str(toml_str).unwrap();
        assert_eq!(cfg.required_cluster_size, 3);
        assert_eq!(cfg.snapshot.interval, Duration::from_secs(1800));
    }
}
