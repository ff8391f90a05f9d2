//! Shibui Configuration
//!
//! Node identity, cluster formation tuning and logging settings. Every
//! section has defaults so a node can run from CLI flags alone; a TOML
//! file overrides them and CLI flags override the file.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::cluster::{FormationConfig, BUS_PORT_OFFSET};

/// Main shibui configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShibuiConfig {
    /// Node-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Cluster formation configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Operator-assigned node name
    #[serde(default = "default_node_id")]
    pub id: String,

    /// Address the client and bus listeners bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Client port; the bus port is derived from it
    #[serde(default = "default_client_port")]
    pub client_port: u16,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Run in cluster mode (form a cluster from the peers file)
    #[serde(default)]
    pub enabled: bool,

    /// Peers file, one `<address> <port> <name>` per line
    #[serde(default = "default_peers_file")]
    pub peers_file: PathBuf,

    /// Size of the hash space partitioned across members. Must match on every node.
    #[serde(default = "default_hash_span")]
    pub hash_span: u64,

    /// Delay before the first probe pass, lets local listeners come up
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Initial sleep between probe passes in milliseconds
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Upper bound for the backed-off probe interval in milliseconds
    #[serde(default = "default_max_probe_interval_ms")]
    pub max_probe_interval_ms: u64,

    /// Give up after this many probe passes (unset = retry forever)
    #[serde(default)]
    pub max_probe_passes: Option<u32>,

    /// TCP connect timeout for bus dials in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Timeout for the hello/welcome exchange in milliseconds
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_node_id() -> String {
    "A".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_client_port() -> u16 {
    6373
}

fn default_peers_file() -> PathBuf {
    PathBuf::from("./conf/cluster.conf")
}

fn default_hash_span() -> u64 {
    16384
}

fn default_grace_period_ms() -> u64 {
    2000
}

fn default_probe_interval_ms() -> u64 {
    3000
}

fn default_max_probe_interval_ms() -> u64 {
    30000
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

fn default_handshake_timeout_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            bind_address: default_bind_address(),
            client_port: default_client_port(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            peers_file: default_peers_file(),
            hash_span: default_hash_span(),
            grace_period_ms: default_grace_period_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            max_probe_interval_ms: default_max_probe_interval_ms(),
            max_probe_passes: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ShibuiConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ShibuiConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.node.client_port == 0 || self.node.client_port.checked_add(BUS_PORT_OFFSET).is_none() {
            return Err(crate::Error::Config(format!(
                "node.client_port must be between 1 and {}",
                u16::MAX - BUS_PORT_OFFSET
            )));
        }

        if self.cluster.hash_span == 0 {
            return Err(crate::Error::Config("cluster.hash_span must be positive".into()));
        }

        if self.cluster.probe_interval_ms == 0 {
            return Err(crate::Error::Config("cluster.probe_interval_ms must be positive".into()));
        }

        if self.cluster.max_probe_interval_ms < self.cluster.probe_interval_ms {
            return Err(crate::Error::Config(
                "cluster.max_probe_interval_ms cannot be below cluster.probe_interval_ms".into(),
            ));
        }

        if self.cluster.max_probe_passes == Some(0) {
            return Err(crate::Error::Config("cluster.max_probe_passes must be positive when set".into()));
        }

        Ok(())
    }

    /// Bus port derived from the client port
    pub fn bus_port(&self) -> u16 {
        self.node.client_port.saturating_add(BUS_PORT_OFFSET)
    }

    /// Bus listener bind address (host:port)
    pub fn bus_address(&self) -> String {
        format!("{}:{}", self.node.bind_address, self.bus_port())
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.connect_timeout_ms)
    }

    /// Get handshake timeout as Duration
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.handshake_timeout_ms)
    }

    /// Formation coordinator settings
    pub fn formation_config(&self) -> FormationConfig {
        FormationConfig {
            grace_period: Duration::from_millis(self.cluster.grace_period_ms),
            probe_interval: Duration::from_millis(self.cluster.probe_interval_ms),
            max_probe_interval: Duration::from_millis(self.cluster.max_probe_interval_ms),
            max_probe_passes: self.cluster.max_probe_passes,
            hash_span: self.cluster.hash_span,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "B"
bind_address = "10.0.0.2"
client_port = 6380

[cluster]
enabled = true
peers_file = "/etc/shibui/cluster.conf"
hash_span = 1024
probe_interval_ms = 500
max_probe_interval_ms = 4000
max_probe_passes = 20
"#;

        let config = ShibuiConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "B");
        assert_eq!(config.bus_port(), 6480);
        assert_eq!(config.bus_address(), "10.0.0.2:6480");
        assert!(config.cluster.enabled);
        assert_eq!(config.cluster.hash_span, 1024);

        let formation = config.formation_config();
        assert_eq!(formation.probe_interval, Duration::from_millis(500));
        assert_eq!(formation.max_probe_passes, Some(20));
        assert_eq!(formation.grace_period, Duration::from_millis(2000));
    }

    #[test]
    fn test_defaults() {
        let config = ShibuiConfig::from_str("").unwrap();
        assert_eq!(config.node.id, "A");
        assert_eq!(config.node.bind_address, "127.0.0.1");
        assert_eq!(config.node.client_port, 6373);
        assert_eq!(config.bus_port(), 6473);
        assert!(!config.cluster.enabled);
        assert_eq!(config.cluster.peers_file, PathBuf::from("./conf/cluster.conf"));
        assert_eq!(config.cluster.max_probe_passes, None);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_rejects_client_port_without_bus_room() {
        let toml = r#"
[node]
client_port = 65500
"#;
        assert!(matches!(ShibuiConfig::from_str(toml), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_rejects_backoff_cap_below_interval() {
        let toml = r#"
[cluster]
probe_interval_ms = 5000
max_probe_interval_ms = 1000
"#;
        assert!(ShibuiConfig::from_str(toml).is_err());
    }
}
