//! rotad.toml configuration parser.
//!
//! ```toml
//! [node]
//! name = "node-1"
//! listen = "0.0.0.0:7400"
//! api_port = 8440
//!
//! [cluster]
//! name = "jobs"
//! voters = ["node-1", "node-2", "node-3"]
//! heartbeat_interval_ms = 500
//! suspect_after = 3
//! peers = [
//!   { name = "node-1", addr = "10.0.0.1:7400" },
//!   { name = "node-2", addr = "10.0.0.2:7400" },
//!   { name = "node-3", addr = "10.0.0.3:7400" },
//! ]
//!
//! [timeouts]
//! call_ms = 10000
//!
//! [payloads]
//! jobs = [1, 2, 3]
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rotagrid_node::NodeConfig;
use rotagrid_state::MemberId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotadConfig {
    pub node: NodeSection,
    pub cluster: ClusterSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub payloads: PayloadsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    pub name: String,
    /// gRPC listen address.
    pub listen: String,
    pub api_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    pub name: String,
    /// Initial voting set; defaults to every peer.
    pub voters: Option<Vec<String>>,
    pub heartbeat_interval_ms: Option<u64>,
    pub suspect_after: Option<u32>,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    pub addr: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutsSection {
    pub call_ms: Option<u64>,
    pub confirm_ms: Option<u64>,
    pub snapshot_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayloadsSection {
    #[serde(default)]
    pub jobs: Vec<u32>,
}

impl RotadConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: RotadConfig = toml::from_str(content)?;
        if config.voters().is_empty() {
            anyhow::bail!("cluster.voters must name at least one member");
        }
        Ok(config)
    }

    /// Voting set, falling back to every peer, or to this node alone
    /// when no peers are listed.
    pub fn voters(&self) -> Vec<MemberId> {
        match &self.cluster.voters {
            Some(names) => names.iter().map(|n| MemberId::from(n.as_str())).collect(),
            None if self.cluster.peers.is_empty() => vec![MemberId::from(self.node.name.as_str())],
            None => self
                .cluster
                .peers
                .iter()
                .map(|p| MemberId::from(p.name.as_str()))
                .collect(),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms.unwrap_or(500))
    }

    pub fn suspect_after(&self) -> u32 {
        self.cluster.suspect_after.unwrap_or(3)
    }

    /// Node timeouts, falling back to the library defaults.
    pub fn node_config(&self) -> NodeConfig {
        let mut config = NodeConfig::default();
        if let Some(ms) = self.timeouts.call_ms {
            config = config.with_call_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.timeouts.confirm_ms {
            config = config.with_confirm_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.timeouts.snapshot_ms {
            config = config.with_snapshot_timeout(Duration::from_millis(ms));
        }
        config
    }
}
