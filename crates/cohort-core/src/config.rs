//! Configuration for Cohort

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::types::NodeIdentity;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CohortConfig {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub group: GroupConfigSection,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CohortConfig {
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::InvalidConfig(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::InvalidConfig(format!("Failed to parse config: {}", e)))
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("COHORT_HOST") {
            config.node.host = host;
        }
        if let Ok(port) = std::env::var("COHORT_PORT") {
            if let Ok(p) = port.parse() {
                config.node.port = p;
            }
        }
        if let Ok(port) = std::env::var("COHORT_GROUP_PORT") {
            if let Ok(p) = port.parse() {
                config.node.group_port = p;
            }
        }
        if let Ok(peers) = std::env::var("COHORT_PEERS") {
            config.group.peers = peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(relay) = std::env::var("COHORT_RELAY_PEER") {
            config.group.relay_peer = Some(relay);
        }
        if let Ok(level) = std::env::var("COHORT_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("COHORT_LOG_FORMAT") {
            config.logging.format = format;
        }

        config
    }

    /// The local node as a configured location
    pub fn local_node(&self) -> NodeIdentity {
        NodeIdentity::new(self.node.host.clone(), self.node.port, self.node.group_port)
    }

    /// Every configured node of the group, including the local one
    pub fn group_nodes(&self) -> crate::Result<Vec<NodeIdentity>> {
        let local = self.local_node();
        let mut seen = HashSet::new();
        let mut nodes = Vec::with_capacity(self.group.peers.len() + 1);

        for peer in &self.group.peers {
            let node: NodeIdentity = peer.parse()?;
            if !seen.insert(node.clone()) {
                return Err(crate::Error::DuplicateNode(node.server_name()));
            }
            nodes.push(node);
        }

        if seen.insert(local.clone()) {
            nodes.push(local);
        }

        Ok(nodes)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.node.host.is_empty() {
            return Err(crate::Error::InvalidConfig("node.host must not be empty".into()));
        }
        if self.node.port == self.node.group_port {
            return Err(crate::Error::InvalidConfig(
                "node.port and node.group_port must differ".into(),
            ));
        }
        if self.group.discovery_interval_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "group.discovery_interval_ms must be positive".into(),
            ));
        }
        if self.group.handshake_timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "group.handshake_timeout_ms must be positive".into(),
            ));
        }
        if self.group.response_recheck_secs == 0 {
            return Err(crate::Error::InvalidConfig(
                "group.response_recheck_secs must be positive".into(),
            ));
        }
        if self.group.discovery_workers == 0 || self.group.dispatch_queue_size == 0 {
            return Err(crate::Error::InvalidConfig(
                "group worker and queue sizes must be positive".into(),
            ));
        }
        if let Some(relay) = &self.group.relay_peer {
            if relay.trim().is_empty() {
                return Err(crate::Error::InvalidConfig(
                    "group.relay_peer must not be empty".into(),
                ));
            }
            if relay.contains(':') {
                relay.parse::<NodeIdentity>()?;
            }
        }
        self.group_nodes()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Host name peers use to reach this node
    pub host: String,
    /// Client-facing port, part of the node's identity
    pub port: u16,
    /// Port the group layer listens on
    pub group_port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "localhost".to_string()),
            port: crate::DEFAULT_PORT,
            group_port: crate::DEFAULT_PORT + crate::DEFAULT_GROUP_PORT_OFFSET,
        }
    }
}

/// Group membership configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfigSection {
    /// Peer locations (`host:port[:group_port]`), may include this node
    pub peers: Vec<String>,
    /// Peer accepted in addition to the configured ones
    pub relay_peer: Option<String>,
    /// Pause between discovery passes in milliseconds
    pub discovery_interval_ms: u64,
    /// Time allowed for a channel to complete the handshake in milliseconds
    pub handshake_timeout_ms: u64,
    /// Liveness re-check cadence while waiting for responses in seconds
    pub response_recheck_secs: u64,
    /// Optional overall bound on synchronous sends in seconds
    pub response_timeout_secs: Option<u64>,
    /// Concurrent outbound connection attempts
    pub discovery_workers: usize,
    /// Capacity of the inbound message queue
    pub dispatch_queue_size: usize,
    /// Outbound connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Inbound channel limit
    pub max_connections: usize,
    /// Base weights announced during the handshake
    pub weights: Vec<i64>,
}

impl Default for GroupConfigSection {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            relay_peer: None,
            discovery_interval_ms: 1000,
            handshake_timeout_ms: 10_000,
            response_recheck_secs: 5,
            response_timeout_secs: None,
            discovery_workers: 4,
            dispatch_queue_size: 1024,
            connect_timeout_ms: 2000,
            max_connections: 64,
            weights: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
