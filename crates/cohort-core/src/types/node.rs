//! Configured peer locations

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::{Error, Result};

/// A configured peer location.
///
/// Two identities are equal when host and port match; the group port is
/// auxiliary routing data and does not take part in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Host name or address
    pub host: String,
    /// Client-facing port, part of the identity
    pub port: u16,
    /// Port the group layer listens on
    pub group_port: u16,
}

impl NodeIdentity {
    pub fn new(host: impl Into<String>, port: u16, group_port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            group_port,
        }
    }

    /// Stable textual name of this location (`host:port`).
    ///
    /// Member identities of every incarnation of this node carry this name.
    pub fn server_name(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Address outbound group channels connect to
    pub fn group_address(&self) -> String {
        format!("{}:{}", self.host, self.group_port)
    }
}

impl PartialEq for NodeIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for NodeIdentity {}

impl Hash for NodeIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parses `host:port` or `host:port:group_port`.
///
/// Without an explicit group port the default offset is applied.
impl FromStr for NodeIdentity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let parse_port = |p: &str| {
            p.parse::<u16>()
                .map_err(|_| Error::InvalidNodeAddress(format!("bad port '{}' in '{}'", p, s)))
        };

        match parts.as_slice() {
            [host, port] if !host.is_empty() => {
                let port = parse_port(port)?;
                let group_port = port
                    .checked_add(crate::DEFAULT_GROUP_PORT_OFFSET)
                    .ok_or_else(|| Error::InvalidNodeAddress(s.to_string()))?;
                Ok(Self::new(*host, port, group_port))
            }
            [host, port, group_port] if !host.is_empty() => {
                Ok(Self::new(*host, parse_port(port)?, parse_port(group_port)?))
            }
            _ => Err(Error::InvalidNodeAddress(s.to_string())),
        }
    }
}
