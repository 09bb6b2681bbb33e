//! Runtime member identities

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::node::NodeIdentity;

/// Identity of one live incarnation of a node.
///
/// The name is the node's server name; the token is minted once per process
/// incarnation, so a restarted node reconnects under a different `MemberId`
/// even though its name is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId {
    name: String,
    token: Uuid,
}

impl MemberId {
    /// Mint a new incarnation for the given server name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: Uuid::new_v4(),
        }
    }

    /// Mint a new incarnation of a configured node
    pub fn for_node(node: &NodeIdentity) -> Self {
        Self::new(node.server_name())
    }

    pub fn with_token(name: impl Into<String>, token: Uuid) -> Self {
        Self {
            name: name.into(),
            token,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    /// Whether this member is an incarnation of the given location
    pub fn is_incarnation_of(&self, node: &NodeIdentity) -> bool {
        self.name == node.server_name()
    }

    /// Whether both identities name the same location, possibly different incarnations
    pub fn same_location(&self, other: &MemberId) -> bool {
        self.name == other.name
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = self.token.simple().to_string();
        write!(f, "{}#{}", self.name, &token[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incarnations_differ() {
        let node = NodeIdentity::new("node-a", 9510, 9530);
        let first = MemberId::for_node(&node);
        let second = MemberId::for_node(&node);

        assert_ne!(first, second);
        assert!(first.same_location(&second));
        assert!(first.is_incarnation_of(&node));
        assert!(second.is_incarnation_of(&node));
        assert!(!first.is_incarnation_of(&NodeIdentity::new("node-b", 9510, 9530)));
    }

    #[test]
    fn test_display() {
        let id = MemberId::with_token("node-a:9510", Uuid::nil());
        assert_eq!(id.to_string(), "node-a:9510#00000000");
    }
}
