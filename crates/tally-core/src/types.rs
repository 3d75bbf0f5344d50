//! Core type definitions for Tally

use serde::{Deserialize, Serialize};
use std::fmt;

/// PeerId - Opaque identifier of a network node
///
/// On the wire this is the base58 form of the libp2p peer id; the core
/// crate treats it as an opaque string so that it does not depend on the
/// networking stack.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a new PeerId from its string form
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the string form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty id marks a missing validator on inbound votes
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_display() {
        let id = PeerId::new("12D3KooWabc");
        assert_eq!(id.to_string(), "12D3KooWabc");
        assert_eq!(format!("{:?}", id), "PeerId(12D3KooWabc)");
        assert!(!id.is_empty());
        assert!(PeerId::default().is_empty());
    }
}
