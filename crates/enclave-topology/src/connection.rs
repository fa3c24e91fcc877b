//! Partition identifiers and pairwise connection properties.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::topology::TopologyError;

/// Name of a partition inside one enclave. The distinguished value
/// `"default"` always exists.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The partition every service lands in unless placed elsewhere.
    pub fn default_partition() -> Self {
        Self("default".to_string())
    }

    pub fn is_default(&self) -> bool {
        self.0 == "default"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PartitionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Symmetric connection property between two partitions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartitionConnection {
    /// Packet loss applied to traffic crossing the partition pair, 0–100.
    pub packet_loss_percentage: f32,
}

impl PartitionConnection {
    /// Traffic flows untouched.
    pub const UNBLOCKED: Self = Self {
        packet_loss_percentage: 0.0,
    };

    /// All traffic between the pair is dropped.
    pub const BLOCKED: Self = Self {
        packet_loss_percentage: 100.0,
    };

    pub fn new(packet_loss_percentage: f32) -> Result<Self, TopologyError> {
        if !(0.0..=100.0).contains(&packet_loss_percentage) {
            return Err(TopologyError::InvalidPacketLoss(packet_loss_percentage));
        }
        Ok(Self {
            packet_loss_percentage,
        })
    }

    pub fn is_lossless(&self) -> bool {
        self.packet_loss_percentage == 0.0
    }
}

/// Canonical key for the unordered pair of two partitions.
///
/// The two ids are sorted lexicographically on construction, so the id built
/// from `(X, Y)` and the one built from `(Y, X)` are the same value and hash
/// identically — connection lookup is commutative by construction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionConnectionId {
    lesser: PartitionId,
    greater: PartitionId,
}

impl PartitionConnectionId {
    pub fn new(first: PartitionId, second: PartitionId) -> Self {
        if first <= second {
            Self {
                lesser: first,
                greater: second,
            }
        } else {
            Self {
                lesser: second,
                greater: first,
            }
        }
    }

    pub fn lesser(&self) -> &PartitionId {
        &self.lesser
    }

    pub fn greater(&self) -> &PartitionId {
        &self.greater
    }
}

impl fmt::Display for PartitionConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.lesser, self.greater)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn connection_id_is_commutative() {
        let forward = PartitionConnectionId::new("partition1".into(), "partition2".into());
        let reverse = PartitionConnectionId::new("partition2".into(), "partition1".into());
        assert_eq!(forward, reverse);

        let map = BTreeMap::from([(forward, PartitionConnection::BLOCKED)]);
        let looked_up = map
            .get(&PartitionConnectionId::new(
                "partition2".into(),
                "partition1".into(),
            ))
            .copied();
        assert_eq!(looked_up, Some(PartitionConnection::BLOCKED));
    }

    #[test]
    fn packet_loss_outside_range_is_rejected() {
        assert!(PartitionConnection::new(-0.1).is_err());
        assert!(PartitionConnection::new(100.1).is_err());
        assert!(PartitionConnection::new(0.0).is_ok());
        assert!(PartitionConnection::new(100.0).is_ok());
    }

    #[test]
    fn default_partition_is_named_default() {
        assert_eq!(PartitionId::default_partition().as_str(), "default");
        assert!(PartitionId::default_partition().is_default());
        assert!(!PartitionId::from("p1").is_default());
    }
}
