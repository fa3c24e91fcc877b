//! The partition topology and its derived packet-loss matrix.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::debug;

use enclave_backend::ServiceId;

use crate::connection::{PartitionConnection, PartitionConnectionId, PartitionId};

/// Errors raised by topology mutations.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("no partition with id '{0}' exists in the current topology")]
    UnknownPartition(PartitionId),

    #[error("service '{service}' is already placed in partition '{partition}'")]
    ServiceAlreadyPlaced {
        service: ServiceId,
        partition: PartitionId,
    },

    #[error("service '{0}' appears in more than one partition of the new topology")]
    DuplicatePlacement(ServiceId),

    #[error("the new topology is missing currently-registered services: {0:?}")]
    ServicesMissing(Vec<ServiceId>),

    #[error("a connection override references partition '{0}', which is not in the new topology")]
    UnknownPartitionReferenced(PartitionId),

    #[error("packet loss percentage {0} is outside [0, 100]")]
    InvalidPacketLoss(f32),
}

pub type TopologyResult<T> = Result<T, TopologyError>;

/// Derived per-service shaping plan: for each service, the packet-loss
/// percentage its egress rules must apply per destination service.
/// Zero-loss pairs are omitted; consumers treat absence as 0 %.
pub type PacketLossMatrix = BTreeMap<ServiceId, BTreeMap<ServiceId, f32>>;

/// Partitions of one enclave plus the connection properties between them.
///
/// Invariants: every known service is in exactly one partition; the
/// `"default"` partition always exists.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionTopology {
    default_connection: PartitionConnection,
    partitions: BTreeMap<PartitionId, BTreeSet<ServiceId>>,
    /// Reverse index, kept in lockstep with `partitions`.
    service_partitions: BTreeMap<ServiceId, PartitionId>,
    connection_overrides: BTreeMap<PartitionConnectionId, PartitionConnection>,
}

impl PartitionTopology {
    /// A topology with only the empty default partition.
    pub fn new(default_connection: PartitionConnection) -> Self {
        Self {
            default_connection,
            partitions: BTreeMap::from([(PartitionId::default_partition(), BTreeSet::new())]),
            service_partitions: BTreeMap::new(),
            connection_overrides: BTreeMap::new(),
        }
    }

    /// Place a service into an existing partition.
    pub fn add_service(
        &mut self,
        service_id: ServiceId,
        partition_id: PartitionId,
    ) -> TopologyResult<()> {
        if let Some(existing) = self.service_partitions.get(&service_id) {
            return Err(TopologyError::ServiceAlreadyPlaced {
                service: service_id,
                partition: existing.clone(),
            });
        }
        let members = self
            .partitions
            .get_mut(&partition_id)
            .ok_or_else(|| TopologyError::UnknownPartition(partition_id.clone()))?;
        members.insert(service_id.clone());
        self.service_partitions.insert(service_id, partition_id);
        Ok(())
    }

    /// Drop a service from whatever partition holds it. Idempotent; returns
    /// whether anything changed.
    pub fn remove_service(&mut self, service_id: &ServiceId) -> bool {
        match self.service_partitions.remove(service_id) {
            Some(partition_id) => {
                if let Some(members) = self.partitions.get_mut(&partition_id) {
                    members.remove(service_id);
                }
                true
            }
            None => false,
        }
    }

    /// Atomically replace the partition map, the connection overrides, and
    /// the default connection.
    ///
    /// Fails without modifying anything if the new partitions omit a
    /// currently-known service, place one twice, or an override references a
    /// partition absent from the new map. An empty `"default"` partition is
    /// re-inserted if the caller's map lacks one, preserving the invariant
    /// that it always exists.
    pub fn repartition(
        &mut self,
        new_partitions: BTreeMap<PartitionId, BTreeSet<ServiceId>>,
        new_overrides: BTreeMap<PartitionConnectionId, PartitionConnection>,
        new_default: PartitionConnection,
    ) -> TopologyResult<()> {
        let mut new_service_partitions: BTreeMap<ServiceId, PartitionId> = BTreeMap::new();
        for (partition_id, members) in &new_partitions {
            for service_id in members {
                if new_service_partitions
                    .insert(service_id.clone(), partition_id.clone())
                    .is_some()
                {
                    return Err(TopologyError::DuplicatePlacement(service_id.clone()));
                }
            }
        }

        let missing: Vec<ServiceId> = self
            .service_partitions
            .keys()
            .filter(|id| !new_service_partitions.contains_key(*id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(TopologyError::ServicesMissing(missing));
        }

        for connection_id in new_overrides.keys() {
            for partition_id in [connection_id.lesser(), connection_id.greater()] {
                if !new_partitions.contains_key(partition_id) {
                    return Err(TopologyError::UnknownPartitionReferenced(
                        partition_id.clone(),
                    ));
                }
            }
        }

        self.partitions = new_partitions;
        self.partitions
            .entry(PartitionId::default_partition())
            .or_default();
        self.service_partitions = new_service_partitions;
        self.connection_overrides = new_overrides;
        self.default_connection = new_default;
        debug!(
            partitions = self.partitions.len(),
            overrides = self.connection_overrides.len(),
            "topology repartitioned"
        );
        Ok(())
    }

    /// The connection between two partitions: the override for the unordered
    /// pair if one exists, else the default. A partition's connection to
    /// itself is always unblocked.
    pub fn connection(&self, first: &PartitionId, second: &PartitionId) -> PartitionConnection {
        if first == second {
            return PartitionConnection::UNBLOCKED;
        }
        let id = PartitionConnectionId::new(first.clone(), second.clone());
        self.connection_overrides
            .get(&id)
            .copied()
            .unwrap_or(self.default_connection)
    }

    /// Derive the per-service packet-loss view of the current topology.
    ///
    /// A pure function of topology state: for every ordered pair `(A, B)`
    /// with `A != B`, the loss A's rules must apply to traffic bound for B.
    /// Zero-loss entries are omitted.
    pub fn packet_loss_matrix(&self) -> PacketLossMatrix {
        let mut matrix = PacketLossMatrix::new();
        for (service_id, partition_id) in &self.service_partitions {
            let mut row = BTreeMap::new();
            for (other_id, other_partition_id) in &self.service_partitions {
                if other_id == service_id {
                    continue;
                }
                let connection = self.connection(partition_id, other_partition_id);
                if !connection.is_lossless() {
                    row.insert(other_id.clone(), connection.packet_loss_percentage);
                }
            }
            matrix.insert(service_id.clone(), row);
        }
        matrix
    }

    /// The partition currently holding `service_id`, if known.
    pub fn partition_of(&self, service_id: &ServiceId) -> Option<&PartitionId> {
        self.service_partitions.get(service_id)
    }

    pub fn contains_partition(&self, partition_id: &PartitionId) -> bool {
        self.partitions.contains_key(partition_id)
    }

    /// Current partition map.
    pub fn partitions(&self) -> &BTreeMap<PartitionId, BTreeSet<ServiceId>> {
        &self.partitions
    }

    /// Every service the topology knows about.
    pub fn service_ids(&self) -> BTreeSet<ServiceId> {
        self.service_partitions.keys().cloned().collect()
    }
}
