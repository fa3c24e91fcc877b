//! The `repartition` instruction.

use std::collections::{BTreeMap, BTreeSet};

use enclave_backend::ServiceId;
use enclave_network::ServiceNetwork;
use enclave_topology::{PartitionConnection, PartitionConnectionId, PartitionId};

use crate::error::InstructionResult;

/// Completely repartition the enclave, throwing away the old topology and
/// pushing the re-derived shaping rules through every sidecar.
///
/// Fails with `PartitioningDisabled` when the enclave was created without
/// partitioning. A sidecar-update failure leaves the new topology in place;
/// re-issuing the same repartition converges.
pub async fn repartition(
    network: &ServiceNetwork,
    partitions: BTreeMap<PartitionId, BTreeSet<ServiceId>>,
    connections: BTreeMap<PartitionConnectionId, PartitionConnection>,
    default_connection: PartitionConnection,
) -> InstructionResult<()> {
    Ok(network
        .repartition(partitions, connections, default_connection)
        .await?)
}
