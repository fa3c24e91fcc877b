//! enclave-topology — the partition topology of one enclave.
//!
//! A pure, in-memory data model: named partitions of services, a symmetric
//! connection property per partition pair (currently a packet-loss
//! percentage), and the derived per-service packet-loss view the sidecar
//! layer enforces. No I/O happens here; the coordinator owns when the
//! derived matrix is pushed into sidecars.
//!
//! All collections are ordered (`BTreeMap`/`BTreeSet`) so that two
//! identical topologies derive byte-identical matrices.

pub mod connection;
pub mod topology;

pub use connection::{PartitionConnection, PartitionConnectionId, PartitionId};
pub use topology::{PacketLossMatrix, PartitionTopology, TopologyError, TopologyResult};
