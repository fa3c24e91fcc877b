//! enclave-network — the coordinator of one enclave's service network.
//!
//! [`ServiceNetwork`] owns the lifecycle of user services inside a single
//! enclave: the two-phase register → start flow interleaved with IP
//! allocation, the partition topology and its enforcement through
//! per-service traffic-shaping sidecars, parallel batch start with
//! all-or-nothing rollback, and the readiness gate at the tail of a batch.
//!
//! Every externally visible operation serializes on one enclave-wide mutex,
//! held for the operation's full duration (including backend I/O) —
//! simplicity and strong ordering over throughput. Helpers that require the
//! lock take `&mut NetworkState`, so re-entrance cannot compile.

pub mod error;
mod expansion;
pub mod ip_allocator;
pub mod network;

pub use error::{NetworkError, NetworkResult};
pub use ip_allocator::{IpAllocator, IpAllocatorError};
pub use network::ServiceNetwork;
