//! Service network error types.

use thiserror::Error;

use enclave_backend::{BackendError, ServiceId};
use enclave_readiness::ReadinessError;
use enclave_sidecar::SidecarError;
use enclave_topology::TopologyError;

use crate::ip_allocator::IpAllocatorError;

/// Errors that can occur while coordinating the service network.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("service id cannot be empty or whitespace")]
    EmptyServiceId,

    #[error("a service with id '{0}' already exists in the enclave")]
    ServiceAlreadyExists(ServiceId),

    #[error("no service with id '{0}' is registered")]
    ServiceNotRegistered(ServiceId),

    #[error("service '{0}' already has a running container")]
    ServiceAlreadyStarted(ServiceId),

    #[error("partitioning is not enabled for this enclave")]
    PartitioningDisabled,

    #[error("service '{0}' has no networking sidecar")]
    SidecarMissing(ServiceId),

    #[error(
        "files artifact expansion for service '{service_id}' exited with code {exit_code}: {stderr}"
    )]
    Expansion {
        service_id: ServiceId,
        exit_code: i64,
        stderr: String,
    },

    #[error("copying files from service '{service_id}' failed: {message}")]
    CopyFiles {
        service_id: ServiceId,
        message: String,
    },

    #[error("internal task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    IpPool(#[from] IpAllocatorError),

    #[error(transparent)]
    Sidecar(#[from] SidecarError),

    #[error(transparent)]
    Readiness(#[from] ReadinessError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type NetworkResult<T> = Result<T, NetworkError>;
