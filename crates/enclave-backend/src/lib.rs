//! enclave-backend — container backend contracts and domain objects.
//!
//! The service network core never talks to a container daemon directly; it
//! consumes the [`ContainerBackend`] capability trait defined here. The
//! trait may be implemented over a local container daemon, a cluster
//! controller, or (for tests) the in-memory [`MockBackend`].
//!
//! This crate also owns the domain objects shared by every other crate in
//! the workspace (service ids, registrations, configs, filters) and the
//! [`FilesArtifactStore`] contract for content-addressed tar.gz blobs.

pub mod artifacts;
pub mod backend;
pub mod mock;
pub mod objects;

pub use artifacts::{ArtifactUuid, FilesArtifactStore, InMemoryFilesArtifactStore};
pub use backend::{BackendError, BackendResult, ContainerBackend, ExpanderRunResult, LogStream};
pub use mock::MockBackend;
pub use objects::{
    EnclaveId, ExecResult, PortProtocol, PortSpec, Service, ServiceConfig, ServiceFilters,
    ServiceGuid, ServiceId, ServiceRegistration, ServiceStatus, SidecarHandle, VolumeName,
};
