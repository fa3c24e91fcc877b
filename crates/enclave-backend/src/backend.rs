//! The container backend capability trait.
//!
//! Everything the service network needs from whatever actually runs
//! containers: registering and starting user services, bulk stop/destroy,
//! exec, file copy-out, log streams, networking sidecars, and the volume
//! ops behind files-artifact expansion.
//!
//! Implementations must be thread-safe for distinct service GUIDs. Callers
//! may be cancelled mid-operation; the core runs its cleanup paths on
//! detached tasks so a cancelled caller cannot leak backend resources.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::artifacts::ArtifactUuid;
use crate::objects::{
    EnclaveId, ExecResult, Service, ServiceConfig, ServiceFilters, ServiceGuid, ServiceId,
    ServiceRegistration, SidecarHandle, VolumeName,
};

/// Errors surfaced by container backend implementations.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("pulling image '{image}' failed: {message}")]
    ImagePull { image: String, message: String },

    #[error("no service matches guid '{0}'")]
    ServiceNotFound(ServiceGuid),

    #[error("container for service '{0}' is not running")]
    NotRunning(ServiceGuid),

    #[error("launching container failed: {0}")]
    Launch(String),

    #[error("volume '{volume}' operation failed: {message}")]
    Volume { volume: VolumeName, message: String },

    #[error("exec inside container failed: {0}")]
    Exec(String),

    #[error("sidecar operation failed for service '{service_guid}': {message}")]
    Sidecar {
        service_guid: ServiceGuid,
        message: String,
    },

    #[error("backend transport error: {0}")]
    Transport(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A readable log stream attached to one service container.
pub type LogStream = Box<dyn AsyncRead + Send + Unpin>;

/// Outcome of one files-artifact expander container run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpanderRunResult {
    pub exit_code: i64,
    /// Captured stderr, surfaced in errors when the exit code is non-zero.
    pub stderr: String,
}

/// Capability interface over the container runtime backing one enclave.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Reserve backend resources for a service, yielding its registration.
    ///
    /// The private IP is allocated by the caller (the enclave owns its CIDR);
    /// the backend mints the GUID.
    async fn register_user_service(
        &self,
        enclave_id: &EnclaveId,
        service_id: &ServiceId,
        private_ip: Ipv4Addr,
    ) -> BackendResult<ServiceRegistration>;

    /// Batch registration; partial failure is reported per id.
    async fn register_user_services(
        &self,
        enclave_id: &EnclaveId,
        ids_to_ips: &BTreeMap<ServiceId, Ipv4Addr>,
    ) -> BackendResult<(
        BTreeMap<ServiceId, ServiceRegistration>,
        BTreeMap<ServiceId, BackendError>,
    )>;

    /// Start the container for a previously-registered service.
    ///
    /// `volume_mounts` maps expansion volume names to mountpoints on the
    /// service container.
    async fn start_user_service(
        &self,
        enclave_id: &EnclaveId,
        guid: &ServiceGuid,
        config: &ServiceConfig,
        volume_mounts: &BTreeMap<VolumeName, String>,
    ) -> BackendResult<Service>;

    /// All services matching `filters`, keyed by GUID.
    async fn get_user_services(
        &self,
        enclave_id: &EnclaveId,
        filters: &ServiceFilters,
    ) -> BackendResult<BTreeMap<ServiceGuid, Service>>;

    /// Log streams for services matching `filters`.
    async fn get_user_service_logs(
        &self,
        enclave_id: &EnclaveId,
        filters: &ServiceFilters,
        follow: bool,
    ) -> BackendResult<BTreeMap<ServiceGuid, LogStream>>;

    /// Stop (but keep) containers matching `filters`.
    ///
    /// `stop_timeout` is how long containers get to exit gracefully before
    /// being killed; implementations with their own grace period apply
    /// whichever is shorter.
    async fn stop_user_services(
        &self,
        enclave_id: &EnclaveId,
        filters: &ServiceFilters,
        stop_timeout: Duration,
    ) -> BackendResult<(BTreeSet<ServiceGuid>, BTreeMap<ServiceGuid, BackendError>)>;

    /// Destroy containers and registrations matching `filters`.
    async fn destroy_user_services(
        &self,
        enclave_id: &EnclaveId,
        filters: &ServiceFilters,
    ) -> BackendResult<(BTreeSet<ServiceGuid>, BTreeMap<ServiceGuid, BackendError>)>;

    /// Run one exec command per GUID inside the matching containers.
    async fn run_user_service_exec_commands(
        &self,
        enclave_id: &EnclaveId,
        commands: &BTreeMap<ServiceGuid, Vec<String>>,
    ) -> BackendResult<(
        BTreeMap<ServiceGuid, ExecResult>,
        BTreeMap<ServiceGuid, BackendError>,
    )>;

    async fn pause_service(
        &self,
        enclave_id: &EnclaveId,
        guid: &ServiceGuid,
    ) -> BackendResult<()>;

    async fn unpause_service(
        &self,
        enclave_id: &EnclaveId,
        guid: &ServiceGuid,
    ) -> BackendResult<()>;

    /// Stream a tar of `src_path` from inside the container into `sink`.
    ///
    /// Implementations must stream: no full buffering of the payload, and
    /// writes must observe `sink` back-pressure.
    async fn copy_files_from_user_service(
        &self,
        enclave_id: &EnclaveId,
        guid: &ServiceGuid,
        src_path: &str,
        sink: &mut (dyn Write + Send),
    ) -> BackendResult<()>;

    // ── Files-artifact expansion ───────────────────────────────────

    /// Create a dedicated volume for expanding one artifact of a service.
    async fn create_expansion_volume(
        &self,
        enclave_id: &EnclaveId,
        service_guid: &ServiceGuid,
    ) -> BackendResult<VolumeName>;

    /// Run the short-lived expander container that extracts `artifact` into
    /// `volume`, waiting for it to exit.
    async fn run_expander_container(
        &self,
        enclave_id: &EnclaveId,
        service_guid: &ServiceGuid,
        artifact: &ArtifactUuid,
        volume: &VolumeName,
    ) -> BackendResult<ExpanderRunResult>;

    async fn destroy_volume(
        &self,
        enclave_id: &EnclaveId,
        volume: &VolumeName,
    ) -> BackendResult<()>;

    // ── Networking sidecars ────────────────────────────────────────

    /// Create the privileged sidecar container co-located with a service.
    async fn create_networking_sidecar(
        &self,
        enclave_id: &EnclaveId,
        service_guid: &ServiceGuid,
    ) -> BackendResult<SidecarHandle>;

    /// Run `commands` inside the sidecar, in order; every command must
    /// exit 0.
    async fn run_sidecar_exec_commands(
        &self,
        enclave_id: &EnclaveId,
        sidecar: &SidecarHandle,
        commands: &[Vec<String>],
    ) -> BackendResult<()>;

    async fn destroy_networking_sidecar(
        &self,
        enclave_id: &EnclaveId,
        sidecar: &SidecarHandle,
    ) -> BackendResult<()>;
}
