//! Domain objects shared across the enclave service network.
//!
//! These types mirror what the container backend reports about user
//! services: registrations (id + GUID + private IP), running services with
//! their port bindings, the configs used to launch them, and the filter
//! object used by every bulk backend operation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifacts::ArtifactUuid;

/// Declare a string newtype id with the usual conversions.
macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id! {
    /// Opaque identifier of a live enclave.
    EnclaveId
}

string_id! {
    /// Author-chosen service identifier, unique within an enclave and stable
    /// across restart-in-place.
    ServiceId
}

string_id! {
    /// System-generated identifier, unique within the enclave's lifetime and
    /// stable for the life of one container. The canonical key for backend
    /// resources.
    ServiceGuid
}

string_id! {
    /// Name of a backend volume (used by files-artifact expansion).
    VolumeName
}

impl ServiceGuid {
    /// Derive a fresh GUID for a service registration.
    pub fn generate(service_id: &ServiceId) -> Self {
        Self(format!("{}-{}", service_id, Uuid::new_v4().simple()))
    }
}

// ── Registration & service ─────────────────────────────────────────

/// The reservation of an IP and GUID for a service, created before the
/// container exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub id: ServiceId,
    pub guid: ServiceGuid,
    pub enclave_id: EnclaveId,
    pub private_ip: Ipv4Addr,
}

/// Lifecycle status of a user service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Registered (IP + GUID reserved) but no container started yet.
    Registered,
    /// The container is running.
    Running,
    /// The container was stopped but not destroyed; logs remain readable.
    Stopped,
}

/// Transport protocol of a service port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortProtocol {
    Tcp,
    Udp,
}

/// A single port a service listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub number: u16,
    pub protocol: PortProtocol,
}

impl PortSpec {
    pub fn tcp(number: u16) -> Self {
        Self {
            number,
            protocol: PortProtocol::Tcp,
        }
    }

    pub fn udp(number: u16) -> Self {
        Self {
            number,
            protocol: PortProtocol::Udp,
        }
    }
}

/// A user service as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub registration: ServiceRegistration,
    pub status: ServiceStatus,
    /// Ports the service listens on inside the enclave, by port id.
    pub private_ports: BTreeMap<String, PortSpec>,
    /// Public IP the backend bound for the service, if any.
    pub maybe_public_ip: Option<Ipv4Addr>,
    /// Public port bindings, if any.
    pub maybe_public_ports: Option<BTreeMap<String, PortSpec>>,
}

// ── Service config ─────────────────────────────────────────────────

/// Everything needed to launch one service container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub image: String,
    pub private_ports: BTreeMap<String, PortSpec>,
    pub public_ports: BTreeMap<String, PortSpec>,
    pub entrypoint_args: Vec<String>,
    pub cmd_args: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    /// Files artifacts to expand into the container, artifact uuid →
    /// mountpoint on the service container.
    pub files_artifact_mounts: BTreeMap<ArtifactUuid, String>,
    pub cpu_allocation_millicpus: u64,
    pub memory_allocation_megabytes: u64,
}

impl ServiceConfig {
    /// A config for `image` with no ports, args, env, or mounts.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            private_ports: BTreeMap::new(),
            public_ports: BTreeMap::new(),
            entrypoint_args: Vec::new(),
            cmd_args: Vec::new(),
            env_vars: BTreeMap::new(),
            files_artifact_mounts: BTreeMap::new(),
            cpu_allocation_millicpus: 0,
            memory_allocation_megabytes: 0,
        }
    }

    pub fn with_private_port(mut self, port_id: impl Into<String>, port: PortSpec) -> Self {
        self.private_ports.insert(port_id.into(), port);
        self
    }

    pub fn with_artifact_mount(
        mut self,
        artifact: ArtifactUuid,
        mountpoint: impl Into<String>,
    ) -> Self {
        self.files_artifact_mounts.insert(artifact, mountpoint.into());
        self
    }
}

// ── Filters ────────────────────────────────────────────────────────

/// Selects user services for bulk backend operations.
///
/// An absent field matches everything; a present field matches services
/// whose corresponding attribute is in the set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceFilters {
    pub guids: Option<BTreeSet<ServiceGuid>>,
    pub ids: Option<BTreeSet<ServiceId>>,
    pub statuses: Option<BTreeSet<ServiceStatus>>,
}

impl ServiceFilters {
    /// Matches every service.
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches exactly one GUID.
    pub fn by_guid(guid: ServiceGuid) -> Self {
        Self {
            guids: Some(BTreeSet::from([guid])),
            ..Self::default()
        }
    }

    /// Matches exactly one service id.
    pub fn by_id(id: ServiceId) -> Self {
        Self {
            ids: Some(BTreeSet::from([id])),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: ServiceStatus) -> Self {
        self.statuses.get_or_insert_with(BTreeSet::new).insert(status);
        self
    }

    /// Whether `service` passes every present field.
    pub fn matches(&self, service: &Service) -> bool {
        if let Some(guids) = &self.guids {
            if !guids.contains(&service.registration.guid) {
                return false;
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&service.registration.id) {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&service.status) {
                return false;
            }
        }
        true
    }
}

// ── Exec & sidecars ────────────────────────────────────────────────

/// Result of one exec command run inside a service container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub output: String,
}

/// Handle to a networking sidecar container created by the backend.
///
/// The sidecar is a privileged companion co-located with one service
/// container; traffic-shaping commands are exec'd inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarHandle {
    pub sidecar_guid: String,
    pub service_guid: ServiceGuid,
}
