//! Per-destination packet-loss shaping via `tc` inside the sidecar.
//!
//! The qdisc chain is rebuilt wholesale on every update: an `htb` root whose
//! default class passes traffic untouched, plus one class per impaired
//! destination carrying a `netem loss` child, selected by a `u32` filter on
//! the destination IP. Wholesale replacement keeps updates idempotent and
//! makes the applied rules a pure function of the requested mapping.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use enclave_backend::{BackendError, ContainerBackend, EnclaveId, ServiceGuid, SidecarHandle};

/// Interface the service container's traffic egresses through.
const SERVICE_INTERFACE: &str = "eth0";

/// Rate high enough that htb classes never themselves throttle; shaping is
/// done entirely by the netem children.
const PASSTHROUGH_RATE: &str = "10gbit";

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("sidecar for service '{0}' has not been initialized")]
    NotInitialized(ServiceGuid),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type SidecarResult<T> = Result<T, SidecarError>;

/// Handle to one service's traffic-shaping companion.
///
/// Tracks the last successfully applied mapping so the coordinator can read
/// the live rules back without exec'ing into the container.
pub struct NetworkingSidecar {
    backend: Arc<dyn ContainerBackend>,
    enclave_id: EnclaveId,
    handle: SidecarHandle,
    initialized: bool,
    applied: BTreeMap<Ipv4Addr, f32>,
}

impl NetworkingSidecar {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        enclave_id: EnclaveId,
        handle: SidecarHandle,
    ) -> Self {
        Self {
            backend,
            enclave_id,
            handle,
            initialized: false,
            applied: BTreeMap::new(),
        }
    }

    pub fn service_guid(&self) -> &ServiceGuid {
        &self.handle.service_guid
    }

    pub fn handle(&self) -> &SidecarHandle {
        &self.handle
    }

    /// Install the root qdisc chain. One-shot and idempotent: repeat calls
    /// after a success are no-ops.
    pub async fn initialize(&mut self) -> SidecarResult<()> {
        if self.initialized {
            return Ok(());
        }
        let commands = base_chain_commands();
        self.backend
            .run_sidecar_exec_commands(&self.enclave_id, &self.handle, &commands)
            .await?;
        self.initialized = true;
        debug!(service_guid = %self.handle.service_guid, "sidecar traffic control initialized");
        Ok(())
    }

    /// Replace the shaping rules wholesale with `mapping`. Destinations
    /// absent from the mapping (or mapped to 0) get no rule: their traffic
    /// flows untouched.
    pub async fn apply_shaping(
        &mut self,
        mapping: &BTreeMap<Ipv4Addr, f32>,
    ) -> SidecarResult<()> {
        if !self.initialized {
            return Err(SidecarError::NotInitialized(
                self.handle.service_guid.clone(),
            ));
        }
        let commands = shaping_commands(mapping);
        self.backend
            .run_sidecar_exec_commands(&self.enclave_id, &self.handle, &commands)
            .await?;
        self.applied = mapping
            .iter()
            .filter(|(_, loss)| **loss > 0.0)
            .map(|(ip, loss)| (*ip, *loss))
            .collect();
        debug!(
            service_guid = %self.handle.service_guid,
            impaired_destinations = self.applied.len(),
            "sidecar shaping applied"
        );
        Ok(())
    }

    /// The last successfully applied mapping (impaired destinations only).
    pub fn current_shaping(&self) -> &BTreeMap<Ipv4Addr, f32> {
        &self.applied
    }

    /// Loss percentage currently applied toward `ip`; absent means 0.
    pub fn shaping_for(&self, ip: Ipv4Addr) -> f32 {
        self.applied.get(&ip).copied().unwrap_or(0.0)
    }
}

/// Delete any existing root qdisc and install the passthrough htb chain.
fn base_chain_commands() -> Vec<Vec<String>> {
    vec![
        // The delete fails when no qdisc is installed yet; tolerate it.
        argv([
            "sh",
            "-c",
            &format!("tc qdisc del dev {SERVICE_INTERFACE} root || true"),
        ]),
        argv([
            "tc", "qdisc", "add", "dev", SERVICE_INTERFACE, "root", "handle", "1:", "htb",
            "default", "1",
        ]),
        argv([
            "tc",
            "class",
            "add",
            "dev",
            SERVICE_INTERFACE,
            "parent",
            "1:",
            "classid",
            "1:1",
            "htb",
            "rate",
            PASSTHROUGH_RATE,
        ]),
    ]
}

/// Full command sequence replacing the shaping rules with `mapping`.
fn shaping_commands(mapping: &BTreeMap<Ipv4Addr, f32>) -> Vec<Vec<String>> {
    let mut commands = base_chain_commands();
    let impaired = mapping.iter().filter(|(_, loss)| **loss > 0.0);
    for (index, (ip, loss)) in impaired.enumerate() {
        // Class minor ids start after the passthrough class.
        let minor = index + 2;
        commands.push(argv([
            "tc",
            "class",
            "add",
            "dev",
            SERVICE_INTERFACE,
            "parent",
            "1:",
            "classid",
            &format!("1:{minor}"),
            "htb",
            "rate",
            PASSTHROUGH_RATE,
        ]));
        commands.push(argv([
            "tc",
            "qdisc",
            "add",
            "dev",
            SERVICE_INTERFACE,
            "parent",
            &format!("1:{minor}"),
            "handle",
            &format!("{}:", minor * 10),
            "netem",
            "loss",
            &format!("{loss}%"),
        ]));
        commands.push(argv([
            "tc",
            "filter",
            "add",
            "dev",
            SERVICE_INTERFACE,
            "protocol",
            "ip",
            "parent",
            "1:",
            "prio",
            "1",
            "u32",
            "match",
            "ip",
            "dst",
            &format!("{ip}/32"),
            "flowid",
            &format!("1:{minor}"),
        ]));
    }
    commands
}

fn argv<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
