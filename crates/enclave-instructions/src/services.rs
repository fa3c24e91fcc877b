//! `add_service`, `add_services`, `remove_service`, and `exec`.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::{info, warn};

use enclave_backend::{ExecResult, Service, ServiceConfig, ServiceGuid, ServiceId};
use enclave_network::ServiceNetwork;
use enclave_readiness::ReadyCondition;
use enclave_topology::PartitionId;

use crate::error::{InstructionError, InstructionResult};

/// Stop timeout used when the caller does not pass one. The backend's own
/// grace period takes precedence when shorter.
pub const DEFAULT_CONTAINER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything `add_services` needs to know about one service.
#[derive(Debug, Clone)]
pub struct AddServiceSpec {
    pub config: ServiceConfig,
    /// Partition to register into; absent means `"default"`.
    pub partition: Option<PartitionId>,
    /// Readiness condition gating batch success, if any.
    pub ready: Option<ReadyCondition>,
}

impl AddServiceSpec {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            partition: None,
            ready: None,
        }
    }

    pub fn with_partition(mut self, partition: PartitionId) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_ready(mut self, ready: ReadyCondition) -> Self {
        self.ready = Some(ready);
        self
    }
}

/// Add a single service — sugar for a one-element [`add_services`].
pub async fn add_service(
    network: &ServiceNetwork,
    name: ServiceId,
    spec: AddServiceSpec,
) -> InstructionResult<Service> {
    let mut services = add_services(network, BTreeMap::from([(name.clone(), spec)]), 1).await?;
    services
        .remove(&name)
        .ok_or(InstructionError::Network(
            enclave_network::NetworkError::ServiceNotRegistered(name),
        ))
}

/// Register and start a batch of services, at most `parallelism` container
/// starts in flight.
///
/// On any failure — registration, launch, sidecar attach, or readiness —
/// every service this call registered is destroyed again, so the caller
/// observes the enclave exactly as it was before the call.
pub async fn add_services(
    network: &ServiceNetwork,
    specs: BTreeMap<ServiceId, AddServiceSpec>,
    parallelism: usize,
) -> InstructionResult<BTreeMap<ServiceId, Service>> {
    if parallelism < 1 {
        return Err(InstructionError::InvalidParallelism(parallelism));
    }
    if specs.is_empty() {
        return Err(InstructionError::EmptyBatch);
    }

    // Registration goes partition by partition.
    let mut by_partition: BTreeMap<Option<PartitionId>, BTreeSet<ServiceId>> = BTreeMap::new();
    for (id, spec) in &specs {
        by_partition
            .entry(spec.partition.clone())
            .or_default()
            .insert(id.clone());
    }

    let mut registered: BTreeSet<ServiceId> = BTreeSet::new();
    for (partition, ids) in by_partition {
        match network.register_services(ids.clone(), partition).await {
            Ok(_) => registered.extend(ids),
            Err(err) => {
                deregister_all(network, &registered).await;
                return Err(err.into());
            }
        }
    }

    let configs: BTreeMap<ServiceId, ServiceConfig> = specs
        .iter()
        .map(|(id, spec)| (id.clone(), spec.config.clone()))
        .collect();
    let ready_conditions: BTreeMap<ServiceId, ReadyCondition> = specs
        .iter()
        .filter_map(|(id, spec)| spec.ready.clone().map(|ready| (id.clone(), ready)))
        .collect();

    match network
        .start_services(configs, ready_conditions, parallelism)
        .await
    {
        Ok((started, failures)) if failures.is_empty() => {
            info!(services = started.len(), "add_services succeeded");
            Ok(started)
        }
        Ok((_, failures)) => {
            deregister_all(network, &registered).await;
            Err(InstructionError::AddServicesFailed { failures })
        }
        Err(err) => {
            deregister_all(network, &registered).await;
            Err(err.into())
        }
    }
}

/// Remove a service, stopping its container but keeping logs retrievable.
pub async fn remove_service(
    network: &ServiceNetwork,
    service_id: &ServiceId,
    container_stop_timeout: Option<Duration>,
) -> InstructionResult<ServiceGuid> {
    let timeout = container_stop_timeout.unwrap_or(DEFAULT_CONTAINER_STOP_TIMEOUT);
    Ok(network.remove_service(service_id, timeout).await?)
}

/// Run a command inside a service's container.
pub async fn exec(
    network: &ServiceNetwork,
    service_id: &ServiceId,
    command: Vec<String>,
) -> InstructionResult<ExecResult> {
    Ok(network.exec_command(service_id, command).await?)
}

/// Destroy every service in `ids`, logging (not surfacing) individual
/// failures; this is best-effort rollback of registrations we created.
async fn deregister_all(network: &ServiceNetwork, ids: &BTreeSet<ServiceId>) {
    for id in ids {
        if let Err(err) = network.destroy_service(id).await {
            warn!(%id, error = %err, "rollback could not destroy registration; it may need manual cleanup");
        }
    }
}
