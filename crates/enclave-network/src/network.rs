//! The service network coordinator.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use enclave_backend::{
    ArtifactUuid, BackendError, ContainerBackend, EnclaveId, ExecResult, FilesArtifactStore,
    LogStream, Service, ServiceConfig, ServiceFilters, ServiceGuid, ServiceId,
    ServiceRegistration, ServiceStatus, VolumeName,
};
use enclave_readiness::{self as readiness, ReadyCondition};
use enclave_sidecar::{NetworkingSidecar, SidecarManager};
use enclave_topology::{
    PacketLossMatrix, PartitionConnection, PartitionConnectionId, PartitionId, PartitionTopology,
};

use crate::error::{NetworkError, NetworkResult};
use crate::expansion;
use crate::ip_allocator::IpAllocator;

/// Mutable state of one enclave's network, guarded by the coordinator
/// mutex. Helpers that require the lock take `&mut NetworkState`.
struct NetworkState {
    topology: PartitionTopology,
    /// Live registrations (registered or running), keyed by service id.
    registrations: BTreeMap<ServiceId, ServiceRegistration>,
    /// Backend view of services whose containers were started.
    started: BTreeMap<ServiceId, Service>,
    /// Registrations removed by `remove_service` but not yet destroyed.
    /// These still hold their IP, and their stopped containers keep logs.
    stopped: BTreeMap<ServiceId, ServiceRegistration>,
    sidecars: BTreeMap<ServiceId, NetworkingSidecar>,
}

/// Outcome of one service's expansion + container start inside a batch.
type StartOutcome = (
    ServiceId,
    NetworkResult<(Service, BTreeMap<VolumeName, String>)>,
);

/// The in-memory representation of one enclave's service network. All
/// mutations to the enclave go through this struct.
pub struct ServiceNetwork {
    enclave_id: EnclaveId,
    is_partitioning_enabled: bool,
    backend: Arc<dyn ContainerBackend>,
    artifact_store: Arc<dyn FilesArtifactStore>,
    ip_allocator: IpAllocator,
    sidecar_manager: SidecarManager,
    state: Mutex<NetworkState>,
}

impl ServiceNetwork {
    pub fn new(
        enclave_id: EnclaveId,
        cidr: &str,
        is_partitioning_enabled: bool,
        backend: Arc<dyn ContainerBackend>,
        artifact_store: Arc<dyn FilesArtifactStore>,
    ) -> NetworkResult<Self> {
        let ip_allocator = IpAllocator::new(cidr)?;
        let sidecar_manager = SidecarManager::new(backend.clone(), enclave_id.clone());
        Ok(Self {
            enclave_id,
            is_partitioning_enabled,
            backend,
            artifact_store,
            ip_allocator,
            sidecar_manager,
            state: Mutex::new(NetworkState {
                topology: PartitionTopology::new(PartitionConnection::UNBLOCKED),
                registrations: BTreeMap::new(),
                started: BTreeMap::new(),
                stopped: BTreeMap::new(),
                sidecars: BTreeMap::new(),
            }),
        })
    }

    pub fn enclave_id(&self) -> &EnclaveId {
        &self.enclave_id
    }

    pub fn is_partitioning_enabled(&self) -> bool {
        self.is_partitioning_enabled
    }

    /// The container backend this network drives.
    pub fn backend(&self) -> Arc<dyn ContainerBackend> {
        self.backend.clone()
    }

    /// The IP allocator backing this enclave (exposed for invariant checks).
    pub fn ip_allocator(&self) -> &IpAllocator {
        &self.ip_allocator
    }

    // ── Register ──────────────────────────────────────────────────

    /// Register a single service, reserving its IP and GUID without
    /// starting a container. An absent partition means `"default"`.
    pub async fn register_service(
        &self,
        service_id: ServiceId,
        partition: Option<PartitionId>,
    ) -> NetworkResult<ServiceRegistration> {
        let mut registered = self
            .register_services(BTreeSet::from([service_id.clone()]), partition)
            .await?;
        registered
            .remove(&service_id)
            .ok_or(NetworkError::ServiceNotRegistered(service_id))
    }

    /// Register a batch of services into one partition. Every failed step
    /// undoes the prior steps in reverse, so a failed call leaves the
    /// enclave untouched.
    pub async fn register_services(
        &self,
        service_ids: BTreeSet<ServiceId>,
        partition: Option<PartitionId>,
    ) -> NetworkResult<BTreeMap<ServiceId, ServiceRegistration>> {
        let mut state = self.state.lock().await;
        self.register_services_locked(&mut state, service_ids, partition)
            .await
    }

    async fn register_services_locked(
        &self,
        state: &mut NetworkState,
        service_ids: BTreeSet<ServiceId>,
        partition: Option<PartitionId>,
    ) -> NetworkResult<BTreeMap<ServiceId, ServiceRegistration>> {
        let partition_id = partition.unwrap_or_else(PartitionId::default_partition);
        for id in &service_ids {
            if id.as_str().trim().is_empty() {
                return Err(NetworkError::EmptyServiceId);
            }
            if state.registrations.contains_key(id) || state.stopped.contains_key(id) {
                return Err(NetworkError::ServiceAlreadyExists(id.clone()));
            }
        }
        if !state.topology.contains_partition(&partition_id) {
            return Err(NetworkError::Topology(
                enclave_topology::TopologyError::UnknownPartition(partition_id),
            ));
        }

        // Allocate an IP per service; release them all if anything later
        // fails.
        let mut ids_to_ips: BTreeMap<ServiceId, Ipv4Addr> = BTreeMap::new();
        for id in &service_ids {
            match self.ip_allocator.acquire() {
                Ok(ip) => {
                    ids_to_ips.insert(id.clone(), ip);
                }
                Err(err) => {
                    self.release_ips(&ids_to_ips);
                    return Err(err.into());
                }
            }
        }

        let (registered, mut failed) = match self
            .backend
            .register_user_services(&self.enclave_id, &ids_to_ips)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                self.release_ips(&ids_to_ips);
                return Err(err.into());
            }
        };
        if let Some((_, err)) = failed.pop_first() {
            self.destroy_backend_services_always(
                registered.values().map(|r| r.guid.clone()).collect(),
            )
            .await;
            self.release_ips(&ids_to_ips);
            return Err(err.into());
        }

        // Table + topology; undo everything in reverse on failure.
        let mut inserted: Vec<ServiceId> = Vec::new();
        for (id, registration) in &registered {
            state
                .registrations
                .insert(id.clone(), registration.clone());
            if let Err(err) = state
                .topology
                .add_service(id.clone(), partition_id.clone())
            {
                state.registrations.remove(id);
                for undo_id in inserted.iter().rev() {
                    state.topology.remove_service(undo_id);
                    state.registrations.remove(undo_id);
                }
                self.destroy_backend_services_always(
                    registered.values().map(|r| r.guid.clone()).collect(),
                )
                .await;
                self.release_ips(&ids_to_ips);
                return Err(err.into());
            }
            inserted.push(id.clone());
            debug!(
                service_id = %id,
                guid = %registration.guid,
                ip = %registration.private_ip,
                %partition_id,
                "service registered"
            );
        }
        Ok(registered)
    }

    fn release_ips(&self, ids_to_ips: &BTreeMap<ServiceId, Ipv4Addr>) {
        for ip in ids_to_ips.values() {
            self.ip_allocator.release(*ip);
        }
    }

    // ── Start batch ───────────────────────────────────────────────

    /// Start previously-registered services, at most `parallelism` container
    /// starts in flight at a time.
    ///
    /// All-or-nothing: if any service fails to launch, every service that
    /// did start in this batch is destroyed and the per-id failures are
    /// returned — the caller observes no partial network. A readiness
    /// failure (or a sidecar-attach failure) triggers the same rollback and
    /// is returned as the call's error.
    pub async fn start_services(
        &self,
        configs: BTreeMap<ServiceId, ServiceConfig>,
        ready_conditions: BTreeMap<ServiceId, ReadyCondition>,
        parallelism: usize,
    ) -> NetworkResult<(BTreeMap<ServiceId, Service>, BTreeMap<ServiceId, NetworkError>)> {
        let mut state = self.state.lock().await;

        let mut guids: BTreeMap<ServiceId, ServiceGuid> = BTreeMap::new();
        for id in configs.keys() {
            let registration = state
                .registrations
                .get(id)
                .ok_or_else(|| NetworkError::ServiceNotRegistered(id.clone()))?;
            if state.started.contains_key(id) {
                return Err(NetworkError::ServiceAlreadyStarted(id.clone()));
            }
            guids.insert(id.clone(), registration.guid.clone());
        }

        // Pre-blocking. A brand-new container comes up before its own
        // sidecar exists, so the already-running peers must shape traffic
        // toward the new IPs before any container starts.
        if self.is_partitioning_enabled {
            let matrix = state.topology.packet_loss_matrix();
            let existing_rows: PacketLossMatrix = matrix
                .iter()
                .filter(|(id, _)| !configs.contains_key(*id) && state.sidecars.contains_key(*id))
                .map(|(id, row)| (id.clone(), row.clone()))
                .collect();
            self.update_traffic_shaping_locked(&mut state, &existing_rows)
                .await?;
            debug!(peers = existing_rows.len(), "pre-blocked new services on running peers");
        }

        // Expansion + container start, `parallelism` in flight. The spawned
        // tasks touch only the backend, never coordinator state.
        let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
        let mut tasks: JoinSet<StartOutcome> = JoinSet::new();
        for (id, config) in &configs {
            let backend = self.backend.clone();
            let enclave_id = self.enclave_id.clone();
            let guid = guids[id].clone();
            let id = id.clone();
            let config = config.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("start semaphore closed");
                let volume_mounts = match expansion::expand_artifacts(
                    &backend,
                    &enclave_id,
                    &id,
                    &guid,
                    &config.files_artifact_mounts,
                )
                .await
                {
                    Ok(volume_mounts) => volume_mounts,
                    Err(err) => return (id, Err(err)),
                };
                match backend
                    .start_user_service(&enclave_id, &guid, &config, &volume_mounts)
                    .await
                {
                    Ok(service) => (id, Ok((service, volume_mounts))),
                    Err(err) => {
                        // The container never started; its volumes are dead
                        // weight.
                        expansion::destroy_volumes(
                            backend.clone(),
                            enclave_id.clone(),
                            volume_mounts.into_keys().collect(),
                        )
                        .await;
                        (id, Err(err.into()))
                    }
                }
            });
        }

        let mut started: BTreeMap<ServiceId, Service> = BTreeMap::new();
        let mut batch_volumes: BTreeMap<ServiceId, Vec<VolumeName>> = BTreeMap::new();
        let mut failures: BTreeMap<ServiceId, NetworkError> = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok((service, volume_mounts)))) => {
                    batch_volumes.insert(id.clone(), volume_mounts.into_keys().collect());
                    started.insert(id, service);
                }
                Ok((id, Err(err))) => {
                    failures.insert(id, err);
                }
                Err(join_err) => return Err(NetworkError::Task(join_err.to_string())),
            }
        }

        if !failures.is_empty() {
            warn!(
                started = started.len(),
                failed = failures.len(),
                "batch start failed; rolling back every started service"
            );
            self.rollback_batch_locked(&mut state, &started, &batch_volumes)
                .await;
            return Ok((BTreeMap::new(), failures));
        }

        for (id, service) in &started {
            state.started.insert(id.clone(), service.clone());
        }

        // Sidecar attach + the new nodes' own shaping view. Pre-blocking
        // already handled the reverse direction.
        if self.is_partitioning_enabled {
            let matrix = state.topology.packet_loss_matrix();
            for id in started.keys() {
                if let Err(err) = self
                    .attach_sidecar_locked(&mut state, id, &guids[id], &matrix)
                    .await
                {
                    warn!(%id, error = %err, "sidecar attach failed; rolling back the batch");
                    self.rollback_batch_locked(&mut state, &started, &batch_volumes)
                        .await;
                    return Err(err);
                }
            }
        }

        // Readiness gate.
        let mut checks: Vec<(ServiceRegistration, ReadyCondition)> = Vec::new();
        for (id, condition) in &ready_conditions {
            if let Some(service) = started.get(id) {
                checks.push((service.registration.clone(), condition.clone()));
            }
        }
        if !checks.is_empty() {
            if let Err(err) = readiness::wait_for_all(
                self.backend.clone(),
                &self.enclave_id,
                checks,
                parallelism.max(1),
            )
            .await
            {
                warn!(error = %err, "readiness failed; rolling back the batch");
                self.rollback_batch_locked(&mut state, &started, &batch_volumes)
                    .await;
                return Err(err.into());
            }
        }

        info!(services = started.len(), "service batch started");
        Ok((started, BTreeMap::new()))
    }

    /// Create, initialize, and shape the sidecar for one freshly started
    /// service.
    async fn attach_sidecar_locked(
        &self,
        state: &mut NetworkState,
        service_id: &ServiceId,
        service_guid: &ServiceGuid,
        matrix: &PacketLossMatrix,
    ) -> NetworkResult<()> {
        let mut sidecar = self.sidecar_manager.add(service_guid).await?;
        sidecar.initialize().await?;

        let empty = BTreeMap::new();
        let row = matrix.get(service_id).unwrap_or(&empty);
        let ip_row = resolve_ip_row(&state.registrations, service_id, row)?;
        sidecar.apply_shaping(&ip_row).await?;

        state.sidecars.insert(service_id.clone(), sidecar);
        Ok(())
    }

    /// Destroy everything a batch created: its sidecars, containers, and
    /// expansion volumes. Registrations are left exactly as the batch found
    /// them; the caller that registered the services decides their fate.
    async fn rollback_batch_locked(
        &self,
        state: &mut NetworkState,
        started: &BTreeMap<ServiceId, Service>,
        batch_volumes: &BTreeMap<ServiceId, Vec<VolumeName>>,
    ) {
        for id in started.keys() {
            if let Some(sidecar) = state.sidecars.remove(id) {
                if let Err(err) = self.sidecar_manager.remove(&sidecar).await {
                    warn!(%id, error = %err, "failed to destroy sidecar during rollback");
                }
            }
            state.started.remove(id);
        }
        let guids: Vec<ServiceGuid> = started
            .values()
            .map(|s| s.registration.guid.clone())
            .collect();
        self.destroy_backend_services_always(guids).await;
        let volumes: Vec<VolumeName> = batch_volumes.values().flatten().cloned().collect();
        expansion::destroy_volumes(self.backend.clone(), self.enclave_id.clone(), volumes).await;
    }

    // ── Remove / destroy ──────────────────────────────────────────

    /// Remove a service from the network, stopping (not destroying) its
    /// container so logs remain retrievable. The IP stays held until
    /// [`ServiceNetwork::destroy_service`].
    ///
    /// `container_stop_timeout` is forwarded to the backend, whose own
    /// grace period takes precedence when shorter.
    ///
    /// Peers' shaping rules are deliberately not updated: the next
    /// repartition or batch start overwrites them wholesale, and blocking
    /// traffic to a dead IP is harmless.
    pub async fn remove_service(
        &self,
        service_id: &ServiceId,
        container_stop_timeout: Duration,
    ) -> NetworkResult<ServiceGuid> {
        let mut state = self.state.lock().await;

        let registration = state
            .registrations
            .remove(service_id)
            .ok_or_else(|| NetworkError::ServiceNotRegistered(service_id.clone()))?;
        let guid = registration.guid.clone();
        state.topology.remove_service(service_id);
        state.started.remove(service_id);
        state.stopped.insert(service_id.clone(), registration);

        let filters = ServiceFilters::by_guid(guid.clone());
        let (_, mut errored) = self
            .backend
            .stop_user_services(&self.enclave_id, &filters, container_stop_timeout)
            .await?;
        if let Some(err) = errored.remove(&guid) {
            return Err(err.into());
        }

        if let Some(sidecar) = state.sidecars.remove(service_id) {
            self.sidecar_manager.remove(&sidecar).await?;
        }

        info!(%service_id, %guid, "service removed (container stopped, logs kept)");
        Ok(guid)
    }

    /// Eagerly destroy a service: container, backend registration, and IP.
    /// Valid from both the registered and the removed-but-stopped states.
    pub async fn destroy_service(&self, service_id: &ServiceId) -> NetworkResult<ServiceGuid> {
        let mut state = self.state.lock().await;

        let (registration, was_stopped) = match state.registrations.remove(service_id) {
            Some(registration) => (registration, false),
            None => match state.stopped.remove(service_id) {
                Some(registration) => (registration, true),
                None => return Err(NetworkError::ServiceNotRegistered(service_id.clone())),
            },
        };
        state.topology.remove_service(service_id);
        state.started.remove(service_id);

        if let Some(sidecar) = state.sidecars.remove(service_id) {
            if let Err(err) = self.sidecar_manager.remove(&sidecar).await {
                warn!(%service_id, error = %err, "failed to destroy sidecar during service destroy");
            }
        }

        let guid = registration.guid.clone();
        let filters = ServiceFilters::by_guid(guid.clone());
        let destroy_result = self
            .backend
            .destroy_user_services(&self.enclave_id, &filters)
            .await;
        let errored = match destroy_result {
            Ok((_, mut errored)) => errored.remove(&guid).map(NetworkError::from),
            Err(err) => Some(err.into()),
        };
        if let Some(err) = errored {
            // Leave the registration retrievable so the destroy can be
            // retried.
            if was_stopped {
                state.stopped.insert(service_id.clone(), registration);
            } else {
                state.registrations.insert(service_id.clone(), registration);
            }
            return Err(err);
        }

        self.ip_allocator.release(registration.private_ip);
        info!(%service_id, %guid, "service destroyed, ip released");
        Ok(guid)
    }

    // ── Pause / unpause / exec / copy ─────────────────────────────

    pub async fn pause_service(&self, service_id: &ServiceId) -> NetworkResult<()> {
        let state = self.state.lock().await;
        let guid = registered_guid(&state, service_id)?;
        self.backend.pause_service(&self.enclave_id, &guid).await?;
        Ok(())
    }

    pub async fn unpause_service(&self, service_id: &ServiceId) -> NetworkResult<()> {
        let state = self.state.lock().await;
        let guid = registered_guid(&state, service_id)?;
        self.backend.unpause_service(&self.enclave_id, &guid).await?;
        Ok(())
    }

    /// Run a command inside a service's container.
    ///
    /// The whole network is blocked until the command finishes.
    pub async fn exec_command(
        &self,
        service_id: &ServiceId,
        command: Vec<String>,
    ) -> NetworkResult<ExecResult> {
        let state = self.state.lock().await;
        let guid = registered_guid(&state, service_id)?;

        let commands = BTreeMap::from([(guid.clone(), command)]);
        let (mut results, mut failures) = self
            .backend
            .run_user_service_exec_commands(&self.enclave_id, &commands)
            .await?;
        if let Some(err) = failures.remove(&guid) {
            return Err(err.into());
        }
        results
            .remove(&guid)
            .ok_or_else(|| NetworkError::Backend(BackendError::ServiceNotFound(guid)))
    }

    /// Stream a tar of `src_path` out of the service's container, gzip it
    /// in-process, and append it to the files-artifact store.
    ///
    /// The payload is never buffered whole: the backend writes tar bytes
    /// through the gzip encoder into a pipe whose reader feeds the store on
    /// a blocking task, so a slow store back-pressures the container.
    pub async fn copy_files_from_service(
        &self,
        service_id: &ServiceId,
        src_path: &str,
    ) -> NetworkResult<ArtifactUuid> {
        let state = self.state.lock().await;
        let guid = registered_guid(&state, service_id)?;

        let copy_error = |message: String| NetworkError::CopyFiles {
            service_id: service_id.clone(),
            message,
        };

        let (mut reader, writer) = std::io::pipe().map_err(|e| copy_error(e.to_string()))?;
        let store = self.artifact_store.clone();
        let store_task = tokio::task::spawn_blocking(move || store.store_file(&mut reader));

        let mut encoder = GzEncoder::new(writer, Compression::default());
        let copy_result = self
            .backend
            .copy_files_from_user_service(&self.enclave_id, &guid, src_path, &mut encoder)
            .await;
        // Finish the gzip stream and drop the pipe writer immediately so the
        // store task sees EOF even when the copy failed mid-stream.
        let finish_result = encoder.finish().map(drop);

        let stored = store_task
            .await
            .map_err(|e| NetworkError::Task(e.to_string()))?;

        copy_result?;
        finish_result.map_err(|e| copy_error(e.to_string()))?;
        let uuid = stored.map_err(|e: std::io::Error| copy_error(e.to_string()))?;
        info!(%service_id, %src_path, artifact = %uuid, "files copied from service into artifact store");
        Ok(uuid)
    }

    // ── Repartition ───────────────────────────────────────────────

    /// Atomically swap the partition topology and push the re-derived
    /// packet-loss matrix through every sidecar.
    ///
    /// A sidecar-update failure is surfaced, but the topology keeps the new
    /// configuration — it is still the most accurate description of intent,
    /// and re-issuing the repartition converges.
    pub async fn repartition(
        &self,
        new_partitions: BTreeMap<PartitionId, BTreeSet<ServiceId>>,
        new_overrides: BTreeMap<PartitionConnectionId, PartitionConnection>,
        new_default: PartitionConnection,
    ) -> NetworkResult<()> {
        let mut state = self.state.lock().await;
        if !self.is_partitioning_enabled {
            return Err(NetworkError::PartitioningDisabled);
        }

        state
            .topology
            .repartition(new_partitions, new_overrides, new_default)?;

        let matrix = state.topology.packet_loss_matrix();
        let rows: PacketLossMatrix = matrix
            .iter()
            .filter(|(id, _)| state.sidecars.contains_key(*id))
            .map(|(id, row)| (id.clone(), row.clone()))
            .collect();
        self.update_traffic_shaping_locked(&mut state, &rows).await?;
        info!(services = rows.len(), "network repartitioned");
        Ok(())
    }

    // ── Queries ───────────────────────────────────────────────────

    /// The backend's current view of a registered service.
    pub async fn get_service(&self, service_id: &ServiceId) -> NetworkResult<Service> {
        let state = self.state.lock().await;
        let guid = registered_guid(&state, service_id)?;

        let mut matching = self
            .backend
            .get_user_services(&self.enclave_id, &ServiceFilters::by_guid(guid.clone()))
            .await?;
        matching
            .remove(&guid)
            .ok_or(NetworkError::Backend(BackendError::ServiceNotFound(guid)))
    }

    /// Ids of every live registration.
    pub async fn service_ids(&self) -> BTreeSet<ServiceId> {
        let state = self.state.lock().await;
        state.registrations.keys().cloned().collect()
    }

    /// Log streams for services matching `filters`, including services that
    /// were removed but not destroyed.
    pub async fn service_logs(
        &self,
        filters: &ServiceFilters,
        follow: bool,
    ) -> NetworkResult<BTreeMap<ServiceGuid, LogStream>> {
        let _state = self.state.lock().await;
        Ok(self
            .backend
            .get_user_service_logs(&self.enclave_id, filters, follow)
            .await?)
    }

    /// The live shaping rules of a service's sidecar (absent IPs mean 0%).
    pub async fn sidecar_shaping(
        &self,
        service_id: &ServiceId,
    ) -> Option<BTreeMap<Ipv4Addr, f32>> {
        let state = self.state.lock().await;
        state
            .sidecars
            .get(service_id)
            .map(|sidecar| sidecar.current_shaping().clone())
    }

    /// Rebuild the registration table from the backend's view, reserving
    /// the IPs it reports. Newly discovered services land in the default
    /// partition. Returns how many services were adopted.
    pub async fn reload_from_backend(&self) -> NetworkResult<usize> {
        let mut state = self.state.lock().await;
        let services = self
            .backend
            .get_user_services(&self.enclave_id, &ServiceFilters::all())
            .await?;

        let mut adopted = 0;
        for service in services.values() {
            let id = service.registration.id.clone();
            if state.registrations.contains_key(&id) || state.stopped.contains_key(&id) {
                continue;
            }
            self.ip_allocator.reserve(service.registration.private_ip);
            match service.status {
                ServiceStatus::Stopped => {
                    state.stopped.insert(id.clone(), service.registration.clone());
                }
                ServiceStatus::Registered | ServiceStatus::Running => {
                    state
                        .registrations
                        .insert(id.clone(), service.registration.clone());
                    state
                        .topology
                        .add_service(id.clone(), PartitionId::default_partition())?;
                    if service.status == ServiceStatus::Running {
                        state.started.insert(id.clone(), service.clone());
                    }
                }
            }
            adopted += 1;
        }
        info!(adopted, "registration table rebuilt from backend");
        Ok(adopted)
    }

    // ── Locked helpers ────────────────────────────────────────────

    /// Push target shaping rows through their services' sidecars. Every row
    /// must belong to a service that has a sidecar.
    async fn update_traffic_shaping_locked(
        &self,
        state: &mut NetworkState,
        targets: &PacketLossMatrix,
    ) -> NetworkResult<()> {
        let NetworkState {
            registrations,
            sidecars,
            ..
        } = state;
        for (service_id, row) in targets {
            let ip_row = resolve_ip_row(registrations, service_id, row)?;
            let sidecar = sidecars
                .get_mut(service_id)
                .ok_or_else(|| NetworkError::SidecarMissing(service_id.clone()))?;
            sidecar.apply_shaping(&ip_row).await?;
        }
        Ok(())
    }

    /// Best-effort backend destroy that runs to completion even if the
    /// awaiting caller is cancelled.
    async fn destroy_backend_services_always(&self, guids: Vec<ServiceGuid>) {
        if guids.is_empty() {
            return;
        }
        let backend = self.backend.clone();
        let enclave_id = self.enclave_id.clone();
        let task = tokio::spawn(async move {
            let filters = ServiceFilters {
                guids: Some(guids.into_iter().collect()),
                ..ServiceFilters::default()
            };
            match backend.destroy_user_services(&enclave_id, &filters).await {
                Ok((_, errored)) => {
                    for (guid, err) in errored {
                        warn!(%guid, error = %err, "best-effort destroy failed during rollback");
                    }
                }
                Err(err) => {
                    warn!(error = %err, "best-effort destroy call failed during rollback");
                }
            }
        });
        let _ = task.await;
    }
}

/// Translate a service-id keyed shaping row into the ip-keyed mapping the
/// sidecar installs.
fn resolve_ip_row(
    registrations: &BTreeMap<ServiceId, ServiceRegistration>,
    service_id: &ServiceId,
    row: &BTreeMap<ServiceId, f32>,
) -> NetworkResult<BTreeMap<Ipv4Addr, f32>> {
    let mut ip_row = BTreeMap::new();
    for (dest_id, loss) in row {
        let dest = registrations
            .get(dest_id)
            .ok_or_else(|| NetworkError::ServiceNotRegistered(dest_id.clone()))?;
        ip_row.insert(dest.private_ip, *loss);
    }
    debug!(%service_id, destinations = ip_row.len(), "resolved shaping row");
    Ok(ip_row)
}

fn registered_guid(state: &NetworkState, service_id: &ServiceId) -> NetworkResult<ServiceGuid> {
    state
        .registrations
        .get(service_id)
        .map(|r| r.guid.clone())
        .ok_or_else(|| NetworkError::ServiceNotRegistered(service_id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use enclave_backend::{InMemoryFilesArtifactStore, MockBackend};

    fn network_over(backend: Arc<MockBackend>, partitioning: bool) -> ServiceNetwork {
        ServiceNetwork::new(
            EnclaveId::from("test-enclave"),
            "10.8.0.0/16",
            partitioning,
            backend,
            Arc::new(InMemoryFilesArtifactStore::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn register_reserves_ip_and_inserts_topology() {
        let backend = Arc::new(MockBackend::new());
        let network = network_over(backend.clone(), false);

        let registration = network
            .register_service(ServiceId::from("web"), None)
            .await
            .unwrap();
        assert!(network.ip_allocator().is_held(registration.private_ip));
        assert_eq!(
            network.service_ids().await,
            BTreeSet::from([ServiceId::from("web")])
        );
        assert!(backend.service_by_id(&ServiceId::from("web")).is_some());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let backend = Arc::new(MockBackend::new());
        let network = network_over(backend, false);

        network
            .register_service(ServiceId::from("web"), None)
            .await
            .unwrap();
        let err = network
            .register_service(ServiceId::from("web"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::ServiceAlreadyExists(_)));
    }

    #[tokio::test]
    async fn empty_service_id_is_rejected() {
        let backend = Arc::new(MockBackend::new());
        let network = network_over(backend, false);
        let err = network
            .register_service(ServiceId::from("   "), None)
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::EmptyServiceId));
    }

    #[tokio::test]
    async fn register_into_unknown_partition_fails_cleanly() {
        let backend = Arc::new(MockBackend::new());
        let network = network_over(backend.clone(), true);

        let err = network
            .register_service(ServiceId::from("web"), Some(PartitionId::from("ghost")))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Topology(_)));
        // Nothing leaked: no registration, no held IP.
        assert_eq!(network.ip_allocator().held_count(), 0);
        assert!(network.service_ids().await.is_empty());
    }

    #[tokio::test]
    async fn register_then_destroy_returns_ip_to_pool() {
        let backend = Arc::new(MockBackend::new());
        let network = network_over(backend.clone(), false);

        let registration = network
            .register_service(ServiceId::from("web"), None)
            .await
            .unwrap();
        let ip = registration.private_ip;
        network.destroy_service(&ServiceId::from("web")).await.unwrap();

        assert!(!network.ip_allocator().is_held(ip));
        assert!(backend.service_by_id(&ServiceId::from("web")).is_none());
        // Same id can be registered again (fresh GUID).
        let second = network
            .register_service(ServiceId::from("web"), None)
            .await
            .unwrap();
        assert_ne!(second.guid, registration.guid);
    }

    #[tokio::test]
    async fn start_requires_prior_registration() {
        let backend = Arc::new(MockBackend::new());
        let network = network_over(backend, false);

        let err = network
            .start_services(
                BTreeMap::from([(ServiceId::from("web"), ServiceConfig::new("nginx:1.25"))]),
                BTreeMap::new(),
                1,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::ServiceNotRegistered(_)));
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let backend = Arc::new(MockBackend::new());
        let network = network_over(backend, false);
        network
            .register_service(ServiceId::from("web"), None)
            .await
            .unwrap();
        let configs = BTreeMap::from([(ServiceId::from("web"), ServiceConfig::new("nginx:1.25"))]);
        network
            .start_services(configs.clone(), BTreeMap::new(), 1)
            .await
            .unwrap();

        let err = network
            .start_services(configs, BTreeMap::new(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::ServiceAlreadyStarted(_)));
    }

    #[tokio::test]
    async fn parallelism_larger_than_batch_completes() {
        let backend = Arc::new(MockBackend::new());
        let network = network_over(backend, false);
        let ids = ["a", "b", "c"];
        for id in ids {
            network
                .register_service(ServiceId::from(id), None)
                .await
                .unwrap();
        }
        let configs: BTreeMap<ServiceId, ServiceConfig> = ids
            .iter()
            .map(|id| (ServiceId::from(*id), ServiceConfig::new("nginx:1.25")))
            .collect();

        let (started, failed) = network
            .start_services(configs, BTreeMap::new(), 64)
            .await
            .unwrap();
        assert_eq!(started.len(), 3);
        assert!(failed.is_empty());
    }

    #[tokio::test]
    async fn repartition_requires_partitioning_enabled() {
        let backend = Arc::new(MockBackend::new());
        let network = network_over(backend, false);
        let err = network
            .repartition(
                BTreeMap::from([(PartitionId::default_partition(), BTreeSet::new())]),
                BTreeMap::new(),
                PartitionConnection::UNBLOCKED,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::PartitioningDisabled));
    }

    #[tokio::test]
    async fn reload_adopts_backend_services() {
        let backend = Arc::new(MockBackend::new());
        let enclave = EnclaveId::from("test-enclave");
        // A service the backend knows about that this network instance
        // has never seen.
        let registration = backend
            .register_user_service(
                &enclave,
                &ServiceId::from("survivor"),
                Ipv4Addr::new(10, 8, 0, 17),
            )
            .await
            .unwrap();
        backend
            .start_user_service(
                &enclave,
                &registration.guid,
                &ServiceConfig::new("nginx:1.25"),
                &BTreeMap::new(),
            )
            .await
            .unwrap();

        let network = network_over(backend, false);
        let adopted = network.reload_from_backend().await.unwrap();
        assert_eq!(adopted, 1);
        assert!(network.ip_allocator().is_held(Ipv4Addr::new(10, 8, 0, 17)));
        assert_eq!(
            network.service_ids().await,
            BTreeSet::from([ServiceId::from("survivor")])
        );
    }
}
