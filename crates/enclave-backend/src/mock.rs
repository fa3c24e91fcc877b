//! In-memory container backend for tests.
//!
//! Plays the role a real daemon plays in production: owns the authoritative
//! container view, mints GUIDs, runs "containers" as table entries. Failure
//! injection hooks let tests force image-pull failures, expander failures,
//! and sidecar exec failures. Every mutating call is appended to an
//! operation log so tests can assert ordering (e.g. that pre-blocking
//! happened before a container start).

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::Write;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::artifacts::ArtifactUuid;
use crate::backend::{
    BackendError, BackendResult, ContainerBackend, ExpanderRunResult, LogStream,
};
use crate::objects::{
    EnclaveId, ExecResult, Service, ServiceConfig, ServiceFilters, ServiceGuid, ServiceId,
    ServiceRegistration, ServiceStatus, SidecarHandle, VolumeName,
};

#[derive(Default)]
struct MockState {
    services: BTreeMap<ServiceGuid, Service>,
    logs: BTreeMap<ServiceGuid, Vec<u8>>,
    /// Files copyable out of a container: guid → src path → tar bytes.
    files: BTreeMap<ServiceGuid, BTreeMap<String, Vec<u8>>>,
    sidecars: BTreeMap<String, SidecarHandle>,
    sidecar_exec_history: BTreeMap<ServiceGuid, Vec<Vec<String>>>,
    volumes: BTreeSet<VolumeName>,
    volume_seq: u64,
    /// One-shot exec results, popped front-first.
    exec_queues: BTreeMap<ServiceGuid, VecDeque<ExecResult>>,
    /// Fallback exec result when the queue is empty.
    exec_defaults: BTreeMap<ServiceGuid, ExecResult>,
    op_log: Vec<String>,

    // Failure injection.
    fail_start_images: BTreeSet<String>,
    fail_expansions: BTreeMap<ArtifactUuid, String>,
    fail_sidecar_exec: bool,
}

/// In-memory [`ContainerBackend`] implementation.
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock backend lock")
    }

    // ── Failure injection ──────────────────────────────────────────

    /// Make every start of `image` fail with an image-pull error.
    pub fn fail_to_start_image(&self, image: impl Into<String>) {
        self.lock().fail_start_images.insert(image.into());
    }

    /// Make the expander container exit non-zero for `artifact`, with the
    /// given stderr.
    pub fn fail_expansion(&self, artifact: ArtifactUuid, stderr: impl Into<String>) {
        self.lock().fail_expansions.insert(artifact, stderr.into());
    }

    /// Make every sidecar exec fail.
    pub fn fail_sidecar_exec(&self, fail: bool) {
        self.lock().fail_sidecar_exec = fail;
    }

    // ── Seeding ────────────────────────────────────────────────────

    /// Seed the log bytes of a service container.
    pub fn seed_logs(&self, guid: &ServiceGuid, bytes: impl Into<Vec<u8>>) {
        self.lock().logs.insert(guid.clone(), bytes.into());
    }

    /// Seed tar bytes copyable from `src_path` of a service container.
    pub fn seed_file(&self, guid: &ServiceGuid, src_path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.lock()
            .files
            .entry(guid.clone())
            .or_default()
            .insert(src_path.into(), bytes.into());
    }

    /// Queue a one-shot exec result for a service.
    pub fn queue_exec_result(&self, guid: &ServiceGuid, result: ExecResult) {
        self.lock()
            .exec_queues
            .entry(guid.clone())
            .or_default()
            .push_back(result);
    }

    /// Set the exec result returned whenever the one-shot queue is empty.
    pub fn set_default_exec_result(&self, guid: &ServiceGuid, result: ExecResult) {
        self.lock().exec_defaults.insert(guid.clone(), result);
    }

    // ── Inspection ─────────────────────────────────────────────────

    /// Snapshot of all known services.
    pub fn services(&self) -> BTreeMap<ServiceGuid, Service> {
        self.lock().services.clone()
    }

    /// The service registered under `id`, if any.
    pub fn service_by_id(&self, id: &ServiceId) -> Option<Service> {
        self.lock()
            .services
            .values()
            .find(|s| &s.registration.id == id)
            .cloned()
    }

    /// Whether a sidecar currently exists for `service_guid`.
    pub fn has_sidecar_for(&self, service_guid: &ServiceGuid) -> bool {
        self.lock()
            .sidecars
            .values()
            .any(|h| &h.service_guid == service_guid)
    }

    pub fn sidecar_count(&self) -> usize {
        self.lock().sidecars.len()
    }

    /// Every exec command batch ever run inside `service_guid`'s sidecar.
    pub fn sidecar_exec_history(&self, service_guid: &ServiceGuid) -> Vec<Vec<String>> {
        self.lock()
            .sidecar_exec_history
            .get(service_guid)
            .cloned()
            .unwrap_or_default()
    }

    /// Names of volumes that currently exist.
    pub fn volume_names(&self) -> BTreeSet<VolumeName> {
        self.lock().volumes.clone()
    }

    /// Ordered log of every mutating backend call.
    pub fn operations(&self) -> Vec<String> {
        self.lock().op_log.clone()
    }

    fn register_locked(
        state: &mut MockState,
        enclave_id: &EnclaveId,
        service_id: &ServiceId,
        private_ip: Ipv4Addr,
    ) -> ServiceRegistration {
        let registration = ServiceRegistration {
            id: service_id.clone(),
            guid: ServiceGuid::generate(service_id),
            enclave_id: enclave_id.clone(),
            private_ip,
        };
        state.services.insert(
            registration.guid.clone(),
            Service {
                registration: registration.clone(),
                status: ServiceStatus::Registered,
                private_ports: BTreeMap::new(),
                maybe_public_ip: None,
                maybe_public_ports: None,
            },
        );
        state.op_log.push(format!("register:{service_id}"));
        registration
    }
}

#[async_trait]
impl ContainerBackend for MockBackend {
    async fn register_user_service(
        &self,
        enclave_id: &EnclaveId,
        service_id: &ServiceId,
        private_ip: Ipv4Addr,
    ) -> BackendResult<ServiceRegistration> {
        let mut state = self.lock();
        Ok(Self::register_locked(&mut state, enclave_id, service_id, private_ip))
    }

    async fn register_user_services(
        &self,
        enclave_id: &EnclaveId,
        ids_to_ips: &BTreeMap<ServiceId, Ipv4Addr>,
    ) -> BackendResult<(
        BTreeMap<ServiceId, ServiceRegistration>,
        BTreeMap<ServiceId, BackendError>,
    )> {
        let mut state = self.lock();
        let mut successes = BTreeMap::new();
        for (id, ip) in ids_to_ips {
            let registration = Self::register_locked(&mut state, enclave_id, id, *ip);
            successes.insert(id.clone(), registration);
        }
        Ok((successes, BTreeMap::new()))
    }

    async fn start_user_service(
        &self,
        _enclave_id: &EnclaveId,
        guid: &ServiceGuid,
        config: &ServiceConfig,
        _volume_mounts: &BTreeMap<VolumeName, String>,
    ) -> BackendResult<Service> {
        let mut state = self.lock();
        if state.fail_start_images.contains(&config.image) {
            return Err(BackendError::ImagePull {
                image: config.image.clone(),
                message: "manifest unknown".to_string(),
            });
        }
        let service = state
            .services
            .get_mut(guid)
            .ok_or_else(|| BackendError::ServiceNotFound(guid.clone()))?;
        service.status = ServiceStatus::Running;
        service.private_ports = config.private_ports.clone();
        if !config.public_ports.is_empty() {
            service.maybe_public_ports = Some(config.public_ports.clone());
        }
        let started = service.clone();
        state.logs.entry(guid.clone()).or_insert_with(|| b"started\n".to_vec());
        state.op_log.push(format!("start:{guid}"));
        debug!(%guid, image = %config.image, "mock container started");
        Ok(started)
    }

    async fn get_user_services(
        &self,
        _enclave_id: &EnclaveId,
        filters: &ServiceFilters,
    ) -> BackendResult<BTreeMap<ServiceGuid, Service>> {
        let state = self.lock();
        Ok(state
            .services
            .values()
            .filter(|s| filters.matches(s))
            .map(|s| (s.registration.guid.clone(), s.clone()))
            .collect())
    }

    async fn get_user_service_logs(
        &self,
        _enclave_id: &EnclaveId,
        filters: &ServiceFilters,
        _follow: bool,
    ) -> BackendResult<BTreeMap<ServiceGuid, LogStream>> {
        let state = self.lock();
        let mut streams: BTreeMap<ServiceGuid, LogStream> = BTreeMap::new();
        for service in state.services.values().filter(|s| filters.matches(s)) {
            let guid = service.registration.guid.clone();
            let bytes = state.logs.get(&guid).cloned().unwrap_or_default();
            streams.insert(guid, Box::new(std::io::Cursor::new(bytes)));
        }
        Ok(streams)
    }

    async fn stop_user_services(
        &self,
        _enclave_id: &EnclaveId,
        filters: &ServiceFilters,
        _stop_timeout: Duration,
    ) -> BackendResult<(BTreeSet<ServiceGuid>, BTreeMap<ServiceGuid, BackendError>)> {
        let mut state = self.lock();
        let matching: Vec<ServiceGuid> = state
            .services
            .values()
            .filter(|s| filters.matches(s))
            .map(|s| s.registration.guid.clone())
            .collect();
        let mut stopped = BTreeSet::new();
        for guid in matching {
            if let Some(service) = state.services.get_mut(&guid) {
                if service.status == ServiceStatus::Running {
                    service.status = ServiceStatus::Stopped;
                }
                state.op_log.push(format!("stop:{guid}"));
                stopped.insert(guid);
            }
        }
        Ok((stopped, BTreeMap::new()))
    }

    async fn destroy_user_services(
        &self,
        _enclave_id: &EnclaveId,
        filters: &ServiceFilters,
    ) -> BackendResult<(BTreeSet<ServiceGuid>, BTreeMap<ServiceGuid, BackendError>)> {
        let mut state = self.lock();
        let matching: Vec<ServiceGuid> = state
            .services
            .values()
            .filter(|s| filters.matches(s))
            .map(|s| s.registration.guid.clone())
            .collect();
        let mut destroyed = BTreeSet::new();
        for guid in matching {
            state.services.remove(&guid);
            state.logs.remove(&guid);
            state.op_log.push(format!("destroy:{guid}"));
            destroyed.insert(guid);
        }
        Ok((destroyed, BTreeMap::new()))
    }

    async fn run_user_service_exec_commands(
        &self,
        _enclave_id: &EnclaveId,
        commands: &BTreeMap<ServiceGuid, Vec<String>>,
    ) -> BackendResult<(
        BTreeMap<ServiceGuid, ExecResult>,
        BTreeMap<ServiceGuid, BackendError>,
    )> {
        let mut state = self.lock();
        let mut results = BTreeMap::new();
        let mut failures = BTreeMap::new();
        for guid in commands.keys() {
            state.op_log.push(format!("exec:{guid}"));
            if !state.services.contains_key(guid) {
                failures.insert(guid.clone(), BackendError::ServiceNotFound(guid.clone()));
                continue;
            }
            let queued = state.exec_queues.get_mut(guid).and_then(VecDeque::pop_front);
            let result = match queued {
                Some(result) => result,
                None => state.exec_defaults.get(guid).cloned().unwrap_or(ExecResult {
                    exit_code: 0,
                    output: String::new(),
                }),
            };
            results.insert(guid.clone(), result);
        }
        Ok((results, failures))
    }

    async fn pause_service(
        &self,
        _enclave_id: &EnclaveId,
        guid: &ServiceGuid,
    ) -> BackendResult<()> {
        let mut state = self.lock();
        if !state.services.contains_key(guid) {
            return Err(BackendError::ServiceNotFound(guid.clone()));
        }
        state.op_log.push(format!("pause:{guid}"));
        Ok(())
    }

    async fn unpause_service(
        &self,
        _enclave_id: &EnclaveId,
        guid: &ServiceGuid,
    ) -> BackendResult<()> {
        let mut state = self.lock();
        if !state.services.contains_key(guid) {
            return Err(BackendError::ServiceNotFound(guid.clone()));
        }
        state.op_log.push(format!("unpause:{guid}"));
        Ok(())
    }

    async fn copy_files_from_user_service(
        &self,
        _enclave_id: &EnclaveId,
        guid: &ServiceGuid,
        src_path: &str,
        sink: &mut (dyn Write + Send),
    ) -> BackendResult<()> {
        let bytes = {
            let state = self.lock();
            if !state.services.contains_key(guid) {
                return Err(BackendError::ServiceNotFound(guid.clone()));
            }
            state
                .files
                .get(guid)
                .and_then(|paths| paths.get(src_path))
                .cloned()
                .ok_or_else(|| BackendError::Exec(format!("no such path '{src_path}'")))?
        };
        sink.write_all(&bytes)
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn create_expansion_volume(
        &self,
        _enclave_id: &EnclaveId,
        service_guid: &ServiceGuid,
    ) -> BackendResult<VolumeName> {
        let mut state = self.lock();
        state.volume_seq += 1;
        let volume = VolumeName::new(format!("{}-expansion-{}", service_guid, state.volume_seq));
        state.volumes.insert(volume.clone());
        state.op_log.push(format!("create-volume:{volume}"));
        Ok(volume)
    }

    async fn run_expander_container(
        &self,
        _enclave_id: &EnclaveId,
        _service_guid: &ServiceGuid,
        artifact: &ArtifactUuid,
        volume: &VolumeName,
    ) -> BackendResult<ExpanderRunResult> {
        let mut state = self.lock();
        state.op_log.push(format!("expander:{artifact}:{volume}"));
        if let Some(stderr) = state.fail_expansions.get(artifact) {
            return Ok(ExpanderRunResult {
                exit_code: 1,
                stderr: stderr.clone(),
            });
        }
        Ok(ExpanderRunResult {
            exit_code: 0,
            stderr: String::new(),
        })
    }

    async fn destroy_volume(
        &self,
        _enclave_id: &EnclaveId,
        volume: &VolumeName,
    ) -> BackendResult<()> {
        let mut state = self.lock();
        state.volumes.remove(volume);
        state.op_log.push(format!("destroy-volume:{volume}"));
        Ok(())
    }

    async fn create_networking_sidecar(
        &self,
        _enclave_id: &EnclaveId,
        service_guid: &ServiceGuid,
    ) -> BackendResult<SidecarHandle> {
        let mut state = self.lock();
        if !state.services.contains_key(service_guid) {
            return Err(BackendError::ServiceNotFound(service_guid.clone()));
        }
        let handle = SidecarHandle {
            sidecar_guid: format!("sidecar-{service_guid}"),
            service_guid: service_guid.clone(),
        };
        state.sidecars.insert(handle.sidecar_guid.clone(), handle.clone());
        state.op_log.push(format!("create-sidecar:{service_guid}"));
        Ok(handle)
    }

    async fn run_sidecar_exec_commands(
        &self,
        _enclave_id: &EnclaveId,
        sidecar: &SidecarHandle,
        commands: &[Vec<String>],
    ) -> BackendResult<()> {
        let mut state = self.lock();
        if state.fail_sidecar_exec {
            return Err(BackendError::Sidecar {
                service_guid: sidecar.service_guid.clone(),
                message: "exec inside sidecar failed".to_string(),
            });
        }
        if !state.sidecars.contains_key(&sidecar.sidecar_guid) {
            return Err(BackendError::Sidecar {
                service_guid: sidecar.service_guid.clone(),
                message: "sidecar does not exist".to_string(),
            });
        }
        state
            .sidecar_exec_history
            .entry(sidecar.service_guid.clone())
            .or_default()
            .extend(commands.iter().cloned());
        state
            .op_log
            .push(format!("sidecar-exec:{}", sidecar.service_guid));
        Ok(())
    }

    async fn destroy_networking_sidecar(
        &self,
        _enclave_id: &EnclaveId,
        sidecar: &SidecarHandle,
    ) -> BackendResult<()> {
        let mut state = self.lock();
        state.sidecars.remove(&sidecar.sidecar_guid);
        state
            .op_log
            .push(format!("destroy-sidecar:{}", sidecar.service_guid));
        Ok(())
    }
}
