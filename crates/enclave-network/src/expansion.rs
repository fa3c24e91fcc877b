//! Files-artifact expansion: volumes + expander containers.
//!
//! For every artifact mount a service config requests, a dedicated volume is
//! created and a short-lived expander container extracts the artifact blob
//! into it. The resulting volume names become mounts on the future service
//! container. Any failure destroys the volumes created so far; the cleanup
//! runs on a spawned task so a cancelled caller cannot leak them.

use std::collections::BTreeMap;

use std::sync::Arc;

use tracing::{debug, warn};

use enclave_backend::{ArtifactUuid, ContainerBackend, EnclaveId, ServiceGuid, ServiceId, VolumeName};

use crate::error::{NetworkError, NetworkResult};

/// Expand every artifact in `mounts`, returning volume name → mountpoint on
/// the service container.
pub(crate) async fn expand_artifacts(
    backend: &Arc<dyn ContainerBackend>,
    enclave_id: &EnclaveId,
    service_id: &ServiceId,
    service_guid: &ServiceGuid,
    mounts: &BTreeMap<ArtifactUuid, String>,
) -> NetworkResult<BTreeMap<VolumeName, String>> {
    if mounts.is_empty() {
        return Ok(BTreeMap::new());
    }
    let mut created: Vec<VolumeName> = Vec::new();
    match try_expand(backend, enclave_id, service_id, service_guid, mounts, &mut created).await {
        Ok(volume_mounts) => Ok(volume_mounts),
        Err(err) => {
            destroy_volumes(backend.clone(), enclave_id.clone(), created).await;
            Err(err)
        }
    }
}

async fn try_expand(
    backend: &Arc<dyn ContainerBackend>,
    enclave_id: &EnclaveId,
    service_id: &ServiceId,
    service_guid: &ServiceGuid,
    mounts: &BTreeMap<ArtifactUuid, String>,
    created: &mut Vec<VolumeName>,
) -> NetworkResult<BTreeMap<VolumeName, String>> {
    let mut volume_mounts = BTreeMap::new();
    for (artifact, mountpoint) in mounts {
        let volume = backend
            .create_expansion_volume(enclave_id, service_guid)
            .await?;
        created.push(volume.clone());

        let run = backend
            .run_expander_container(enclave_id, service_guid, artifact, &volume)
            .await?;
        if run.exit_code != 0 {
            return Err(NetworkError::Expansion {
                service_id: service_id.clone(),
                exit_code: run.exit_code,
                stderr: run.stderr,
            });
        }
        debug!(%service_guid, %artifact, %volume, "files artifact expanded");
        volume_mounts.insert(volume, mountpoint.clone());
    }
    Ok(volume_mounts)
}

/// Best-effort volume destruction that runs to completion even if the
/// awaiting caller is cancelled.
pub(crate) async fn destroy_volumes(
    backend: Arc<dyn ContainerBackend>,
    enclave_id: EnclaveId,
    volumes: Vec<VolumeName>,
) {
    if volumes.is_empty() {
        return;
    }
    let task = tokio::spawn(async move {
        for volume in volumes {
            if let Err(err) = backend.destroy_volume(&enclave_id, &volume).await {
                warn!(%volume, error = %err, "failed to destroy expansion volume during cleanup");
            }
        }
    });
    let _ = task.await;
}
