//! Creates and destroys networking sidecars through the backend.

use std::sync::Arc;

use tracing::debug;

use enclave_backend::{ContainerBackend, EnclaveId, ServiceGuid};

use crate::shaper::{NetworkingSidecar, SidecarResult};

/// Factory for [`NetworkingSidecar`] handles within one enclave.
pub struct SidecarManager {
    backend: Arc<dyn ContainerBackend>,
    enclave_id: EnclaveId,
}

impl SidecarManager {
    pub fn new(backend: Arc<dyn ContainerBackend>, enclave_id: EnclaveId) -> Self {
        Self {
            backend,
            enclave_id,
        }
    }

    /// Create the sidecar container for a service and wrap it.
    pub async fn add(&self, service_guid: &ServiceGuid) -> SidecarResult<NetworkingSidecar> {
        let handle = self
            .backend
            .create_networking_sidecar(&self.enclave_id, service_guid)
            .await?;
        debug!(%service_guid, sidecar_guid = %handle.sidecar_guid, "networking sidecar created");
        Ok(NetworkingSidecar::new(
            self.backend.clone(),
            self.enclave_id.clone(),
            handle,
        ))
    }

    /// Destroy a sidecar's container.
    pub async fn remove(&self, sidecar: &NetworkingSidecar) -> SidecarResult<()> {
        self.backend
            .destroy_networking_sidecar(&self.enclave_id, sidecar.handle())
            .await?;
        debug!(service_guid = %sidecar.service_guid(), "networking sidecar destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;

    use enclave_backend::{MockBackend, ServiceConfig, ServiceId};

    #[tokio::test]
    async fn add_then_remove_round_trips() {
        let backend = Arc::new(MockBackend::new());
        let enclave = EnclaveId::from("test-enclave");
        let registration = backend
            .register_user_service(&enclave, &ServiceId::from("web"), Ipv4Addr::new(10, 0, 0, 2))
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

        let manager = SidecarManager::new(backend.clone(), enclave);
        let sidecar = manager.add(&registration.guid).await.unwrap();
        assert!(backend.has_sidecar_for(&registration.guid));

        manager.remove(&sidecar).await.unwrap();
        assert!(!backend.has_sidecar_for(&registration.guid));
    }
}
