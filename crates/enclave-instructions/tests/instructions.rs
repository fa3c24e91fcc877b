//! Instruction-surface integration tests over the mock backend.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use enclave_backend::{
    FilesArtifactStore, InMemoryFilesArtifactStore, MockBackend, ServiceConfig, ServiceId,
    ServiceStatus,
};
use enclave_instructions::{
    add_service, add_services, exec, remove_service, render_templates, repartition,
    store_service_files, upload_files, wait_for_endpoint_availability, AddServiceSpec,
    InstructionError, TemplateAndData,
};
use enclave_network::{NetworkError, ServiceNetwork};
use enclave_readiness::{Assertion, ExecRecipe, HttpMethod, ReadyCondition, Recipe};
use enclave_topology::{PartitionConnection, PartitionId};

fn network(
    backend: Arc<MockBackend>,
    store: Arc<InMemoryFilesArtifactStore>,
    partitioning: bool,
    cidr: &str,
) -> ServiceNetwork {
    ServiceNetwork::new("test-enclave".into(), cidr, partitioning, backend, store).unwrap()
}

fn default_network(backend: Arc<MockBackend>, partitioning: bool) -> ServiceNetwork {
    network(
        backend,
        Arc::new(InMemoryFilesArtifactStore::new()),
        partitioning,
        "10.8.0.0/16",
    )
}

#[tokio::test]
async fn add_service_registers_and_starts() {
    let backend = Arc::new(MockBackend::new());
    let net = default_network(backend.clone(), false);

    let service = add_service(
        &net,
        ServiceId::from("web"),
        AddServiceSpec::new(ServiceConfig::new("nginx:1.25")),
    )
    .await
    .unwrap();

    assert_eq!(service.status, ServiceStatus::Running);
    assert_eq!(
        backend.service_by_id(&ServiceId::from("web")).unwrap().status,
        ServiceStatus::Running
    );
}

// S2 at the instruction level: a failed batch leaves the enclave exactly as
// it was before the call.
#[tokio::test]
async fn failed_add_services_leaves_no_trace() {
    let backend = Arc::new(MockBackend::new());
    backend.fail_to_start_image("nonexistent:0");
    let net = default_network(backend.clone(), true);

    let specs = BTreeMap::from([
        (
            ServiceId::from("X"),
            AddServiceSpec::new(ServiceConfig::new("nginx:1.25")),
        ),
        (
            ServiceId::from("Y"),
            AddServiceSpec::new(ServiceConfig::new("nonexistent:0")),
        ),
    ]);
    let err = add_services(&net, specs, 2).await.unwrap_err();
    match err {
        InstructionError::AddServicesFailed { failures } => {
            assert_eq!(failures.len(), 1);
            assert!(failures.contains_key(&ServiceId::from("Y")));
        }
        other => panic!("unexpected error: {other}"),
    }

    // Neither X nor Y remains anywhere: no registrations, no held IPs, no
    // backend objects, no sidecars, no volumes.
    assert!(net.service_ids().await.is_empty());
    assert_eq!(net.ip_allocator().held_count(), 0);
    assert!(backend.service_by_id(&ServiceId::from("X")).is_none());
    assert!(backend.service_by_id(&ServiceId::from("Y")).is_none());
    assert_eq!(backend.sidecar_count(), 0);
    assert!(backend.volume_names().is_empty());
}

// S4 at the instruction level: readiness timeout destroys the service and
// removes its registration.
#[tokio::test]
async fn readiness_timeout_removes_service_and_registration() {
    let backend = Arc::new(MockBackend::new());
    let net = default_network(backend.clone(), false);

    let condition = ReadyCondition::new(
        Recipe::Exec(ExecRecipe {
            command: vec!["status".to_string()],
        }),
        "output",
        Assertion::Equal,
        json!("READY"),
    )
    .with_interval(Duration::from_millis(50))
    .with_timeout(Duration::from_millis(200));
    // The mock's default exec result is exit 0 with empty output, so the
    // assertion never passes.

    let err = add_service(
        &net,
        ServiceId::from("api"),
        AddServiceSpec::new(ServiceConfig::new("api:1")).with_ready(condition),
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        InstructionError::Network(NetworkError::Readiness(_))
    ));

    assert!(net.service_ids().await.is_empty());
    assert_eq!(net.ip_allocator().held_count(), 0);
    assert!(backend.service_by_id(&ServiceId::from("api")).is_none());
}

#[tokio::test]
async fn add_service_into_unknown_partition_leaves_no_trace() {
    let backend = Arc::new(MockBackend::new());
    let net = default_network(backend.clone(), true);

    let err = add_service(
        &net,
        ServiceId::from("web"),
        AddServiceSpec::new(ServiceConfig::new("nginx:1.25"))
            .with_partition(PartitionId::from("ghost")),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, InstructionError::Network(_)));
    assert!(net.service_ids().await.is_empty());
    assert_eq!(net.ip_allocator().held_count(), 0);
}

#[tokio::test]
async fn add_service_into_existing_partition_succeeds() {
    let backend = Arc::new(MockBackend::new());
    let net = default_network(backend.clone(), true);

    // Carve out an empty second partition first.
    repartition(
        &net,
        BTreeMap::from([
            (PartitionId::default_partition(), BTreeSet::new()),
            (PartitionId::from("p2"), BTreeSet::new()),
        ]),
        BTreeMap::new(),
        PartitionConnection::UNBLOCKED,
    )
    .await
    .unwrap();

    let service = add_service(
        &net,
        ServiceId::from("web"),
        AddServiceSpec::new(ServiceConfig::new("nginx:1.25"))
            .with_partition(PartitionId::from("p2")),
    )
    .await
    .unwrap();
    assert_eq!(service.status, ServiceStatus::Running);
}

#[tokio::test]
async fn invalid_parallelism_and_empty_batch_are_rejected() {
    let backend = Arc::new(MockBackend::new());
    let net = default_network(backend, false);

    let err = add_services(&net, BTreeMap::new(), 0).await.unwrap_err();
    assert!(matches!(err, InstructionError::InvalidParallelism(0)));

    let err = add_services(&net, BTreeMap::new(), 1).await.unwrap_err();
    assert!(matches!(err, InstructionError::EmptyBatch));
}

#[tokio::test]
async fn remove_service_uses_default_stop_timeout() {
    let backend = Arc::new(MockBackend::new());
    let net = default_network(backend.clone(), false);

    add_service(
        &net,
        ServiceId::from("web"),
        AddServiceSpec::new(ServiceConfig::new("nginx:1.25")),
    )
    .await
    .unwrap();

    remove_service(&net, &ServiceId::from("web"), None).await.unwrap();
    assert_eq!(
        backend.service_by_id(&ServiceId::from("web")).unwrap().status,
        ServiceStatus::Stopped
    );
}

#[tokio::test]
async fn exec_returns_the_container_result() {
    let backend = Arc::new(MockBackend::new());
    let net = default_network(backend.clone(), false);
    let service = add_service(
        &net,
        ServiceId::from("web"),
        AddServiceSpec::new(ServiceConfig::new("nginx:1.25")),
    )
    .await
    .unwrap();

    backend.queue_exec_result(
        &service.registration.guid,
        enclave_backend::ExecResult {
            exit_code: 0,
            output: "v1.25.3".to_string(),
        },
    );
    let result = exec(&net, &ServiceId::from("web"), vec!["nginx".into(), "-v".into()])
        .await
        .unwrap();
    assert_eq!(result.output, "v1.25.3");
}

#[tokio::test]
async fn repartition_requires_partitioning() {
    let backend = Arc::new(MockBackend::new());
    let net = default_network(backend, false);

    let err = repartition(
        &net,
        BTreeMap::from([(PartitionId::default_partition(), BTreeSet::new())]),
        BTreeMap::new(),
        PartitionConnection::UNBLOCKED,
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        InstructionError::Network(NetworkError::PartitioningDisabled)
    ));
}

/// Serve `responses` HTTP exchanges on the listener, one per connection.
async fn serve_http(listener: TcpListener, status_line: &'static str, body: &'static str) {
    loop {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let mut buf = [0u8; 1024];
        let _ = socket.read(&mut buf).await;
        let response = format!(
            "{status_line}\r\ncontent-length: {}\r\n\r\n{body}",
            body.len()
        );
        let _ = socket.write_all(response.as_bytes()).await;
    }
}

// The 127.0.0.0/24 CIDR makes the first allocated service IP 127.0.0.1, so
// a local listener stands in for the service container.
#[tokio::test]
async fn wait_for_endpoint_succeeds_with_zero_retries() {
    let backend = Arc::new(MockBackend::new());
    let net = network(
        backend,
        Arc::new(InMemoryFilesArtifactStore::new()),
        false,
        "127.0.0.0/24",
    );
    add_service(
        &net,
        ServiceId::from("api"),
        AddServiceSpec::new(ServiceConfig::new("api:1")),
    )
    .await
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(serve_http(listener, "HTTP/1.1 200 OK", "pong"));

    // retries = 0 still runs exactly one probe.
    wait_for_endpoint_availability(
        &net,
        &ServiceId::from("api"),
        port,
        "/ping",
        HttpMethod::Get,
        Duration::from_millis(0),
        0,
        Duration::from_millis(10),
        Some("pong".to_string()),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn wait_for_endpoint_gives_up_after_retries() {
    let backend = Arc::new(MockBackend::new());
    let net = network(
        backend,
        Arc::new(InMemoryFilesArtifactStore::new()),
        false,
        "127.0.0.0/24",
    );
    add_service(
        &net,
        ServiceId::from("api"),
        AddServiceSpec::new(ServiceConfig::new("api:1")),
    )
    .await
    .unwrap();

    // Grab a port with nothing listening on it.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = wait_for_endpoint_availability(
        &net,
        &ServiceId::from("api"),
        port,
        "/ping",
        HttpMethod::Get,
        Duration::from_millis(0),
        2,
        Duration::from_millis(10),
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        InstructionError::EndpointUnavailable { attempts: 3, .. }
    ));
}

#[tokio::test]
async fn wait_for_endpoint_rejects_wrong_body() {
    let backend = Arc::new(MockBackend::new());
    let net = network(
        backend,
        Arc::new(InMemoryFilesArtifactStore::new()),
        false,
        "127.0.0.0/24",
    );
    add_service(
        &net,
        ServiceId::from("api"),
        AddServiceSpec::new(ServiceConfig::new("api:1")),
    )
    .await
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(serve_http(listener, "HTTP/1.1 200 OK", "unexpected"));

    let err = wait_for_endpoint_availability(
        &net,
        &ServiceId::from("api"),
        port,
        "/ping",
        HttpMethod::Get,
        Duration::from_millis(0),
        1,
        Duration::from_millis(10),
        Some("pong".to_string()),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, InstructionError::EndpointUnavailable { .. }));
}

#[tokio::test]
async fn upload_files_round_trips_through_the_store() {
    let store = Arc::new(InMemoryFilesArtifactStore::new());
    let dyn_store: Arc<dyn FilesArtifactStore> = store.clone();

    let uuid = upload_files(&dyn_store, b"pretend-tgz-bytes".to_vec())
        .await
        .unwrap();
    assert_eq!(store.blob(&uuid).unwrap(), b"pretend-tgz-bytes");
}

#[tokio::test]
async fn render_templates_stores_a_gzipped_archive() {
    let store = Arc::new(InMemoryFilesArtifactStore::new());
    let dyn_store: Arc<dyn FilesArtifactStore> = store.clone();

    let templates = BTreeMap::from([(
        "config/app.conf".to_string(),
        TemplateAndData {
            template: "listen {{host}}:{{port}}".to_string(),
            data: json!({"host": "0.0.0.0", "port": 8080}),
        },
    )]);
    let uuid = render_templates(&dyn_store, templates).await.unwrap();

    let blob = store.blob(&uuid).unwrap();
    let mut decoder = flate2::read::GzDecoder::new(blob.as_slice());
    let mut archive = Vec::new();
    decoder.read_to_end(&mut archive).unwrap();

    // The tar header names the destination; the first content block holds
    // the rendered text.
    assert_eq!(&archive[..15], b"config/app.conf");
    let rendered = b"listen 0.0.0.0:8080";
    assert_eq!(&archive[512..512 + rendered.len()], rendered);
}

#[tokio::test]
async fn render_templates_surfaces_missing_placeholder() {
    let store = Arc::new(InMemoryFilesArtifactStore::new());
    let dyn_store: Arc<dyn FilesArtifactStore> = store.clone();

    let templates = BTreeMap::from([(
        "a.conf".to_string(),
        TemplateAndData {
            template: "{{absent}}".to_string(),
            data: json!({}),
        },
    )]);
    let err = render_templates(&dyn_store, templates).await.unwrap_err();
    assert!(matches!(err, InstructionError::Template { .. }));
    assert!(store.is_empty());
}

#[tokio::test]
async fn store_service_files_streams_into_the_store() {
    let backend = Arc::new(MockBackend::new());
    let store = Arc::new(InMemoryFilesArtifactStore::new());
    let net = network(backend.clone(), store.clone(), false, "10.8.0.0/16");

    let service = add_service(
        &net,
        ServiceId::from("web"),
        AddServiceSpec::new(ServiceConfig::new("nginx:1.25")),
    )
    .await
    .unwrap();
    backend.seed_file(
        &service.registration.guid,
        "/var/log/nginx",
        b"access-log-tar".to_vec(),
    );

    let uuid = store_service_files(&net, &ServiceId::from("web"), "/var/log/nginx")
        .await
        .unwrap();

    let blob = store.blob(&uuid).unwrap();
    let mut decoder = flate2::read::GzDecoder::new(blob.as_slice());
    let mut decoded = Vec::new();
    decoder.read_to_end(&mut decoded).unwrap();
    assert_eq!(decoded, b"access-log-tar");
}
