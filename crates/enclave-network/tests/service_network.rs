//! End-to-end scenarios for the service network over the mock backend.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::AsyncReadExt;

use enclave_backend::{
    InMemoryFilesArtifactStore, MockBackend, ServiceConfig, ServiceFilters, ServiceId,
    ServiceStatus,
};
use enclave_network::{NetworkError, ServiceNetwork};
use enclave_readiness::{Assertion, ExecRecipe, ReadyCondition, Recipe, ReadinessError};
use enclave_topology::{PartitionConnection, PartitionConnectionId, PartitionId};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

fn partitioned_network(backend: Arc<MockBackend>) -> ServiceNetwork {
    ServiceNetwork::new(
        "test-enclave".into(),
        "10.8.0.0/16",
        true,
        backend,
        Arc::new(InMemoryFilesArtifactStore::new()),
    )
    .unwrap()
}

fn plain_network(backend: Arc<MockBackend>) -> ServiceNetwork {
    ServiceNetwork::new(
        "test-enclave".into(),
        "10.8.0.0/16",
        false,
        backend,
        Arc::new(InMemoryFilesArtifactStore::new()),
    )
    .unwrap()
}

async fn register_and_start(
    network: &ServiceNetwork,
    id: &str,
    partition: Option<PartitionId>,
) -> enclave_backend::ServiceRegistration {
    let registration = network
        .register_service(ServiceId::from(id), partition)
        .await
        .unwrap();
    let (started, failed) = network
        .start_services(
            BTreeMap::from([(ServiceId::from(id), ServiceConfig::new("nginx:1.25"))]),
            BTreeMap::new(),
            1,
        )
        .await
        .unwrap();
    assert!(failed.is_empty(), "start of '{id}' failed: {failed:?}");
    assert!(started.contains_key(&ServiceId::from(id)));
    registration
}

fn two_partitions(
    first: (&str, &[&str]),
    second: (&str, &[&str]),
) -> BTreeMap<PartitionId, BTreeSet<ServiceId>> {
    BTreeMap::from([
        (
            PartitionId::from(first.0),
            first.1.iter().map(|id| ServiceId::from(*id)).collect(),
        ),
        (
            PartitionId::from(second.0),
            second.1.iter().map(|id| ServiceId::from(*id)).collect(),
        ),
    ])
}

// S1 — pre-blocking closes the race window between container start and
// sidecar attach.
#[tokio::test]
async fn pre_blocking_shapes_running_peers_before_the_new_container_starts() {
    let backend = Arc::new(MockBackend::new());
    let network = partitioned_network(backend.clone());

    let reg_a = register_and_start(&network, "A", None).await;

    // p1={A}, p2={} with a fully blocked default connection.
    network
        .repartition(
            two_partitions(("p1", &["A"]), ("p2", &[])),
            BTreeMap::new(),
            PartitionConnection::BLOCKED,
        )
        .await
        .unwrap();

    let reg_b = network
        .register_service(ServiceId::from("B"), Some(PartitionId::from("p2")))
        .await
        .unwrap();
    let (started, failed) = network
        .start_services(
            BTreeMap::from([(ServiceId::from("B"), ServiceConfig::new("nginx:1.25"))]),
            BTreeMap::new(),
            1,
        )
        .await
        .unwrap();
    assert!(failed.is_empty());
    assert_eq!(started.len(), 1);

    // A's sidecar was updated after B's registration but before B's
    // container start: traffic toward B was already being dropped the
    // instant B became reachable.
    let ops = backend.operations();
    let register_b = ops.iter().position(|op| op == "register:B").unwrap();
    let start_b = ops
        .iter()
        .position(|op| *op == format!("start:{}", reg_b.guid))
        .unwrap();
    let pre_block = ops
        .iter()
        .enumerate()
        .skip(register_b + 1)
        .find(|(_, op)| **op == format!("sidecar-exec:{}", reg_a.guid))
        .map(|(i, _)| i)
        .unwrap();
    assert!(
        pre_block < start_b,
        "pre-block at {pre_block} must precede container start at {start_b}; ops: {ops:?}"
    );

    // Both directions are fully blocked afterwards.
    let shaping_a = network.sidecar_shaping(&ServiceId::from("A")).await.unwrap();
    assert_eq!(shaping_a.get(&reg_b.private_ip), Some(&100.0));
    let shaping_b = network.sidecar_shaping(&ServiceId::from("B")).await.unwrap();
    assert_eq!(shaping_b.get(&reg_a.private_ip), Some(&100.0));
}

// S2 — all-or-nothing batch: one bad image rolls the whole batch back.
#[tokio::test]
async fn failed_batch_start_rolls_back_every_started_service() {
    let backend = Arc::new(MockBackend::new());
    backend.fail_to_start_image("nonexistent:0");
    let network = partitioned_network(backend.clone());

    network
        .register_services(
            BTreeSet::from([ServiceId::from("X"), ServiceId::from("Y")]),
            None,
        )
        .await
        .unwrap();

    let (started, failed) = network
        .start_services(
            BTreeMap::from([
                (ServiceId::from("X"), ServiceConfig::new("nginx:1.25")),
                (ServiceId::from("Y"), ServiceConfig::new("nonexistent:0")),
            ]),
            BTreeMap::new(),
            2,
        )
        .await
        .unwrap();

    assert!(started.is_empty());
    assert_eq!(failed.len(), 1);
    assert!(matches!(
        failed.get(&ServiceId::from("Y")),
        Some(NetworkError::Backend(_))
    ));

    // No sidecars, no leftover volumes, no running container for X.
    assert_eq!(backend.sidecar_count(), 0);
    assert!(backend.volume_names().is_empty());
    assert!(backend.service_by_id(&ServiceId::from("X")).is_none());

    // The registration table is exactly as the call found it.
    assert_eq!(
        network.service_ids().await,
        BTreeSet::from([ServiceId::from("X"), ServiceId::from("Y")])
    );
}

// S3 is covered by enclave-topology's unit tests (commutative lookup); the
// network-level half is the repartition convergence test below.

// S4 — readiness timeout rolls the batch back.
#[tokio::test]
async fn readiness_timeout_destroys_the_started_service() {
    let backend = Arc::new(MockBackend::new());
    let network = plain_network(backend.clone());

    let registration = network
        .register_service(ServiceId::from("api"), None)
        .await
        .unwrap();
    backend.set_default_exec_result(
        &registration.guid,
        enclave_backend::ExecResult {
            exit_code: 0,
            output: "BOOTING".to_string(),
        },
    );

    let condition = ReadyCondition::new(
        Recipe::Exec(ExecRecipe {
            command: vec!["status".to_string()],
        }),
        "output",
        Assertion::Equal,
        json!("READY"),
    )
    .with_interval(Duration::from_millis(100))
    .with_timeout(Duration::from_millis(400));

    let err = network
        .start_services(
            BTreeMap::from([(ServiceId::from("api"), ServiceConfig::new("api:1"))]),
            BTreeMap::from([(ServiceId::from("api"), condition)]),
            1,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        NetworkError::Readiness(ReadinessError::Timeout { .. })
    ));

    // timeout / interval = 4 → four or five polls ran.
    let polls = backend
        .operations()
        .iter()
        .filter(|op| *op == &format!("exec:{}", registration.guid))
        .count();
    assert!((4..=5).contains(&polls), "expected 4-5 polls, saw {polls}");

    // The service container was destroyed by the rollback.
    assert!(backend.service_by_id(&ServiceId::from("api")).is_none());
    assert_eq!(backend.sidecar_count(), 0);
}

// S5 — remove stops the container but keeps its logs retrievable.
#[tokio::test]
async fn removed_service_keeps_logs_until_destroyed() {
    let backend = Arc::new(MockBackend::new());
    let network = plain_network(backend.clone());

    let registration = register_and_start(&network, "web", None).await;
    backend.seed_logs(&registration.guid, "GET /healthz 200\n");

    let guid = network
        .remove_service(&ServiceId::from("web"), STOP_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(guid, registration.guid);

    // Stopped, not destroyed.
    let service = backend.service_by_id(&ServiceId::from("web")).unwrap();
    assert_eq!(service.status, ServiceStatus::Stopped);

    // Logs still stream by id filter.
    let mut streams = network
        .service_logs(&ServiceFilters::by_id(ServiceId::from("web")), false)
        .await
        .unwrap();
    let mut stream = streams.remove(&registration.guid).expect("log stream");
    let mut contents = String::new();
    stream.read_to_string(&mut contents).await.unwrap();
    assert_eq!(contents, "GET /healthz 200\n");

    // The IP is still held until the destroy path runs.
    assert!(network.ip_allocator().is_held(registration.private_ip));
    network.destroy_service(&ServiceId::from("web")).await.unwrap();
    assert!(!network.ip_allocator().is_held(registration.private_ip));
    assert!(backend.service_by_id(&ServiceId::from("web")).is_none());
}

// S6 — repartition mid-traffic reshapes a running service's sidecar.
#[tokio::test]
async fn repartition_updates_live_sidecar_rules() {
    let backend = Arc::new(MockBackend::new());
    let network = partitioned_network(backend.clone());

    let reg_a = register_and_start(&network, "A", None).await;
    let reg_b = register_and_start(&network, "B", None).await;

    // Same partition: no impairment either way.
    assert!(network
        .sidecar_shaping(&ServiceId::from("A"))
        .await
        .unwrap()
        .is_empty());

    network
        .repartition(
            two_partitions(("p1", &["A"]), ("default", &["B"])),
            BTreeMap::from([(
                PartitionConnectionId::new(PartitionId::from("p1"), PartitionId::default_partition()),
                PartitionConnection::new(50.0).unwrap(),
            )]),
            PartitionConnection::UNBLOCKED,
        )
        .await
        .unwrap();

    let shaping_a = network.sidecar_shaping(&ServiceId::from("A")).await.unwrap();
    assert_eq!(shaping_a.get(&reg_b.private_ip), Some(&50.0));
    let shaping_b = network.sidecar_shaping(&ServiceId::from("B")).await.unwrap();
    assert_eq!(shaping_b.get(&reg_a.private_ip), Some(&50.0));
}

// Re-issuing a repartition after a sidecar failure converges.
#[tokio::test]
async fn repartition_converges_after_sidecar_failure() {
    let backend = Arc::new(MockBackend::new());
    let network = partitioned_network(backend.clone());

    let reg_a = register_and_start(&network, "A", None).await;
    let reg_b = register_and_start(&network, "B", None).await;

    let partitions = two_partitions(("p1", &["A"]), ("default", &["B"]));
    backend.fail_sidecar_exec(true);
    let err = network
        .repartition(partitions.clone(), BTreeMap::new(), PartitionConnection::BLOCKED)
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::Sidecar(_)));

    // The topology kept the new intent; a retry pushes it through.
    backend.fail_sidecar_exec(false);
    network
        .repartition(partitions, BTreeMap::new(), PartitionConnection::BLOCKED)
        .await
        .unwrap();
    let shaping_a = network.sidecar_shaping(&ServiceId::from("A")).await.unwrap();
    assert_eq!(shaping_a.get(&reg_b.private_ip), Some(&100.0));
    let shaping_b = network.sidecar_shaping(&ServiceId::from("B")).await.unwrap();
    assert_eq!(shaping_b.get(&reg_a.private_ip), Some(&100.0));
}

// Invariant: registered IPs are held, and no two registrations share one.
#[tokio::test]
async fn registrations_hold_distinct_ips() {
    let backend = Arc::new(MockBackend::new());
    let network = plain_network(backend);

    let mut ips = BTreeSet::new();
    for id in ["a", "b", "c", "d"] {
        let registration = network
            .register_service(ServiceId::from(id), None)
            .await
            .unwrap();
        assert!(network.ip_allocator().is_held(registration.private_ip));
        assert!(ips.insert(registration.private_ip), "duplicate ip handed out");
    }
    assert_eq!(network.ip_allocator().held_count(), 4);
}

// Copy-out streams through gzip into the artifact store.
#[tokio::test]
async fn copy_files_from_service_stores_gzipped_tar() {
    use std::io::Read;

    let backend = Arc::new(MockBackend::new());
    let store = Arc::new(InMemoryFilesArtifactStore::new());
    let network = ServiceNetwork::new(
        "test-enclave".into(),
        "10.8.0.0/16",
        false,
        backend.clone(),
        store.clone(),
    )
    .unwrap();

    let registration = register_and_start(&network, "web", None).await;
    backend.seed_file(&registration.guid, "/var/log", b"tar-stream-bytes".to_vec());

    let uuid = network
        .copy_files_from_service(&ServiceId::from("web"), "/var/log")
        .await
        .unwrap();

    // The stored blob gunzips back to the backend's tar stream.
    let blob = store.blob(&uuid).expect("stored blob");
    let mut decoder = flate2::read::GzDecoder::new(blob.as_slice());
    let mut decoded = Vec::new();
    decoder.read_to_end(&mut decoded).unwrap();
    assert_eq!(decoded, b"tar-stream-bytes");
}

#[tokio::test]
async fn copy_files_from_unknown_path_is_an_error() {
    let backend = Arc::new(MockBackend::new());
    let network = plain_network(backend.clone());
    register_and_start(&network, "web", None).await;

    let err = network
        .copy_files_from_service(&ServiceId::from("web"), "/does/not/exist")
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::Backend(_)));
}

// Exec, pause, unpause delegate to the backend with the right GUID.
#[tokio::test]
async fn exec_pause_unpause_delegate_by_guid() {
    let backend = Arc::new(MockBackend::new());
    let network = plain_network(backend.clone());
    let registration = register_and_start(&network, "web", None).await;

    backend.queue_exec_result(
        &registration.guid,
        enclave_backend::ExecResult {
            exit_code: 7,
            output: "done".to_string(),
        },
    );
    let result = network
        .exec_command(&ServiceId::from("web"), vec!["run".to_string()])
        .await
        .unwrap();
    assert_eq!(result.exit_code, 7);
    assert_eq!(result.output, "done");

    network.pause_service(&ServiceId::from("web")).await.unwrap();
    network.unpause_service(&ServiceId::from("web")).await.unwrap();
    let ops = backend.operations();
    assert!(ops.contains(&format!("pause:{}", registration.guid)));
    assert!(ops.contains(&format!("unpause:{}", registration.guid)));

    let err = network
        .exec_command(&ServiceId::from("ghost"), vec!["run".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::ServiceNotRegistered(_)));
}
