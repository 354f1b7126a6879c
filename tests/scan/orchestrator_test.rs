//! Workload launch and cancellation.

use turing::error::GatewayError;
use turing::model::{ScanStatus, ServerStatus, SourceType};
use turing::store::{ScanStore, ServerStore};

use crate::support::{member, register_req, world, World};

async fn running_scan(world: &World, canonical_id: &str) -> (uuid::Uuid, uuid::Uuid) {
    let alice = member("alice", "team-a");
    let server = world
        .registry
        .register(&alice, register_req(canonical_id, "team-a", SourceType::ContainerImage))
        .await
        .expect("registers");
    let scan = world
        .registry
        .submit_for_scan(&alice, server.id)
        .await
        .expect("submits");
    (server.id, scan.id)
}

#[tokio::test]
async fn launch_builds_hardened_workload_spec() {
    let world = world();
    let (_, scan_id) = running_scan(&world, "team-a/weather").await;

    let launches = world.runner.launches.lock().expect("lock");
    let spec = &launches[0];
    assert_eq!(spec.name, turing::scan::runner::job_name_for_scan(scan_id));
    assert!(spec.name.len() <= 63);
    assert_eq!(spec.image, "mcp-scanner:latest");
    assert!(spec.command[2].contains("git clone --depth 1"));
    assert!(spec
        .labels
        .get("mcp-gateway/namespace")
        .is_some_and(|ns| ns == "mcp-scans"));
    assert!(spec
        .labels
        .get("mcp-gateway/service-account")
        .is_some_and(|sa| sa == "mcp-scanner"));
    assert!(spec
        .env
        .iter()
        .any(|(k, v)| k == turing::scan::runner::DESCRIPTOR_ENV && !v.is_empty()));
}

#[tokio::test]
async fn cancel_leaves_server_status_alone() {
    let world = world();
    let (server_id, scan_id) = running_scan(&world, "team-a/weather").await;
    let alice = member("alice", "team-a");

    let cancelled = world
        .registry
        .cancel_scan(&alice, server_id, scan_id)
        .await
        .expect("cancels");
    assert_eq!(cancelled.status, ScanStatus::Cancelled);
    assert!(cancelled.finished_at.is_some());

    // Cancellation is an administrative no-op on the server lifecycle.
    let server = world
        .stores
        .servers()
        .get(server_id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(server.status, ServerStatus::Scanning);

    // The workload was torn down.
    let job = turing::scan::runner::job_name_for_scan(scan_id);
    assert!(world.runner.deleted_names().contains(&job));
}

#[tokio::test]
async fn cancel_rejects_terminal_scans() {
    let world = world();
    let (server_id, scan_id) = running_scan(&world, "team-a/weather").await;
    let alice = member("alice", "team-a");
    world
        .registry
        .cancel_scan(&alice, server_id, scan_id)
        .await
        .expect("first cancel");
    let err = world
        .registry
        .cancel_scan(&alice, server_id, scan_id)
        .await
        .expect_err("second cancel");
    assert!(matches!(err, GatewayError::InvalidState(_)));
}

#[tokio::test]
async fn scan_history_and_detail_are_scoped() {
    let world = world();
    let (server_id, scan_id) = running_scan(&world, "team-a/weather").await;
    let alice = member("alice", "team-a");

    let history = world
        .registry
        .scan_history(&alice, server_id)
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
    let detail = world
        .registry
        .scan_detail(&alice, server_id, scan_id)
        .await
        .expect("detail");
    assert_eq!(detail.id, scan_id);
    let latest = world
        .registry
        .latest_scan(&alice, server_id)
        .await
        .expect("latest");
    assert_eq!(latest.id, scan_id);

    // A scan id that belongs to another server is NotFound, not leaked.
    let (other_server, _) = running_scan(&world, "team-a/geo").await;
    let err = world
        .registry
        .scan_detail(&alice, other_server, scan_id)
        .await
        .expect_err("cross-server lookup");
    assert!(matches!(err, GatewayError::NotFound));

    let err = world
        .registry
        .scan_history(&member("mallory", "team-z"), server_id)
        .await
        .expect_err("outsider blocked");
    assert!(matches!(err, GatewayError::Forbidden(_)));
}

#[tokio::test]
async fn scanner_version_comes_from_image_tag() {
    let world = world();
    assert_eq!(world.orchestrator.scanner_version(), "latest");
}

#[tokio::test]
async fn pending_scan_row_has_consistent_finished_at() {
    let world = world();
    let (server_id, scan_id) = running_scan(&world, "team-a/weather").await;
    let scan = world
        .stores
        .scans()
        .get(scan_id)
        .await
        .expect("fetch")
        .expect("exists");
    // finished_at is set exactly for terminal states.
    assert!(!scan.status.is_terminal());
    assert!(scan.finished_at.is_none());
    assert_eq!(scan.server_id, server_id);
}
