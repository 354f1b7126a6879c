//! Local scan uploads for LocalDeclared servers.

use turing::error::GatewayError;
use turing::model::{ScanStatus, ServerStatus, SourceType};
use turing::registry::LocalScanUpload;
use turing::store::ServerStore;

use crate::support::{member, register_req, world};

fn upload(scan_output: &str) -> LocalScanUpload {
    LocalScanUpload {
        scan_output: scan_output.to_owned(),
        scan_version: "0.9.1".to_owned(),
        scanned_at: None,
    }
}

#[tokio::test]
async fn upload_records_completed_scan_and_pass() {
    let world = world();
    let alice = member("alice", "team-a");
    let server = world
        .registry
        .register(&alice, register_req("team-a/local", "team-a", SourceType::LocalDeclared))
        .await
        .expect("registers");

    let scan = world
        .registry
        .upload_local_scan(
            &alice,
            server.id,
            upload(r#"{"risk_score": 0.2, "issues": [], "tools": [{"name": "get_weather"}]}"#),
        )
        .await
        .expect("uploads");
    assert_eq!(scan.status, ScanStatus::Completed);
    assert_eq!(scan.risk_score, Some(0.2));
    assert!(scan.finished_at.is_some());
    assert_eq!(scan.scanner_version, "0.9.1");
    assert_eq!(scan.discovered_tools.len(), 1);

    let server = world
        .stores
        .servers()
        .get(server.id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(server.status, ServerStatus::ScannedPass);
    assert_eq!(server.latest_scan_id, Some(scan.id));
    assert_eq!(server.latest_risk_score, Some(0.2));
}

#[tokio::test]
async fn upload_over_threshold_fails_the_server() {
    let world = world();
    let alice = member("alice", "team-a");
    let server = world
        .registry
        .register(&alice, register_req("team-a/local", "team-a", SourceType::LocalDeclared))
        .await
        .expect("registers");

    // 80 on the percentage scale normalizes to 0.8, over the 0.5 threshold.
    world
        .registry
        .upload_local_scan(&alice, server.id, upload(r#"{"risk_score": 80.0}"#))
        .await
        .expect("uploads");
    let server = world
        .stores
        .servers()
        .get(server.id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(server.status, ServerStatus::ScannedFail);
    assert_eq!(server.latest_risk_score, Some(0.8));
}

#[tokio::test]
async fn upload_rejects_non_local_servers() {
    let world = world();
    let alice = member("alice", "team-a");
    let server = world
        .registry
        .register(&alice, register_req("team-a/remote", "team-a", SourceType::ContainerImage))
        .await
        .expect("registers");
    let err = world
        .registry
        .upload_local_scan(&alice, server.id, upload(r#"{"risk_score": 0.1}"#))
        .await
        .expect_err("remote servers are scanned by the orchestrator");
    assert!(matches!(err, GatewayError::InvalidArgument(_)));
}

#[tokio::test]
async fn upload_rejects_unparseable_output() {
    let world = world();
    let alice = member("alice", "team-a");
    let server = world
        .registry
        .register(&alice, register_req("team-a/local", "team-a", SourceType::LocalDeclared))
        .await
        .expect("registers");
    let err = world
        .registry
        .upload_local_scan(&alice, server.id, upload("this is not json"))
        .await
        .expect_err("garbage rejected");
    assert!(matches!(err, GatewayError::InvalidArgument(_)));
}

#[tokio::test]
async fn upload_honours_scanned_at() {
    let world = world();
    let alice = member("alice", "team-a");
    let server = world
        .registry
        .register(&alice, register_req("team-a/local", "team-a", SourceType::LocalDeclared))
        .await
        .expect("registers");
    let when = chrono::Utc::now() - chrono::Duration::hours(3);
    let scan = world
        .registry
        .upload_local_scan(
            &alice,
            server.id,
            LocalScanUpload {
                scan_output: r#"{"risk_score": 0.0}"#.to_owned(),
                scan_version: "0.9.1".to_owned(),
                scanned_at: Some(when),
            },
        )
        .await
        .expect("uploads");
    assert_eq!(scan.started_at, when);
}
