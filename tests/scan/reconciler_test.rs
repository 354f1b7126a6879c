//! Reconciliation of running workloads into terminal scan results.

use turing::model::{ScanStatus, ServerStatus, SourceType};
use turing::scan::runner::{job_name_for_scan, WorkloadPhase};
use turing::store::{ScanStore, ServerStore};

use crate::support::{member, register_req, world, World};

async fn running_scan(world: &World, canonical_id: &str) -> (uuid::Uuid, uuid::Uuid, String) {
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
    let job = job_name_for_scan(scan.id);
    (server.id, scan.id, job)
}

async fn backdate_scan(world: &World, scan_id: uuid::Uuid, secs: i64) {
    let scans = world.stores.scans();
    let mut scan = scans.get(scan_id).await.expect("fetch").expect("exists");
    scan.started_at -= chrono::Duration::seconds(secs);
    scans.insert(&scan).await.expect("backdate");
}

#[tokio::test]
async fn successful_workload_under_threshold_passes_server() {
    let world = world();
    let (server_id, scan_id, job) = running_scan(&world, "team-a/weather").await;
    world.runner.set_phase(&job, WorkloadPhase::Succeeded);
    world.runner.set_logs(
        &job,
        r#"{"risk_score": 0.2, "summary": "looks quiet",
            "issues": [{"code": "NET-2", "severity": "warning", "message": "broad egress"}],
            "tools": [{"name": "get_weather"}]}"#,
    );

    let settled = world.reconciler().sweep().await;
    assert_eq!(settled, 1);

    let scan = world
        .stores
        .scans()
        .get(scan_id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(scan.status, ScanStatus::Completed);
    assert_eq!(scan.risk_score, Some(0.2));
    assert_eq!(scan.summary.as_deref(), Some("looks quiet"));
    assert_eq!(scan.issues.len(), 1);
    assert_eq!(scan.discovered_tools.len(), 1);
    assert!(scan.report_json.is_some());
    assert!(scan.finished_at.is_some());

    let server = world
        .stores
        .servers()
        .get(server_id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(server.status, ServerStatus::ScannedPass);
    assert_eq!(server.latest_scan_id, Some(scan_id));
    assert_eq!(server.latest_risk_score, Some(0.2));

    // Terminal workloads are reclaimed.
    assert!(world.runner.deleted_names().contains(&job));
}

#[tokio::test]
async fn risk_over_threshold_fails_server() {
    let world = world();
    let (server_id, _, job) = running_scan(&world, "team-a/weather").await;
    world.runner.set_phase(&job, WorkloadPhase::Succeeded);
    world.runner.set_logs(&job, r#"{"risk_score": 0.9}"#);

    world.reconciler().sweep().await;
    let server = world
        .stores
        .servers()
        .get(server_id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(server.status, ServerStatus::ScannedFail);
    assert_eq!(server.latest_risk_score, Some(0.9));
}

#[tokio::test]
async fn failed_workload_with_parseable_output_still_fails_server() {
    let world = world();
    let (server_id, scan_id, job) = running_scan(&world, "team-a/weather").await;
    world.runner.set_phase(&job, WorkloadPhase::Failed);
    world.runner.set_logs(&job, r#"{"risk_score": 0.1}"#);

    world.reconciler().sweep().await;
    let scan = world
        .stores
        .scans()
        .get(scan_id)
        .await
        .expect("fetch")
        .expect("exists");
    // The output was readable, so the result is kept, but a failed workload
    // never counts as a pass.
    assert_eq!(scan.status, ScanStatus::Completed);
    let server = world
        .stores
        .servers()
        .get(server_id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(server.status, ServerStatus::ScannedFail);
}

#[tokio::test]
async fn unparseable_logs_fail_the_scan() {
    let world = world();
    let (server_id, scan_id, job) = running_scan(&world, "team-a/weather").await;
    world.runner.set_phase(&job, WorkloadPhase::Succeeded);
    world.runner.set_logs(&job, "panic: scanner exploded");

    world.reconciler().sweep().await;
    let scan = world
        .stores
        .scans()
        .get(scan_id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(scan.status, ScanStatus::Failed);
    assert!(scan
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("unparseable")));
    let server = world
        .stores
        .servers()
        .get(server_id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(server.status, ServerStatus::ScannedFail);
}

#[tokio::test]
async fn vanished_workload_fails_the_scan() {
    let world = world();
    let (server_id, scan_id, job) = running_scan(&world, "team-a/weather").await;
    world
        .runner
        .phases
        .lock()
        .expect("lock")
        .remove(&job);

    world.reconciler().sweep().await;
    let scan = world
        .stores
        .scans()
        .get(scan_id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(scan.status, ScanStatus::Failed);
    let server = world
        .stores
        .servers()
        .get(server_id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(server.status, ServerStatus::ScannedFail);
}

#[tokio::test]
async fn overdue_workload_times_out() {
    let world = world();
    let (server_id, scan_id, job) = running_scan(&world, "team-a/weather").await;
    // Still running past the 300s budget.
    world.runner.set_phase(&job, WorkloadPhase::Running);
    backdate_scan(&world, scan_id, 301).await;

    world.reconciler().sweep().await;
    let scan = world
        .stores
        .scans()
        .get(scan_id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(scan.status, ScanStatus::TimedOut);
    assert!(scan.finished_at.is_some());
    assert!(scan
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("timeout")));
    let server = world
        .stores
        .servers()
        .get(server_id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(server.status, ServerStatus::ScannedFail);
    assert!(world.runner.deleted_names().contains(&job));
}

#[tokio::test]
async fn workload_within_budget_is_left_running() {
    let world = world();
    let (_, scan_id, job) = running_scan(&world, "team-a/weather").await;
    world.runner.set_phase(&job, WorkloadPhase::Running);

    let settled = world.reconciler().sweep().await;
    assert_eq!(settled, 0);
    let scan = world
        .stores
        .scans()
        .get(scan_id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(scan.status, ScanStatus::Running);
}

#[tokio::test]
async fn second_sweep_is_idempotent() {
    let world = world();
    let (_, _, job) = running_scan(&world, "team-a/weather").await;
    world.runner.set_phase(&job, WorkloadPhase::Succeeded);
    world.runner.set_logs(&job, r#"{"risk_score": 0.2}"#);

    let reconciler = world.reconciler();
    assert_eq!(reconciler.sweep().await, 1);
    assert_eq!(reconciler.sweep().await, 0);
}

#[tokio::test]
async fn stale_pending_scan_times_out() {
    let world = world();
    let (server_id, scan_id, job) = running_scan(&world, "team-a/weather").await;
    // Simulate a crash right after the Pending insert: reset the scan to
    // Pending with no progress and backdate it.
    let scans = world.stores.scans();
    let mut scan = scans.get(scan_id).await.expect("fetch").expect("exists");
    scan.status = ScanStatus::Pending;
    scans.insert(&scan).await.expect("reset");
    world.runner.phases.lock().expect("lock").remove(&job);
    backdate_scan(&world, scan_id, 301).await;

    world.reconciler().sweep().await;
    let scan = scans.get(scan_id).await.expect("fetch").expect("exists");
    assert_eq!(scan.status, ScanStatus::TimedOut);
    let server = world
        .stores
        .servers()
        .get(server_id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(server.status, ServerStatus::ScannedFail);
}
