//! Admin decision flows: approve, deny, suspend, reinstate.

use turing::error::GatewayError;
use turing::model::{ApprovalAction, ServerStatus, SourceType};
use turing::registry::DecisionRequest;
use turing::store::ServerStore;

use crate::support::{admin, member, register_req, world, World};

async fn server_in_state(world: &World, canonical_id: &str, status: ServerStatus) -> uuid::Uuid {
    let server = world
        .registry
        .register(
            &member("alice", "team-a"),
            register_req(canonical_id, "team-a", SourceType::ContainerImage),
        )
        .await
        .expect("registers");
    let mut forced = server.clone();
    forced.status = status;
    world
        .stores
        .servers()
        .update(&forced)
        .await
        .expect("force status");
    server.id
}

fn decision(reason: &str) -> DecisionRequest {
    DecisionRequest {
        reason: reason.to_owned(),
        ..DecisionRequest::default()
    }
}

#[tokio::test]
async fn approve_from_scanned_pass() {
    let world = world();
    let id = server_in_state(&world, "team-a/weather", ServerStatus::ScannedPass).await;
    let approval = world
        .registry
        .approve(&admin(), id, decision("scan is clean"))
        .await
        .expect("approves");
    assert_eq!(approval.action, ApprovalAction::Approved);
    assert_eq!(approval.reason, "scan is clean");
    assert_eq!(approval.server_canonical_id, "team-a/weather");

    let server = world
        .stores
        .servers()
        .get(id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(server.status, ServerStatus::Approved);
}

#[tokio::test]
async fn approve_requires_admin() {
    let world = world();
    let id = server_in_state(&world, "team-a/weather", ServerStatus::ScannedPass).await;
    let err = world
        .registry
        .approve(&member("alice", "team-a"), id, decision("please"))
        .await
        .expect_err("owner cannot approve");
    assert!(matches!(err, GatewayError::Forbidden(_)));
}

#[tokio::test]
async fn approve_requires_reason() {
    let world = world();
    let id = server_in_state(&world, "team-a/weather", ServerStatus::ScannedPass).await;
    let err = world
        .registry
        .approve(&admin(), id, decision("  "))
        .await
        .expect_err("empty reason rejected");
    assert!(matches!(err, GatewayError::InvalidArgument(_)));
}

#[tokio::test]
async fn approve_scanned_fail_requires_override() {
    let world = world();
    let id = server_in_state(&world, "team-a/weather", ServerStatus::ScannedFail).await;
    let err = world
        .registry
        .approve(&admin(), id, decision("looks fine anyway"))
        .await
        .expect_err("no override reason");
    assert!(matches!(err, GatewayError::InvalidState(_)));

    let approval = world
        .registry
        .approve(
            &admin(),
            id,
            DecisionRequest {
                reason: "accepted risk".to_owned(),
                override_reason: Some("false positives confirmed by security".to_owned()),
                ..DecisionRequest::default()
            },
        )
        .await
        .expect("override approves");
    assert!(approval
        .notes
        .as_deref()
        .is_some_and(|n| n.contains("false positives")));
}

#[tokio::test]
async fn approve_from_draft_is_invalid() {
    let world = world();
    let id = server_in_state(&world, "team-a/weather", ServerStatus::Draft).await;
    let err = world
        .registry
        .approve(&admin(), id, decision("too eager"))
        .await
        .expect_err("unscanned server");
    assert!(matches!(err, GatewayError::InvalidState(_)));
}

#[tokio::test]
async fn deny_from_any_non_terminal_state() {
    let world = world();
    for (i, status) in [
        ServerStatus::Draft,
        ServerStatus::Scanning,
        ServerStatus::ScannedPass,
        ServerStatus::Approved,
    ]
    .into_iter()
    .enumerate()
    {
        let id = server_in_state(&world, &format!("team-a/server-{i}"), status).await;
        let approval = world
            .registry
            .deny(&admin(), id, decision("policy change"))
            .await
            .expect("denies");
        assert_eq!(approval.action, ApprovalAction::Denied);
    }
}

#[tokio::test]
async fn suspend_and_reinstate_round_trip() {
    let world = world();
    let id = server_in_state(&world, "team-a/weather", ServerStatus::Approved).await;

    world
        .registry
        .suspend(&admin(), id, decision("incident response"))
        .await
        .expect("suspends");
    let server = world
        .stores
        .servers()
        .get(id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(server.status, ServerStatus::Suspended);

    // Approve on a suspended server is not the way back.
    let err = world
        .registry
        .approve(&admin(), id, decision("oops"))
        .await
        .expect_err("approve is invalid while suspended");
    assert!(matches!(err, GatewayError::InvalidState(_)));

    let approval = world
        .registry
        .reinstate(&admin(), id, decision("incident resolved"))
        .await
        .expect("reinstates");
    assert_eq!(approval.action, ApprovalAction::Reinstated);
    let server = world
        .stores
        .servers()
        .get(id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(server.status, ServerStatus::Approved);
}

#[tokio::test]
async fn suspend_requires_approved_state() {
    let world = world();
    let id = server_in_state(&world, "team-a/weather", ServerStatus::Draft).await;
    let err = world
        .registry
        .suspend(&admin(), id, decision("nope"))
        .await
        .expect_err("cannot suspend a draft");
    assert!(matches!(err, GatewayError::InvalidState(_)));
}

#[tokio::test]
async fn approval_history_is_append_only_and_ordered() {
    let world = world();
    let id = server_in_state(&world, "team-a/weather", ServerStatus::ScannedPass).await;
    world
        .registry
        .approve(&admin(), id, decision("first"))
        .await
        .expect("approve");
    world
        .registry
        .suspend(&admin(), id, decision("second"))
        .await
        .expect("suspend");
    world
        .registry
        .reinstate(&admin(), id, decision("third"))
        .await
        .expect("reinstate");

    let history = world
        .registry
        .approval_history(&admin(), id)
        .await
        .expect("history");
    assert_eq!(history.len(), 3);
    let actions: Vec<ApprovalAction> = history.iter().map(|a| a.action).collect();
    assert_eq!(
        actions,
        vec![
            ApprovalAction::Reinstated,
            ApprovalAction::Suspended,
            ApprovalAction::Approved
        ]
    );
}

#[tokio::test]
async fn expired_approval_does_not_revert_status() {
    let world = world();
    let id = server_in_state(&world, "team-a/weather", ServerStatus::ScannedPass).await;
    world
        .registry
        .approve(
            &admin(),
            id,
            DecisionRequest {
                reason: "temporary".to_owned(),
                expires_at: Some(chrono::Utc::now() - chrono::Duration::days(1)),
                ..DecisionRequest::default()
            },
        )
        .await
        .expect("approves");

    // The expiry is advisory history; current status stays Approved.
    let server = world
        .stores
        .servers()
        .get(id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(server.status, ServerStatus::Approved);
    let history = world
        .registry
        .approval_history(&admin(), id)
        .await
        .expect("history");
    assert!(history[0].expires_at.is_some());
}
