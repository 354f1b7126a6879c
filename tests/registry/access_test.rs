//! Access-control behaviour across registry reads.

use turing::error::GatewayError;
use turing::model::SourceType;

use crate::support::{admin, member, register_req, world};

#[tokio::test]
async fn creator_team_and_admin_can_read() {
    let world = world();
    let alice = member("alice", "team-a");
    let server = world
        .registry
        .register(&alice, register_req("team-a/weather", "team-a", SourceType::ContainerImage))
        .await
        .expect("registers");

    // Creator.
    assert!(world
        .registry
        .get(&alice, server.id)
        .await
        .expect("creator reads")
        .is_some());
    // Teammate.
    assert!(world
        .registry
        .get(&member("bob", "team-a"), server.id)
        .await
        .expect("teammate reads")
        .is_some());
    // Admin.
    assert!(world
        .registry
        .get(&admin(), server.id)
        .await
        .expect("admin reads")
        .is_some());
    // Outsider.
    let err = world
        .registry
        .get(&member("mallory", "team-z"), server.id)
        .await
        .expect_err("outsider blocked");
    assert!(matches!(err, GatewayError::Forbidden(_)));
}

#[tokio::test]
async fn get_by_canonical_id_enforces_the_same_scope() {
    let world = world();
    let alice = member("alice", "team-a");
    world
        .registry
        .register(&alice, register_req("team-a/weather", "team-a", SourceType::ContainerImage))
        .await
        .expect("registers");

    assert!(world
        .registry
        .get_by_canonical_id(&alice, "TEAM-A/WEATHER")
        .await
        .expect("case-insensitive lookup")
        .is_some());
    let err = world
        .registry
        .get_by_canonical_id(&member("mallory", "team-z"), "team-a/weather")
        .await
        .expect_err("outsider blocked");
    assert!(matches!(err, GatewayError::Forbidden(_)));
}

#[tokio::test]
async fn list_never_leaks_inaccessible_servers() {
    let world = world();
    world
        .registry
        .register(
            &member("alice", "team-a"),
            register_req("team-a/weather", "team-a", SourceType::ContainerImage),
        )
        .await
        .expect("registers");
    world
        .registry
        .register(
            &member("carol", "team-b"),
            register_req("team-b/tickets", "team-b", SourceType::ContainerImage),
        )
        .await
        .expect("registers");

    let bob = member("bob", "team-a");
    let visible = world.registry.list(&bob, None, None).await.expect("lists");
    assert_eq!(visible.len(), 1);
    // Access closure: everything listed must also be fetchable.
    for server in &visible {
        assert!(world
            .registry
            .get(&bob, server.id)
            .await
            .expect("listed servers are readable")
            .is_some());
    }

    let everything = world.registry.list(&admin(), None, None).await.expect("lists");
    assert_eq!(everything.len(), 2);
}

#[tokio::test]
async fn list_filters_by_status_and_owner() {
    let world = world();
    let alice = member("alice", "team-a");
    world
        .registry
        .register(&alice, register_req("team-a/weather", "team-a", SourceType::ContainerImage))
        .await
        .expect("registers");
    world
        .registry
        .register(&alice, register_req("team-a/geo", "team-a", SourceType::ContainerImage))
        .await
        .expect("registers");

    let drafts = world
        .registry
        .list(&admin(), Some(turing::model::ServerStatus::Draft), None)
        .await
        .expect("lists");
    assert_eq!(drafts.len(), 2);

    let by_team = world
        .registry
        .list(&admin(), None, Some("team-a"))
        .await
        .expect("lists");
    assert_eq!(by_team.len(), 2);
    let none = world
        .registry
        .list(&admin(), None, Some("team-z"))
        .await
        .expect("lists");
    assert!(none.is_empty());
}

#[tokio::test]
async fn outsiders_cannot_mutate() {
    let world = world();
    let server = world
        .registry
        .register(
            &member("alice", "team-a"),
            register_req("team-a/weather", "team-a", SourceType::ContainerImage),
        )
        .await
        .expect("registers");
    let mallory = member("mallory", "team-z");

    let err = world
        .registry
        .update(&mallory, server.id, turing::registry::UpdateRequest::default())
        .await
        .expect_err("update blocked");
    assert!(matches!(err, GatewayError::Forbidden(_)));
    let err = world
        .registry
        .delete(&mallory, server.id)
        .await
        .expect_err("delete blocked");
    assert!(matches!(err, GatewayError::Forbidden(_)));
    let err = world
        .registry
        .submit_for_scan(&mallory, server.id)
        .await
        .expect_err("scan blocked");
    assert!(matches!(err, GatewayError::Forbidden(_)));
}
