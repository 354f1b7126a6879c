//! Filtered queries, pagination, and aggregate statistics.

use chrono::{Duration, Utc};

use turing::model::Decision;
use turing::store::{AuditFilter, AuditStore, MemoryStores};

use super::pipeline_test::event;

async fn seeded() -> MemoryStores {
    let stores = MemoryStores::new();
    let store = stores.audit();
    for i in 0..4 {
        let mut e = event("alice", "team-a/weather", Decision::Allowed);
        e.timestamp = Utc::now() - Duration::minutes(i);
        e.latency_ms = 2.0;
        store.insert(&e).await.expect("insert");
    }
    let mut denied = event("bob", "team-b/tickets", Decision::DeniedToolDenylisted);
    denied.team = Some("team-b".to_owned());
    denied.latency_ms = 4.0;
    store.insert(&denied).await.expect("insert");
    stores
}

#[tokio::test]
async fn query_filters_by_decision_and_actor() {
    let stores = seeded().await;
    let store = stores.audit();

    let page = store
        .query(
            &AuditFilter {
                decision: Some(Decision::DeniedToolDenylisted),
                ..AuditFilter::default()
            },
            100,
            0,
        )
        .await
        .expect("query");
    assert_eq!(page.total, 1);
    assert_eq!(page.events[0].actor, "bob");

    let page = store
        .query(
            &AuditFilter {
                actor: Some("alice".to_owned()),
                ..AuditFilter::default()
            },
            100,
            0,
        )
        .await
        .expect("query");
    assert_eq!(page.total, 4);
}

#[tokio::test]
async fn query_pages_newest_first() {
    let stores = seeded().await;
    let store = stores.audit();

    let first = store
        .query(&AuditFilter::default(), 2, 0)
        .await
        .expect("query");
    assert_eq!(first.total, 5);
    assert_eq!(first.events.len(), 2);
    assert!(first.events[0].timestamp >= first.events[1].timestamp);

    let second = store
        .query(&AuditFilter::default(), 2, 2)
        .await
        .expect("query");
    assert_eq!(second.events.len(), 2);
    assert!(second.events[0].timestamp <= first.events[1].timestamp);
}

#[tokio::test]
async fn query_honours_time_window() {
    let stores = seeded().await;
    let store = stores.audit();
    let page = store
        .query(
            &AuditFilter {
                start: Some(Utc::now() - Duration::seconds(90)),
                ..AuditFilter::default()
            },
            100,
            0,
        )
        .await
        .expect("query");
    // Only the events from the last 90 seconds qualify.
    assert!(page.total < 5);
    assert!(page.total >= 2);
}

#[tokio::test]
async fn stats_aggregate_the_window() {
    let stores = seeded().await;
    let store = stores.audit();
    let stats = store
        .stats(&AuditFilter::default())
        .await
        .expect("stats");
    assert_eq!(stats.total, 5);
    assert!((stats.mean_latency_ms - 2.4).abs() < 1e-9);

    let decisions: std::collections::HashMap<_, _> =
        stats.by_decision.iter().cloned().collect();
    assert_eq!(decisions["Allowed"], 4);
    assert_eq!(decisions["DeniedToolDenylisted"], 1);

    assert_eq!(stats.top_servers[0].0, "team-a/weather");
    assert_eq!(stats.top_servers[0].1, 4);
    assert_eq!(stats.top_teams[0].0, "team-a");
}
