//! Fire-and-forget queue semantics.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use turing::audit::AuditPipeline;
use turing::model::{AuditEvent, Decision};
use turing::store::{AuditFilter, AuditStore, MemoryStores};

pub fn event(actor: &str, server: &str, decision: Decision) -> AuditEvent {
    AuditEvent {
        id: Uuid::new_v4(),
        timestamp: Utc::now(),
        actor: actor.to_owned(),
        actor_email: None,
        team: Some("team-a".to_owned()),
        server_canonical_id: server.to_owned(),
        tool_name: "get_weather".to_owned(),
        decision,
        reason: None,
        latency_ms: 1.5,
        request_size: 128,
        response_size: 512,
        trace_id: Some("trace-1".to_owned()),
        source_ip: None,
        user_agent: None,
        server_risk_score: Some(0.2),
    }
}

async fn wait_for_backlog_drain(pipeline: &AuditPipeline) {
    for _ in 0..100 {
        if pipeline.backlog() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("audit backlog never drained");
}

#[tokio::test]
async fn writer_drains_recorded_events() {
    let stores = MemoryStores::new();
    let store: Arc<dyn AuditStore> = Arc::new(stores.audit());
    let pipeline = AuditPipeline::new(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let writer = pipeline.spawn_writer(Arc::clone(&store), shutdown_rx);

    for i in 0..5 {
        pipeline.record(event(&format!("user-{i}"), "team-a/weather", Decision::Allowed));
    }
    wait_for_backlog_drain(&pipeline).await;

    let page = store
        .query(&AuditFilter::default(), 100, 0)
        .await
        .expect("query");
    assert_eq!(page.total, 5);
    assert_eq!(pipeline.dropped(), 0);

    let _ = shutdown_tx.send(true);
    writer.await.expect("writer exits");
}

#[tokio::test]
async fn overflow_drops_oldest_events() {
    let stores = MemoryStores::new();
    let store: Arc<dyn AuditStore> = Arc::new(stores.audit());
    let pipeline = AuditPipeline::new(3);

    // No writer yet: the queue fills and sheds from the front.
    for i in 0..5 {
        pipeline.record(event(&format!("user-{i}"), "team-a/weather", Decision::Allowed));
    }
    assert_eq!(pipeline.backlog(), 3);
    assert_eq!(pipeline.dropped(), 2);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let writer = pipeline.spawn_writer(Arc::clone(&store), shutdown_rx);
    pipeline.record(event("user-5", "team-a/weather", Decision::Allowed));
    wait_for_backlog_drain(&pipeline).await;

    let page = store
        .query(&AuditFilter::default(), 100, 0)
        .await
        .expect("query");
    // The two oldest events never made it to the store.
    let actors: Vec<&str> = page.events.iter().map(|e| e.actor.as_str()).collect();
    assert!(!actors.contains(&"user-0"));
    assert!(!actors.contains(&"user-1"));
    assert!(actors.contains(&"user-5"));

    let _ = shutdown_tx.send(true);
    writer.await.expect("writer exits");
}

#[tokio::test]
async fn shutdown_flushes_the_queue() {
    let stores = MemoryStores::new();
    let store: Arc<dyn AuditStore> = Arc::new(stores.audit());
    let pipeline = AuditPipeline::new(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let writer = pipeline.spawn_writer(Arc::clone(&store), shutdown_rx);

    pipeline.record(event("user-0", "team-a/weather", Decision::Allowed));
    let _ = shutdown_tx.send(true);
    writer.await.expect("writer exits");

    let page = store
        .query(&AuditFilter::default(), 100, 0)
        .await
        .expect("query");
    assert_eq!(page.total, 1);
}
