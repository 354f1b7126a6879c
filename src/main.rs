//! Service entry point: wire the stores, engines, and background loops,
//! then serve the HTTP surface until shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{info, warn};

use turing::audit::AuditPipeline;
use turing::config::Config;
use turing::http::enforce::RateLimiters;
use turing::http::{router, AppState};
use turing::metrics::Metrics;
use turing::policy::PolicyEngine;
use turing::registry::RegistryService;
use turing::scan::docker::DockerRunner;
use turing::scan::runner::ScanRunner;
use turing::scan::{Reconciler, ScanOrchestrator};
use turing::store::{
    ApprovalStore, AuditStore, PgApprovalStore, PgAuditStore, PgScanStore, PgServerStore,
    ScanStore, ServerStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    let _logging = turing::logging::init_production(std::path::Path::new(&config.gateway.logs_dir))
        .context("failed to initialise logging")?;
    info!(version = env!("CARGO_PKG_VERSION"), "turing gateway starting");

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.postgres_connection)
        .await
        .context("failed to connect to postgres")?;

    let servers: Arc<dyn ServerStore> = Arc::new(PgServerStore::new(pool.clone()));
    let scans: Arc<dyn ScanStore> = Arc::new(PgScanStore::new(pool.clone()));
    let approvals: Arc<dyn ApprovalStore> = Arc::new(PgApprovalStore::new(pool.clone()));
    let audit_store: Arc<dyn AuditStore> = Arc::new(PgAuditStore::new(pool));

    // Bootstrap is idempotent; a failure is logged rather than fatal, since
    // operations that need the schema surface their own retriable errors.
    for (name, result) in [
        ("servers", servers.ensure_schema().await),
        ("scans", scans.ensure_schema().await),
        ("approvals", approvals.ensure_schema().await),
        ("audit", audit_store.ensure_schema().await),
    ] {
        if let Err(e) = result {
            warn!(relation = name, error = %e, "schema bootstrap failed");
        }
    }

    let metrics = Arc::new(Metrics::new().context("failed to build metrics registry")?);
    let runner: Arc<dyn ScanRunner> =
        Arc::new(DockerRunner::connect().context("failed to reach the workload scheduler")?);
    let orchestrator = Arc::new(ScanOrchestrator::new(
        Arc::clone(&scans),
        Arc::clone(&runner),
        config.scanner.clone(),
        Arc::clone(&metrics),
    ));
    let registry = Arc::new(RegistryService::new(
        Arc::clone(&servers),
        Arc::clone(&scans),
        Arc::clone(&approvals),
        Arc::clone(&orchestrator),
        config.policy.scan_pass_threshold,
        Arc::clone(&metrics),
    ));
    let policy = Arc::new(PolicyEngine::new(&config.policy, Arc::clone(&servers)));
    let pipeline = AuditPipeline::new(config.audit.queue_capacity);
    let limiters = Arc::new(RateLimiters::new(&config.policy));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let writer = pipeline.spawn_writer(Arc::clone(&audit_store), shutdown_rx.clone());

    // The reconciler must run as a singleton per deployment; terminal scan
    // transitions are additionally gated by conditional updates.
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&scans),
        Arc::clone(&servers),
        Arc::clone(&runner),
        config.scanner.clone(),
        config.policy.scan_pass_threshold,
        Arc::clone(&metrics),
    ));
    let reconciler_task = tokio::spawn(reconciler.run(shutdown_rx));

    let state = AppState {
        registry,
        policy,
        audit_store,
        pipeline,
        metrics,
        config: Arc::new(config.clone()),
        limiters,
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.gateway.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.gateway.listen_addr))?;
    info!(addr = %config.gateway.listen_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = reconciler_task.await;
    let _ = writer.await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install shutdown signal handler");
        std::future::pending::<()>().await;
    }
}
