//! Scan orchestration: workload launch, cancellation, and reconciliation.
//!
//! The trigger path records a Pending scan, launches a hardened one-shot
//! workload named after the scan id, and flips scan and server state
//! transactionally. A background reconciler (one instance per deployment)
//! polls running workloads, ingests their stdout, and writes terminal
//! results; see [`reconciler`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ScannerConfig;
use crate::error::GatewayError;
use crate::metrics::Metrics;
use crate::model::{Scan, ScanStatus, Server, ServerStatus, SourceType};
use crate::store::{ScanCompletion, ScanStore};

pub mod docker;
pub mod parse;
pub mod reconciler;
pub mod runner;

pub use reconciler::Reconciler;

use runner::{
    command_for_server, job_name_for_scan, RunnerError, ScanDescriptor, ScanRunner, WorkloadSpec,
    DESCRIPTOR_ENV,
};

/// Launches scan workloads and handles explicit cancellation.
pub struct ScanOrchestrator {
    scans: Arc<dyn ScanStore>,
    runner: Arc<dyn ScanRunner>,
    config: ScannerConfig,
    metrics: Arc<Metrics>,
}

impl ScanOrchestrator {
    /// Wire the orchestrator against a scan store and a workload runner.
    pub fn new(
        scans: Arc<dyn ScanStore>,
        runner: Arc<dyn ScanRunner>,
        config: ScannerConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            scans,
            runner,
            config,
            metrics,
        }
    }

    /// Record a Pending scan for the server and launch its workload.
    ///
    /// The caller has already moved the server to PendingScan. On submission
    /// failure the scan is marked Failed and the server ScannedFail before
    /// the error propagates.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InvalidArgument`] for local-declared servers (their
    /// results arrive by upload); [`GatewayError::Upstream`] when every
    /// submission attempt was rejected by the scheduler.
    pub async fn launch(&self, server: &Server, triggered_by: &str) -> Result<Scan, GatewayError> {
        if server.source_type == SourceType::LocalDeclared {
            return Err(GatewayError::InvalidArgument(
                "local-declared servers are scanned via upload".to_owned(),
            ));
        }

        let scan_id = Uuid::new_v4();
        let job_name = job_name_for_scan(scan_id);
        let scan = Scan {
            id: scan_id,
            server_id: server.id,
            scanner_version: self.scanner_version(),
            status: ScanStatus::Pending,
            risk_score: None,
            summary: None,
            report_json: None,
            issues: Vec::new(),
            discovered_tools: Vec::new(),
            job_name: Some(job_name.clone()),
            error_message: None,
            started_at: Utc::now(),
            finished_at: None,
            triggered_by: triggered_by.to_owned(),
        };
        self.scans.insert(&scan).await?;

        let spec = self.workload_spec(server, &job_name)?;
        match self.submit_with_retries(&spec).await {
            Ok(()) => {
                self.scans
                    .mark_running(scan.id, server.id, &job_name)
                    .await?;
                self.metrics.scan_started();
                info!(
                    scan_id = %scan.id,
                    server = %server.canonical_id,
                    job = %job_name,
                    "scan workload launched"
                );
                let mut launched = scan;
                launched.status = ScanStatus::Running;
                Ok(launched)
            }
            Err(e) => {
                warn!(
                    scan_id = %scan.id,
                    server = %server.canonical_id,
                    error = %e,
                    "scan submission failed"
                );
                let completion = ScanCompletion {
                    scan_id: scan.id,
                    server_id: server.id,
                    expect: vec![ScanStatus::Pending],
                    status: ScanStatus::Failed,
                    risk_score: None,
                    summary: None,
                    report_json: None,
                    issues: Vec::new(),
                    discovered_tools: Vec::new(),
                    error_message: Some(format!("workload submission failed: {e}")),
                    finished_at: Utc::now(),
                    server_status: Some(ServerStatus::ScannedFail),
                };
                self.scans.record_completion(&completion).await?;
                self.metrics.scan_finished(ScanStatus::Failed);
                Err(GatewayError::Upstream(e.to_string()))
            }
        }
    }

    /// Cancel a scan explicitly.
    ///
    /// Deletes the workload and marks the scan Cancelled with `finished_at`
    /// set; the server's lifecycle state is deliberately left alone.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InvalidState`] when the scan is already terminal.
    pub async fn cancel(&self, scan: &Scan) -> Result<Scan, GatewayError> {
        if scan.status.is_terminal() {
            return Err(GatewayError::InvalidState(format!(
                "scan is already {:?}",
                scan.status
            )));
        }
        if let Some(job_name) = &scan.job_name {
            if let Err(e) = self.runner.delete(job_name).await {
                warn!(job = %job_name, error = %e, "failed to delete cancelled workload");
            }
        }
        let completion = ScanCompletion {
            scan_id: scan.id,
            server_id: scan.server_id,
            expect: vec![ScanStatus::Pending, ScanStatus::Running],
            status: ScanStatus::Cancelled,
            risk_score: None,
            summary: None,
            report_json: None,
            issues: Vec::new(),
            discovered_tools: Vec::new(),
            error_message: None,
            finished_at: Utc::now(),
            server_status: None,
        };
        let applied = self.scans.record_completion(&completion).await?;
        if !applied {
            return Err(GatewayError::InvalidState(
                "scan reached a terminal state concurrently".to_owned(),
            ));
        }
        self.metrics.scan_finished(ScanStatus::Cancelled);
        info!(scan_id = %scan.id, "scan cancelled");
        self.scans
            .get(scan.id)
            .await?
            .ok_or_else(|| GatewayError::Internal("cancelled scan vanished".to_owned()))
    }

    /// Scanner version string derived from the configured image tag.
    pub fn scanner_version(&self) -> String {
        self.config
            .image
            .rsplit_once(':')
            .map(|(_, tag)| tag.to_owned())
            .unwrap_or_else(|| "unknown".to_owned())
    }

    fn workload_spec(&self, server: &Server, job_name: &str) -> Result<WorkloadSpec, GatewayError> {
        let descriptor =
            ScanDescriptor::for_server(server, self.config.analysis_api_url.clone());
        let encoded = descriptor
            .encode()
            .map_err(|e| GatewayError::Internal(format!("descriptor encoding failed: {e}")))?;
        let mut labels = std::collections::HashMap::new();
        labels.insert(
            "mcp-gateway/namespace".to_owned(),
            self.config.job_namespace.clone(),
        );
        labels.insert(
            "mcp-gateway/service-account".to_owned(),
            self.config.job_service_account.clone(),
        );
        labels.insert("mcp-gateway/server".to_owned(), server.canonical_id.clone());
        Ok(WorkloadSpec {
            name: job_name.to_owned(),
            image: self.config.image.clone(),
            command: command_for_server(server, self.config.enable_dynamic_testing),
            env: vec![(DESCRIPTOR_ENV.to_owned(), encoded)],
            memory_limit_mb: self.config.memory_limit_mb,
            cpu_limit: self.config.cpu_limit,
            active_deadline: Duration::from_secs(self.config.timeout_seconds),
            labels,
        })
    }

    async fn submit_with_retries(&self, spec: &WorkloadSpec) -> Result<(), RunnerError> {
        let attempts = self.config.retries.saturating_add(1);
        let mut last = None;
        for attempt in 1..=attempts {
            match self.runner.launch(spec).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(job = %spec.name, attempt, error = %e, "workload submission attempt failed");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| RunnerError::Rejected("no submission attempts".to_owned())))
    }
}
