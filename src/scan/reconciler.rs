//! Background reconciliation of running scan workloads.
//!
//! Exactly one reconciler runs per deployment. Safety against accidental
//! doubles comes from the conditional terminal transition: finalizing a scan
//! only applies while the row is still Running, so a second reconciler (or a
//! racing cancel) becomes a no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ScannerConfig;
use crate::metrics::Metrics;
use crate::model::{Scan, ScanStatus, ServerStatus};
use crate::store::{ScanCompletion, ScanStore, ServerStore};

use super::parse::parse_scan_output;
use super::runner::{ScanRunner, WorkloadPhase};

/// Periodic sweeper that drives Running scans to a terminal state.
pub struct Reconciler {
    scans: Arc<dyn ScanStore>,
    servers: Arc<dyn ServerStore>,
    runner: Arc<dyn ScanRunner>,
    config: ScannerConfig,
    pass_threshold: f64,
    metrics: Arc<Metrics>,
}

impl Reconciler {
    /// Wire a reconciler over the shared stores and runner.
    pub fn new(
        scans: Arc<dyn ScanStore>,
        servers: Arc<dyn ServerStore>,
        runner: Arc<dyn ScanRunner>,
        config: ScannerConfig,
        pass_threshold: f64,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            scans,
            servers,
            runner,
            config,
            pass_threshold,
            metrics,
        }
    }

    /// Run the sweep loop until shutdown is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.reconcile_interval_seconds.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "scan reconciler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let settled = self.sweep().await;
                    if settled > 0 {
                        debug!(settled, "reconciler sweep settled scans");
                    }
                }
                _ = shutdown.changed() => {
                    info!("scan reconciler stopping");
                    return;
                }
            }
        }
    }

    /// One reconciliation pass. Returns how many scans reached a terminal
    /// state.
    pub async fn sweep(&self) -> usize {
        let mut settled = 0;
        let running = match self.scans.list_by_status(ScanStatus::Running).await {
            Ok(scans) => scans,
            Err(e) => {
                warn!(error = %e, "reconciler could not list running scans");
                return 0;
            }
        };
        for scan in running {
            match self.reconcile_one(&scan).await {
                Ok(true) => settled += 1,
                Ok(false) => {}
                Err(e) => warn!(scan_id = %scan.id, error = %e, "reconcile failed"),
            }
        }

        // Pending rows left behind by a crash between insert and launch are
        // timed out on the same clock as running workloads.
        if let Ok(stale) = self.scans.list_by_status(ScanStatus::Pending).await {
            for scan in stale {
                if self.expired(&scan) {
                    if self
                        .finalize(
                            &scan,
                            &[ScanStatus::Pending],
                            ScanStatus::TimedOut,
                            None,
                            Some("scan never launched before timeout".to_owned()),
                        )
                        .await
                        .unwrap_or(false)
                    {
                        settled += 1;
                    }
                }
            }
        }

        self.refresh_gauges().await;
        settled
    }

    async fn reconcile_one(&self, scan: &Scan) -> Result<bool, String> {
        let Some(job_name) = scan.job_name.clone() else {
            return self
                .finalize(
                    scan,
                    &[ScanStatus::Running],
                    ScanStatus::Failed,
                    None,
                    Some("running scan has no workload handle".to_owned()),
                )
                .await;
        };

        let phase = self
            .runner
            .phase(&job_name)
            .await
            .map_err(|e| e.to_string())?;
        match phase {
            WorkloadPhase::Succeeded | WorkloadPhase::Failed => {
                let settled = self.ingest(scan, phase == WorkloadPhase::Succeeded).await?;
                if settled {
                    if let Err(e) = self.runner.delete(&job_name).await {
                        debug!(job = %job_name, error = %e, "workload cleanup failed");
                    }
                }
                Ok(settled)
            }
            WorkloadPhase::Running | WorkloadPhase::Pending => {
                if self.expired(scan) {
                    if let Err(e) = self.runner.delete(&job_name).await {
                        debug!(job = %job_name, error = %e, "timed-out workload cleanup failed");
                    }
                    self.finalize(
                        scan,
                        &[ScanStatus::Running],
                        ScanStatus::TimedOut,
                        None,
                        Some(format!(
                            "scan exceeded {}s timeout",
                            self.config.timeout_seconds
                        )),
                    )
                    .await
                } else {
                    Ok(false)
                }
            }
            WorkloadPhase::NotFound => {
                self.finalize(
                    scan,
                    &[ScanStatus::Running],
                    ScanStatus::Failed,
                    None,
                    Some("workload not found on scheduler".to_owned()),
                )
                .await
            }
        }
    }

    /// Pull the workload's stdout, parse it, and record the result.
    async fn ingest(&self, scan: &Scan, workload_succeeded: bool) -> Result<bool, String> {
        let job_name = scan.job_name.as_deref().unwrap_or_default();
        let logs = match self.runner.logs(job_name).await {
            Ok(logs) => logs,
            Err(e) => {
                return self
                    .finalize(
                        scan,
                        &[ScanStatus::Running],
                        ScanStatus::Failed,
                        None,
                        Some(format!("could not fetch workload logs: {e}")),
                    )
                    .await;
            }
        };

        match parse_scan_output(&logs) {
            Ok(outcome) => {
                let passed = workload_succeeded && outcome.risk_score <= self.pass_threshold;
                let server_status = if passed {
                    ServerStatus::ScannedPass
                } else {
                    ServerStatus::ScannedFail
                };
                let completion = ScanCompletion {
                    scan_id: scan.id,
                    server_id: scan.server_id,
                    expect: vec![ScanStatus::Running],
                    status: ScanStatus::Completed,
                    risk_score: Some(outcome.risk_score),
                    summary: outcome.summary.clone(),
                    report_json: Some(outcome.raw.clone()),
                    issues: outcome.issues.clone(),
                    discovered_tools: outcome.discovered_tools.clone(),
                    error_message: None,
                    finished_at: Utc::now(),
                    server_status: Some(server_status),
                };
                let applied = self
                    .scans
                    .record_completion(&completion)
                    .await
                    .map_err(|e| e.to_string())?;
                if applied {
                    self.metrics.scan_finished(ScanStatus::Completed);
                    self.metrics.observe_risk_score(outcome.risk_score);
                    info!(
                        scan_id = %scan.id,
                        risk_score = outcome.risk_score,
                        passed,
                        "scan result recorded"
                    );
                }
                Ok(applied)
            }
            Err(e) => {
                self.finalize(
                    scan,
                    &[ScanStatus::Running],
                    ScanStatus::Failed,
                    None,
                    Some(format!("unparseable scanner output: {e}")),
                )
                .await
            }
        }
    }

    async fn finalize(
        &self,
        scan: &Scan,
        expect: &[ScanStatus],
        status: ScanStatus,
        risk_score: Option<f64>,
        error_message: Option<String>,
    ) -> Result<bool, String> {
        let completion = ScanCompletion {
            scan_id: scan.id,
            server_id: scan.server_id,
            expect: expect.to_vec(),
            status,
            risk_score,
            summary: None,
            report_json: None,
            issues: Vec::new(),
            discovered_tools: Vec::new(),
            error_message,
            finished_at: Utc::now(),
            server_status: Some(ServerStatus::ScannedFail),
        };
        let applied = self
            .scans
            .record_completion(&completion)
            .await
            .map_err(|e| e.to_string())?;
        if applied {
            self.metrics.scan_finished(status);
            info!(scan_id = %scan.id, status = status.label(), "scan settled");
        }
        Ok(applied)
    }

    fn expired(&self, scan: &Scan) -> bool {
        let age = Utc::now().signed_duration_since(scan.started_at);
        age.num_seconds() >= self.config.timeout_seconds as i64
    }

    async fn refresh_gauges(&self) {
        if let Ok(approved) = self
            .servers
            .count_by_status(ServerStatus::Approved)
            .await
        {
            self.metrics.set_approved_servers(approved);
        }
        let mut pending = 0;
        for status in [ScanStatus::Pending, ScanStatus::Running] {
            if let Ok(scans) = self.scans.list_by_status(status).await {
                pending += scans.len() as i64;
            }
        }
        self.metrics.set_pending_scans(pending);
    }
}
