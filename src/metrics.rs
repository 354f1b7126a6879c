//! Prometheus metrics for the gateway.
//!
//! One registry owns every collector; the `/metrics` handler renders it in
//! the text exposition format. Counter and histogram label sets follow the
//! decision and scan vocabularies from the audit taxonomy.

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::model::{Decision, ScanStatus, ServerStatus, SourceType};

/// Process-wide metrics handle.
pub struct Metrics {
    registry: Registry,
    tool_calls: IntCounterVec,
    scan_runs: IntCounterVec,
    registrations: IntCounterVec,
    approved_servers: IntGauge,
    pending_scans: IntGauge,
    risk_scores: Histogram,
    tool_call_latency: HistogramVec,
    policy_check_latency: Histogram,
}

impl Metrics {
    /// Build and register every collector.
    ///
    /// # Errors
    ///
    /// Returns the underlying registration error on collector name clashes.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let tool_calls = IntCounterVec::new(
            Opts::new("mcp_tool_calls_total", "Tool call decisions by outcome"),
            &["server", "tool", "team", "decision"],
        )?;
        registry.register(Box::new(tool_calls.clone()))?;

        let scan_runs = IntCounterVec::new(
            Opts::new("mcp_scan_runs_total", "Scan runs by terminal status"),
            &["status"],
        )?;
        registry.register(Box::new(scan_runs.clone()))?;

        let registrations = IntCounterVec::new(
            Opts::new(
                "mcp_server_registrations_total",
                "Server registrations by source type and status",
            ),
            &["source_type", "status"],
        )?;
        registry.register(Box::new(registrations.clone()))?;

        let approved_servers = IntGauge::new(
            "mcp_approved_servers",
            "Servers currently in the Approved state",
        )?;
        registry.register(Box::new(approved_servers.clone()))?;

        let pending_scans = IntGauge::new(
            "mcp_pending_scans",
            "Scans currently pending or running",
        )?;
        registry.register(Box::new(pending_scans.clone()))?;

        let risk_scores = Histogram::with_opts(
            HistogramOpts::new(
                "mcp_scan_risk_score",
                "Distribution of normalized scan risk scores",
            )
            .buckets(vec![0.05, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]),
        )?;
        registry.register(Box::new(risk_scores.clone()))?;

        let tool_call_latency = HistogramVec::new(
            HistogramOpts::new(
                "mcp_tool_call_latency_seconds",
                "End-to-end latency of governed tool calls",
            ),
            &["server", "tool"],
        )?;
        registry.register(Box::new(tool_call_latency.clone()))?;

        let policy_check_latency = Histogram::with_opts(
            HistogramOpts::new(
                "mcp_policy_check_latency_seconds",
                "Latency of policy decisions",
            )
            .buckets(vec![
                0.000_1, 0.000_25, 0.000_5, 0.001, 0.002_5, 0.005, 0.01, 0.025, 0.05,
            ]),
        )?;
        registry.register(Box::new(policy_check_latency.clone()))?;

        Ok(Self {
            registry,
            tool_calls,
            scan_runs,
            registrations,
            approved_servers,
            pending_scans,
            risk_scores,
            tool_call_latency,
            policy_check_latency,
        })
    }

    /// Count one enforcement decision.
    pub fn tool_call(&self, server: &str, tool: &str, team: Option<&str>, decision: Decision) {
        self.tool_calls
            .with_label_values(&[server, tool, team.unwrap_or(""), decision.label()])
            .inc();
    }

    /// Count a workload launch.
    pub fn scan_started(&self) {
        self.scan_runs
            .with_label_values(&[ScanStatus::Running.label()])
            .inc();
    }

    /// Count a terminal scan transition.
    pub fn scan_finished(&self, status: ScanStatus) {
        self.scan_runs.with_label_values(&[status.label()]).inc();
    }

    /// Count a registration.
    pub fn server_registered(&self, source_type: SourceType, status: ServerStatus) {
        self.registrations
            .with_label_values(&[source_type.label(), &format!("{status:?}")])
            .inc();
    }

    /// Set the approved-servers gauge.
    pub fn set_approved_servers(&self, count: i64) {
        self.approved_servers.set(count);
    }

    /// Set the pending-scans gauge.
    pub fn set_pending_scans(&self, count: i64) {
        self.pending_scans.set(count);
    }

    /// Observe a normalized risk score.
    pub fn observe_risk_score(&self, score: f64) {
        self.risk_scores.observe(score);
    }

    /// Observe a governed call's end-to-end latency.
    pub fn observe_tool_call_latency(&self, server: &str, tool: &str, seconds: f64) {
        self.tool_call_latency
            .with_label_values(&[server, tool])
            .observe(seconds);
    }

    /// Observe one policy decision's latency.
    pub fn observe_policy_latency(&self, seconds: f64) {
        self.policy_check_latency.observe(seconds);
    }

    /// Render the registry in the Prometheus text format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "metrics encoding failed");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
