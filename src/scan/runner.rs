//! Workload abstraction for isolated scan jobs.
//!
//! The orchestrator talks to the scheduler through [`ScanRunner`] so the
//! production Docker-backed implementation and the in-memory fake used by
//! tests are interchangeable. A workload is a one-shot job identified by a
//! deterministic name derived from the scan id.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Server, SourceType};

/// Environment variable carrying the base64-encoded scan descriptor.
pub const DESCRIPTOR_ENV: &str = "SCAN_DESCRIPTOR_B64";

/// Maximum scheduler object-name length.
const MAX_JOB_NAME_LEN: usize = 63;

/// Deterministic workload name for a scan.
///
/// Lowercase, bounded to the scheduler's 63-character object-name limit.
pub fn job_name_for_scan(scan_id: Uuid) -> String {
    let mut name = format!("mcp-scan-{scan_id}").to_lowercase();
    name.truncate(MAX_JOB_NAME_LEN);
    name
}

/// Everything the scanner workload needs to know about its target, shipped
/// as a base64 JSON blob in the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanDescriptor {
    /// Target server canonical id.
    pub canonical_id: String,
    /// Provenance of the target.
    pub source_type: SourceType,
    /// Repository or artifact URL.
    pub source_url: Option<String>,
    /// Endpoint for dynamic testing.
    pub test_endpoint: Option<String>,
    /// Transport descriptor the target serves MCP over.
    pub mcp_config: Option<serde_json::Value>,
    /// Tools the owner declared.
    pub declared_tools: Vec<String>,
    /// Optional analysis backend the scanner should report to.
    pub analysis_api_url: Option<String>,
}

impl ScanDescriptor {
    /// Build the descriptor for a server.
    pub fn for_server(server: &Server, analysis_api_url: Option<String>) -> Self {
        Self {
            canonical_id: server.canonical_id.clone(),
            source_type: server.source_type,
            source_url: server.source_url.clone(),
            test_endpoint: server.test_endpoint.clone(),
            mcp_config: server.mcp_config.clone(),
            declared_tools: server.declared_tools.clone(),
            analysis_api_url,
        }
    }

    /// Encode as base64 JSON for the workload environment.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }
}

/// Scanner invocation for a server, selected by source type.
///
/// Repository sources are cloned shallow and scanned as a working copy;
/// artifact sources are handed to the scanner directly. Local-declared
/// servers never reach this point (their results arrive by upload).
///
/// The source URL and test endpoint come verbatim from server owners, so
/// every interpolated value is single-quoted before it touches the shell.
pub fn command_for_server(server: &Server, dynamic_testing: bool) -> Vec<String> {
    let mut script = match server.source_type {
        SourceType::ExternalRepo | SourceType::InternalRepo => {
            let url = shell_quote(server.source_url.as_deref().unwrap_or_default());
            format!(
                "git clone --depth 1 {url} /tmp/scan-target && \
                 mcp-scanner scan --path /tmp/scan-target --format json"
            )
        }
        SourceType::ContainerImage | SourceType::PackageArtifact => {
            let url = shell_quote(server.source_url.as_deref().unwrap_or_default());
            format!("mcp-scanner scan --artifact {url} --format json")
        }
        SourceType::LocalDeclared => String::new(),
    };
    if dynamic_testing {
        if let Some(endpoint) = server
            .test_endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
        {
            script.push_str(&format!(" --endpoint {}", shell_quote(endpoint)));
        }
    }
    vec!["sh".to_owned(), "-c".to_owned(), script]
}

/// Wrap an untrusted value in single quotes for safe shell interpolation.
fn shell_quote(raw: &str) -> String {
    let escaped = raw.replace('\'', r"'\''");
    format!("'{escaped}'")
}

/// A one-shot workload submission.
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    /// Deterministic job name.
    pub name: String,
    /// Scanner image.
    pub image: String,
    /// Entry command.
    pub command: Vec<String>,
    /// Environment for the workload.
    pub env: Vec<(String, String)>,
    /// Memory limit in megabytes.
    pub memory_limit_mb: u64,
    /// CPU limit in whole-or-fractional cores.
    pub cpu_limit: f64,
    /// Hard deadline enforced by the scheduler.
    pub active_deadline: Duration,
    /// Scheduler placement metadata (namespace, service account) attached
    /// as labels.
    pub labels: HashMap<String, String>,
}

/// Observed lifecycle phase of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadPhase {
    /// Created but not running yet.
    Pending,
    /// Still executing.
    Running,
    /// Exited zero.
    Succeeded,
    /// Exited non-zero.
    Failed,
    /// The scheduler no longer knows the name.
    NotFound,
}

/// Errors from the workload scheduler.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// Scheduler API failure.
    #[error("scheduler error: {0}")]
    Scheduler(String),
    /// Submission was rejected.
    #[error("workload submission rejected: {0}")]
    Rejected(String),
}

/// Scheduler seam used by the orchestrator and reconciler.
#[async_trait]
pub trait ScanRunner: Send + Sync {
    /// Submit a one-shot workload.
    async fn launch(&self, spec: &WorkloadSpec) -> Result<(), RunnerError>;
    /// Observe a workload's phase by name.
    async fn phase(&self, name: &str) -> Result<WorkloadPhase, RunnerError>;
    /// Fetch the workload's stdout.
    async fn logs(&self, name: &str) -> Result<String, RunnerError>;
    /// Delete the workload; absence is not an error.
    async fn delete(&self, name: &str) -> Result<(), RunnerError>;
}
