//! Configuration loading and management.
//!
//! Loads gateway configuration from `./turing.toml` (or `$TURING_CONFIG_PATH`).
//! Environment variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Whether denials block requests or only get recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    /// Record would-deny decisions but forward everything.
    Audit,
    /// Deny with 403.
    #[default]
    Enforce,
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service-level settings.
    pub gateway: GatewayConfig,
    /// Database settings.
    pub database: DatabaseConfig,
    /// Scan workload settings.
    pub scanner: ScannerConfig,
    /// Admission policy settings.
    pub policy: PolicyConfig,
    /// Audit pipeline settings.
    pub audit: AuditConfig,
}

impl Config {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$TURING_CONFIG_PATH` or `./turing.toml`. A missing
    /// file falls back to defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = std::env::var("TURING_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("turing.toml"));
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: Config =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(Config::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Parse a TOML string into config (for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function for testability.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("TURING_ENABLED") {
            match v.parse() {
                Ok(b) => self.gateway.enabled = b,
                Err(_) => warn_invalid("TURING_ENABLED", &v),
            }
        }
        if let Some(v) = env("TURING_ENFORCEMENT_MODE") {
            match v.to_ascii_lowercase().as_str() {
                "audit" => self.gateway.enforcement_mode = EnforcementMode::Audit,
                "enforce" => self.gateway.enforcement_mode = EnforcementMode::Enforce,
                _ => warn_invalid("TURING_ENFORCEMENT_MODE", &v),
            }
        }
        if let Some(v) = env("TURING_LISTEN_ADDR") {
            self.gateway.listen_addr = v;
        }
        if let Some(v) = env("TURING_LOGS_DIR") {
            self.gateway.logs_dir = v;
        }
        if let Some(v) = env("TURING_POSTGRES_CONNECTION") {
            self.database.postgres_connection = v;
        }
        if let Some(v) = env("TURING_SCANNER_IMAGE") {
            self.scanner.image = v;
        }
        if let Some(v) = env("TURING_SCAN_TIMEOUT_SECS") {
            match v.parse() {
                Ok(n) => self.scanner.timeout_seconds = n,
                Err(_) => warn_invalid("TURING_SCAN_TIMEOUT_SECS", &v),
            }
        }
        if let Some(v) = env("TURING_RISK_THRESHOLD") {
            match v.parse() {
                Ok(n) => self.policy.risk_threshold = n,
                Err(_) => warn_invalid("TURING_RISK_THRESHOLD", &v),
            }
        }
        if let Some(v) = env("TURING_SCAN_PASS_THRESHOLD") {
            match v.parse() {
                Ok(n) => self.policy.scan_pass_threshold = n,
                Err(_) => warn_invalid("TURING_SCAN_PASS_THRESHOLD", &v),
            }
        }
    }
}

fn warn_invalid(var: &str, value: &str) {
    tracing::warn!(var, value = %value, "ignoring invalid env override");
}

/// Service-level settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Enforcement master switch.
    pub enabled: bool,
    /// Deny behaviour.
    pub enforcement_mode: EnforcementMode,
    /// HTTP bind address.
    pub listen_addr: String,
    /// Directory for rotated JSON logs.
    pub logs_dir: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enforcement_mode: EnforcementMode::Enforce,
            listen_addr: "0.0.0.0:8080".to_owned(),
            logs_dir: "./logs".to_owned(),
        }
    }
}

/// Database settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres connection URL.
    pub postgres_connection: String,
    /// Connection pool bound.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            postgres_connection: "postgresql://localhost:5432/mcp_governance".to_owned(),
            max_connections: 16,
        }
    }
}

/// Scan workload settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Scanner image reference.
    pub image: String,
    /// Hard per-scan timeout enforced by the reconciler.
    pub timeout_seconds: u64,
    /// Additional submission attempts after the first failure.
    pub retries: u32,
    /// Scheduler namespace the workloads are attributed to.
    pub job_namespace: String,
    /// Service account the workloads run as.
    pub job_service_account: String,
    /// CPU request in cores.
    pub cpu_request: f64,
    /// CPU limit in cores.
    pub cpu_limit: f64,
    /// Memory request in megabytes.
    pub memory_request_mb: u64,
    /// Memory limit in megabytes.
    pub memory_limit_mb: u64,
    /// Also probe the server's test endpoint when one is configured.
    pub enable_dynamic_testing: bool,
    /// Analysis backend the scanner reports to, if any.
    pub analysis_api_url: Option<String>,
    /// Reconciler sweep period.
    pub reconcile_interval_seconds: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            image: "mcp-scanner:latest".to_owned(),
            timeout_seconds: 300,
            retries: 2,
            job_namespace: "mcp-scans".to_owned(),
            job_service_account: "mcp-scanner".to_owned(),
            cpu_request: 0.25,
            cpu_limit: 1.0,
            memory_request_mb: 256,
            memory_limit_mb: 1024,
            enable_dynamic_testing: false,
            analysis_api_url: None,
            reconcile_interval_seconds: 15,
        }
    }
}

/// Admission policy settings. Reloadable at runtime.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Tool names denied everywhere (case-insensitive).
    pub global_tool_denylist: Vec<String>,
    /// Substrings that deny any tool containing them (case-insensitive).
    pub denied_tool_categories: Vec<String>,
    /// Per-team allowed servers; an empty list allows everything.
    pub team_allowlists: HashMap<String, Vec<String>>,
    /// Per-team denied servers.
    pub team_denylists: HashMap<String, Vec<String>>,
    /// Tool calls per user per window.
    pub rate_limit_per_user: u32,
    /// Tool calls per team per window.
    pub rate_limit_per_team: u32,
    /// Downstream forwarding timeout.
    pub default_timeout_ms: u64,
    /// Largest request body the adapter will buffer.
    pub max_request_payload_bytes: usize,
    /// Largest response body the adapter will report.
    pub max_response_payload_bytes: usize,
    /// Risk score above which non-admins are denied.
    pub risk_threshold: f64,
    /// Risk score at or below which a scan passes.
    pub scan_pass_threshold: f64,
    /// Gate high-risk servers to admins.
    pub require_admin_for_high_risk: bool,
    /// Deny servers that are missing or not Approved.
    pub enforce_registry_only: bool,
    /// Break-glass principals that bypass every rule.
    pub bypass_allowed_principals: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            global_tool_denylist: Vec::new(),
            denied_tool_categories: Vec::new(),
            team_allowlists: HashMap::new(),
            team_denylists: HashMap::new(),
            rate_limit_per_user: 120,
            rate_limit_per_team: 600,
            default_timeout_ms: 30_000,
            max_request_payload_bytes: 1024 * 1024,
            max_response_payload_bytes: 8 * 1024 * 1024,
            risk_threshold: 0.7,
            scan_pass_threshold: 0.5,
            require_admin_for_high_risk: true,
            enforce_registry_only: true,
            bypass_allowed_principals: Vec::new(),
        }
    }
}

/// Audit pipeline settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Bound on the in-memory event queue.
    pub queue_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            queue_capacity: crate::audit::DEFAULT_QUEUE_CAPACITY,
        }
    }
}
