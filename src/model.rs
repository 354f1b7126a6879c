//! Domain entities for the governance registry.
//!
//! Four persisted entities (server, scan, approval, audit event) plus the
//! authenticated principal. Status and decision enums are persisted by
//! integer ordinal: extend them by appending variants, never by reordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Principal
// ---------------------------------------------------------------------------

/// Role claim that grants administrative access.
pub const ADMIN_ROLE: &str = "admin";

/// Authenticated caller identity supplied by the upstream identity provider.
///
/// Claims are pre-validated before they reach the gateway; the gateway only
/// interprets them. A request with no subject runs as [`Principal::anonymous`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable subject identifier.
    pub id: String,
    /// Email claim when the provider supplies one.
    pub email: Option<String>,
    /// Primary team membership.
    pub team: Option<String>,
    /// Role claims (e.g. `admin`).
    pub roles: Vec<String>,
}

impl Principal {
    /// Principal used when a request carries no identity.
    pub fn anonymous() -> Self {
        Self {
            id: "anonymous".to_owned(),
            email: None,
            team: None,
            roles: Vec::new(),
        }
    }

    /// Whether the principal carries the admin role.
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == ADMIN_ROLE)
    }

    /// Whether this principal may read or mutate the given server.
    ///
    /// Admins see everything; otherwise the creator and members of the owning
    /// team qualify.
    pub fn can_access(&self, server: &Server) -> bool {
        self.is_admin()
            || self.id == server.created_by
            || self.team.as_deref() == Some(server.owner_team.as_str())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Where a registered server's code or artifact comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceType {
    /// Public third-party repository.
    ExternalRepo,
    /// In-house repository.
    InternalRepo,
    /// Declared locally; scanned via uploaded scanner output.
    LocalDeclared,
    /// OCI container image.
    ContainerImage,
    /// Published package artifact.
    PackageArtifact,
}

impl SourceType {
    /// Stable ordinal used in the database.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::ExternalRepo => 0,
            Self::InternalRepo => 1,
            Self::LocalDeclared => 2,
            Self::ContainerImage => 3,
            Self::PackageArtifact => 4,
        }
    }

    /// Inverse of [`SourceType::as_i32`].
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::ExternalRepo),
            1 => Some(Self::InternalRepo),
            2 => Some(Self::LocalDeclared),
            3 => Some(Self::ContainerImage),
            4 => Some(Self::PackageArtifact),
            _ => None,
        }
    }

    /// Label used on metrics.
    pub fn label(self) -> &'static str {
        match self {
            Self::ExternalRepo => "external_repo",
            Self::InternalRepo => "internal_repo",
            Self::LocalDeclared => "local_declared",
            Self::ContainerImage => "container_image",
            Self::PackageArtifact => "package_artifact",
        }
    }
}

/// Lifecycle state of a registered server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    /// Registered, not yet submitted for scanning.
    Draft,
    /// Scan requested, workload not yet launched.
    PendingScan,
    /// Scan workload running.
    Scanning,
    /// Scan finished under the pass threshold.
    ScannedPass,
    /// Scan finished over the pass threshold, or failed outright.
    ScannedFail,
    /// Waiting on an admin decision.
    PendingApproval,
    /// Admin-approved; eligible for proxied traffic.
    Approved,
    /// Admin-denied.
    Denied,
    /// Retired; no further transitions.
    Deprecated,
    /// Temporarily pulled from service by an admin.
    Suspended,
}

impl ServerStatus {
    /// Stable ordinal used in the database.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Draft => 0,
            Self::PendingScan => 1,
            Self::Scanning => 2,
            Self::ScannedPass => 3,
            Self::ScannedFail => 4,
            Self::PendingApproval => 5,
            Self::Approved => 6,
            Self::Denied => 7,
            Self::Deprecated => 8,
            Self::Suspended => 9,
        }
    }

    /// Inverse of [`ServerStatus::as_i32`].
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Draft),
            1 => Some(Self::PendingScan),
            2 => Some(Self::Scanning),
            3 => Some(Self::ScannedPass),
            4 => Some(Self::ScannedFail),
            5 => Some(Self::PendingApproval),
            6 => Some(Self::Approved),
            7 => Some(Self::Denied),
            8 => Some(Self::Deprecated),
            9 => Some(Self::Suspended),
            _ => None,
        }
    }

    /// States from which a new scan may be submitted.
    pub fn can_submit_scan(self) -> bool {
        matches!(
            self,
            Self::Draft | Self::ScannedPass | Self::ScannedFail | Self::Denied
        )
    }

    /// Terminal states accept no further admin transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Deprecated)
    }

    /// Whether `from → to` is a permitted lifecycle transition.
    pub fn transition_permitted(from: Self, to: Self) -> bool {
        match to {
            Self::PendingScan => from.can_submit_scan(),
            Self::Scanning => from == Self::PendingScan,
            Self::ScannedPass | Self::ScannedFail => {
                // Local scan uploads complete without passing through the
                // orchestrator states.
                matches!(from, Self::Scanning | Self::PendingScan) || from.can_submit_scan()
            }
            Self::Approved => matches!(
                from,
                Self::ScannedPass | Self::PendingApproval | Self::ScannedFail | Self::Suspended
            ),
            Self::Denied => !from.is_terminal() && from != Self::Denied,
            Self::Suspended => from == Self::Approved,
            Self::Draft => from == Self::Approved,
            Self::Deprecated => !from.is_terminal(),
            Self::PendingApproval => matches!(from, Self::ScannedPass | Self::ScannedFail),
        }
    }
}

/// A registered MCP server record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    /// Row identifier.
    pub id: Uuid,
    /// Stable human-readable identifier; immutable after creation.
    pub canonical_id: String,
    /// Display name.
    pub name: String,
    /// Free-form description.
    pub description: Option<String>,
    /// Team that owns the server.
    pub owner_team: String,
    /// Provenance of the server's code or artifact.
    pub source_type: SourceType,
    /// Repository or artifact URL when the source is remote.
    pub source_url: Option<String>,
    /// Declared version string.
    pub version: String,
    /// Lifecycle state.
    pub status: ServerStatus,
    /// Tool names the owner claims the server exposes.
    pub declared_tools: Vec<String>,
    /// Opaque transport descriptor for the MCP proxy.
    pub mcp_config: Option<serde_json::Value>,
    /// Optional live endpoint for dynamic scanning.
    pub test_endpoint: Option<String>,
    /// Free-form labels.
    pub tags: Vec<String>,
    /// Subject that registered the server.
    pub created_by: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Most recent scan, if any.
    pub latest_scan_id: Option<Uuid>,
    /// Risk score of the most recent completed scan.
    pub latest_risk_score: Option<f64>,
}

/// Regex a canonical id must satisfy (case-insensitive).
pub const CANONICAL_ID_PATTERN: &str = r"^[a-z0-9][a-z0-9\-_/]*[a-z0-9]$";

/// Validate a canonical id against [`CANONICAL_ID_PATTERN`].
pub fn canonical_id_valid(candidate: &str) -> bool {
    // The pattern is a compile-time constant; construction cannot fail.
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        regex::RegexBuilder::new(CANONICAL_ID_PATTERN)
            .case_insensitive(true)
            .build()
            .expect("canonical id pattern is valid")
    });
    re.is_match(candidate)
}

// ---------------------------------------------------------------------------
// Scan
// ---------------------------------------------------------------------------

/// Lifecycle state of a scan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanStatus {
    /// Recorded, workload not yet launched.
    Pending,
    /// Workload running.
    Running,
    /// Scanner finished and its output was parsed.
    Completed,
    /// Workload or parsing failed.
    Failed,
    /// Explicitly cancelled.
    Cancelled,
    /// Exceeded the scan timeout.
    TimedOut,
}

impl ScanStatus {
    /// Stable ordinal used in the database.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed => 2,
            Self::Failed => 3,
            Self::Cancelled => 4,
            Self::TimedOut => 5,
        }
    }

    /// Inverse of [`ScanStatus::as_i32`].
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Pending),
            1 => Some(Self::Running),
            2 => Some(Self::Completed),
            3 => Some(Self::Failed),
            4 => Some(Self::Cancelled),
            5 => Some(Self::TimedOut),
            _ => None,
        }
    }

    /// Whether the scan has reached a final state.
    ///
    /// `finishedAt` is set exactly when this returns true.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Label used on metrics.
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Severity of a single scanner finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    /// Informational.
    Info,
    /// Worth attention, not blocking.
    Warning,
    /// Likely dangerous.
    Error,
    /// Must not ship.
    Critical,
}

impl IssueSeverity {
    /// Parse a scanner-emitted severity string; unknown values map to info.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "warning" | "warn" => Self::Warning,
            "error" | "high" => Self::Error,
            "critical" => Self::Critical,
            _ => Self::Info,
        }
    }
}

/// One finding reported by the scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanIssue {
    /// Scanner-assigned finding code.
    pub code: String,
    /// Severity classification.
    pub severity: IssueSeverity,
    /// Human-readable description.
    pub message: String,
    /// Tool or file the finding applies to.
    pub affected_entity: Option<String>,
    /// Suggested fix.
    pub remediation: Option<String>,
}

/// Behavioural labels the scanner attaches to a discovered tool.
///
/// Each value is a confidence in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolLabels {
    /// Tool can publish data where outsiders read it.
    pub is_public_sink: f64,
    /// Tool can destroy or mutate state.
    pub destructive: f64,
    /// Tool ingests content from untrusted parties.
    pub untrusted_content: f64,
    /// Tool reads private data.
    pub private_data: f64,
}

/// A tool the scanner observed the server exposing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredTool {
    /// Tool name.
    pub name: String,
    /// Tool description as served.
    pub description: Option<String>,
    /// Hash of the description, for drift detection.
    pub description_hash: Option<String>,
    /// Behavioural labels.
    #[serde(default)]
    pub labels: ToolLabels,
}

/// Record of one security-analysis run over a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scan {
    /// Row identifier.
    pub id: Uuid,
    /// Owning server.
    pub server_id: Uuid,
    /// Version string of the scanner that produced the result.
    pub scanner_version: String,
    /// Lifecycle state.
    pub status: ScanStatus,
    /// Normalized risk score in [0, 1]; higher is more dangerous.
    pub risk_score: Option<f64>,
    /// Scanner summary line.
    pub summary: Option<String>,
    /// Raw scanner output.
    pub report_json: Option<serde_json::Value>,
    /// Parsed findings.
    pub issues: Vec<ScanIssue>,
    /// Tools the scanner observed.
    pub discovered_tools: Vec<DiscoveredTool>,
    /// Workload handle on the scheduler.
    pub job_name: Option<String>,
    /// Failure detail for Failed / TimedOut scans.
    pub error_message: Option<String>,
    /// When the scan was created.
    pub started_at: DateTime<Utc>,
    /// Set exactly when the status is terminal.
    pub finished_at: Option<DateTime<Utc>>,
    /// Subject that requested the scan.
    pub triggered_by: String,
}

// ---------------------------------------------------------------------------
// Approval
// ---------------------------------------------------------------------------

/// Administrative action recorded against a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalAction {
    /// Server approved for traffic.
    Approved,
    /// Server denied.
    Denied,
    /// Server retired.
    Deprecated,
    /// Server temporarily pulled from service.
    Suspended,
    /// Suspension lifted.
    Reinstated,
    /// Approval withdrawn.
    Revoked,
}

impl ApprovalAction {
    /// Stable ordinal used in the database.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Approved => 0,
            Self::Denied => 1,
            Self::Deprecated => 2,
            Self::Suspended => 3,
            Self::Reinstated => 4,
            Self::Revoked => 5,
        }
    }

    /// Inverse of [`ApprovalAction::as_i32`].
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Approved),
            1 => Some(Self::Denied),
            2 => Some(Self::Deprecated),
            3 => Some(Self::Suspended),
            4 => Some(Self::Reinstated),
            5 => Some(Self::Revoked),
            _ => None,
        }
    }
}

/// Append-only record of an admin decision about a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    /// Row identifier.
    pub id: Uuid,
    /// Owning server.
    pub server_id: Uuid,
    /// Canonical id snapshot, kept for audit after server deletion.
    pub server_canonical_id: String,
    /// Admin subject that made the decision.
    pub actor: String,
    /// Decision taken.
    pub action: ApprovalAction,
    /// Required justification.
    pub reason: String,
    /// Additional context (e.g. a scan-failure override justification).
    pub notes: Option<String>,
    /// Decision time.
    pub timestamp: DateTime<Utc>,
    /// Advisory expiry; stored for history, never enforced.
    pub expires_at: Option<DateTime<Utc>>,
    /// Snapshot of the server's latest scan at decision time.
    pub scan_id: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Outcome of one enforcement decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    /// Call permitted.
    Allowed,
    /// Target server missing or not in Approved state.
    DeniedServerNotApproved,
    /// Tool name matched the global denylist or a denied category.
    DeniedToolDenylisted,
    /// Caller's team not authorized for the server.
    DeniedTeamNotAuthorized,
    /// Server risk exceeds the threshold and the caller is not an admin.
    DeniedHighRisk,
    /// Caller exceeded a rate limit.
    DeniedRateLimited,
    /// Request payload exceeded the configured bound.
    DeniedPayloadTooLarge,
    /// Downstream call timed out.
    TimedOut,
    /// Internal error while deciding.
    Error,
}

impl Decision {
    /// Stable ordinal used in the database.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Allowed => 0,
            Self::DeniedServerNotApproved => 1,
            Self::DeniedToolDenylisted => 2,
            Self::DeniedTeamNotAuthorized => 3,
            Self::DeniedHighRisk => 4,
            Self::DeniedRateLimited => 5,
            Self::DeniedPayloadTooLarge => 6,
            Self::TimedOut => 7,
            Self::Error => 8,
        }
    }

    /// Inverse of [`Decision::as_i32`].
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Allowed),
            1 => Some(Self::DeniedServerNotApproved),
            2 => Some(Self::DeniedToolDenylisted),
            3 => Some(Self::DeniedTeamNotAuthorized),
            4 => Some(Self::DeniedHighRisk),
            5 => Some(Self::DeniedRateLimited),
            6 => Some(Self::DeniedPayloadTooLarge),
            7 => Some(Self::TimedOut),
            8 => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether the decision permits the call.
    pub fn is_allow(self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Label used on metrics and API responses.
    pub fn label(self) -> &'static str {
        match self {
            Self::Allowed => "Allowed",
            Self::DeniedServerNotApproved => "DeniedServerNotApproved",
            Self::DeniedToolDenylisted => "DeniedToolDenylisted",
            Self::DeniedTeamNotAuthorized => "DeniedTeamNotAuthorized",
            Self::DeniedHighRisk => "DeniedHighRisk",
            Self::DeniedRateLimited => "DeniedRateLimited",
            Self::DeniedPayloadTooLarge => "DeniedPayloadTooLarge",
            Self::TimedOut => "TimedOut",
            Self::Error => "Error",
        }
    }
}

/// One allow/deny record for a single proxied tool invocation.
///
/// Keyed by the canonical id string, not the server row, so audit history
/// outlives server deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Row identifier.
    pub id: Uuid,
    /// Decision time.
    pub timestamp: DateTime<Utc>,
    /// Caller subject.
    pub actor: String,
    /// Caller email claim.
    pub actor_email: Option<String>,
    /// Caller team claim.
    pub team: Option<String>,
    /// Target server canonical id snapshot.
    pub server_canonical_id: String,
    /// Invoked tool name.
    pub tool_name: String,
    /// Enforcement outcome.
    pub decision: Decision,
    /// Deny reason when present.
    pub reason: Option<String>,
    /// End-to-end decision latency in milliseconds.
    pub latency_ms: f64,
    /// Request body size in bytes.
    pub request_size: i64,
    /// Response body size in bytes, when observable.
    pub response_size: i64,
    /// Propagated trace identifier.
    pub trace_id: Option<String>,
    /// Caller IP when available.
    pub source_ip: Option<String>,
    /// Caller user agent when available.
    pub user_agent: Option<String>,
    /// Risk score of the target server at decision time.
    pub server_risk_score: Option<f64>,
}
