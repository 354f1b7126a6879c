//! Repository abstractions over the four persisted relations.
//!
//! Each entity gets a minimal async trait so the registry, policy engine,
//! and orchestrator can run against Postgres in production and against the
//! in-memory implementations in tests. Compound operations that must update
//! a scan or approval together with its server row live on the scan and
//! approval stores, where a single transaction can cover both tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{Approval, AuditEvent, Decision, Scan, ScanStatus, Server, ServerStatus};

pub mod memory;
pub mod postgres;

pub use memory::{MemoryApprovalStore, MemoryAuditStore, MemoryScanStore, MemoryServerStore, MemoryStores};
pub use postgres::{PgApprovalStore, PgAuditStore, PgScanStore, PgServerStore};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the repositories.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Connection or engine failure; safe to retry.
    #[error("database unavailable: {0}")]
    Unavailable(String),
    /// Uniqueness violation on the named field; not retriable.
    #[error("conflict on {field}")]
    Conflict {
        /// Column that collided.
        field: String,
    },
    /// A stored value could not be decoded into its domain type.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            // 23505 = unique_violation.
            if db.code().as_deref() == Some("23505") {
                let field = if db.message().contains("canonical") {
                    "canonicalId"
                } else {
                    "id"
                };
                return StoreError::Conflict {
                    field: field.to_owned(),
                };
            }
        }
        StoreError::Unavailable(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Compound update payloads
// ---------------------------------------------------------------------------

/// Final fields written when a running scan reaches a terminal state.
///
/// Applied conditionally: the update only lands if the scan is still in one
/// of the expected states, which makes reconciler transitions idempotent
/// across replicas.
#[derive(Debug, Clone)]
pub struct ScanCompletion {
    /// Scan to finalize.
    pub scan_id: Uuid,
    /// Owning server.
    pub server_id: Uuid,
    /// States the scan must currently be in for the update to apply.
    pub expect: Vec<ScanStatus>,
    /// Terminal status to record.
    pub status: ScanStatus,
    /// Normalized risk score, when the scanner produced one.
    pub risk_score: Option<f64>,
    /// Scanner summary.
    pub summary: Option<String>,
    /// Raw scanner output.
    pub report_json: Option<serde_json::Value>,
    /// Parsed findings.
    pub issues: Vec<crate::model::ScanIssue>,
    /// Parsed tool inventory.
    pub discovered_tools: Vec<crate::model::DiscoveredTool>,
    /// Failure detail.
    pub error_message: Option<String>,
    /// Terminal timestamp.
    pub finished_at: DateTime<Utc>,
    /// New server status, when the completion should move the server.
    ///
    /// Explicit cancellation leaves the server untouched.
    pub server_status: Option<ServerStatus>,
}

/// Filter for audit event queries.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Inclusive lower bound on timestamp.
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound on timestamp.
    pub end: Option<DateTime<Utc>>,
    /// Caller team.
    pub team: Option<String>,
    /// Target server canonical id.
    pub server_canonical_id: Option<String>,
    /// Invoked tool name.
    pub tool_name: Option<String>,
    /// Enforcement outcome.
    pub decision: Option<Decision>,
    /// Caller subject.
    pub actor: Option<String>,
}

impl AuditFilter {
    /// Whether an event matches every set dimension of the filter.
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if self.start.is_some_and(|s| event.timestamp < s) {
            return false;
        }
        if self.end.is_some_and(|e| event.timestamp > e) {
            return false;
        }
        if self
            .team
            .as_deref()
            .is_some_and(|t| event.team.as_deref() != Some(t))
        {
            return false;
        }
        if self
            .server_canonical_id
            .as_deref()
            .is_some_and(|s| event.server_canonical_id != s)
        {
            return false;
        }
        if self
            .tool_name
            .as_deref()
            .is_some_and(|t| event.tool_name != t)
        {
            return false;
        }
        if self.decision.is_some_and(|d| event.decision != d) {
            return false;
        }
        if self
            .actor
            .as_deref()
            .is_some_and(|a| event.actor != a)
        {
            return false;
        }
        true
    }
}

/// A page of audit events plus the total match count.
#[derive(Debug, Clone)]
pub struct AuditPage {
    /// Events in the page, newest first.
    pub events: Vec<AuditEvent>,
    /// Total events matching the filter, ignoring pagination.
    pub total: i64,
}

/// Aggregate statistics over a filtered audit window.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditStats {
    /// Total matching events.
    pub total: i64,
    /// Event count per decision label.
    pub by_decision: Vec<(String, i64)>,
    /// Busiest servers, descending.
    pub top_servers: Vec<(String, i64)>,
    /// Busiest teams, descending.
    pub top_teams: Vec<(String, i64)>,
    /// Mean decision latency in milliseconds.
    pub mean_latency_ms: f64,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Repository for server records.
#[async_trait]
pub trait ServerStore: Send + Sync {
    /// Create the relation and indices if they do not exist.
    async fn ensure_schema(&self) -> Result<(), StoreError>;
    /// Insert a new server; duplicate canonical ids yield [`StoreError::Conflict`].
    async fn insert(&self, server: &Server) -> Result<(), StoreError>;
    /// Fetch by row id.
    async fn get(&self, id: Uuid) -> Result<Option<Server>, StoreError>;
    /// Fetch by canonical id (case-insensitive).
    async fn get_by_canonical_id(&self, canonical_id: &str) -> Result<Option<Server>, StoreError>;
    /// All servers, unfiltered.
    async fn list(&self) -> Result<Vec<Server>, StoreError>;
    /// Servers in the given lifecycle state.
    async fn list_by_status(&self, status: ServerStatus) -> Result<Vec<Server>, StoreError>;
    /// Servers owned by the given team.
    async fn list_by_team(&self, team: &str) -> Result<Vec<Server>, StoreError>;
    /// Overwrite a server row.
    async fn update(&self, server: &Server) -> Result<(), StoreError>;
    /// Delete a server; scans and approvals cascade. Returns false if absent.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;
    /// Conditionally move a server between states.
    ///
    /// The transition applies only when the current status is in `from`;
    /// returns whether a row changed. Concurrent mutators therefore observe
    /// a linearizable order on the row.
    async fn transition_status(
        &self,
        id: Uuid,
        from: &[ServerStatus],
        to: ServerStatus,
    ) -> Result<bool, StoreError>;
    /// Number of servers in the given state, for gauge reporting.
    async fn count_by_status(&self, status: ServerStatus) -> Result<i64, StoreError>;
}

/// Repository for scan records.
#[async_trait]
pub trait ScanStore: Send + Sync {
    /// Create the relation and indices if they do not exist.
    async fn ensure_schema(&self) -> Result<(), StoreError>;
    /// Insert a scan row as-is (used for Pending rows).
    async fn insert(&self, scan: &Scan) -> Result<(), StoreError>;
    /// Fetch by row id.
    async fn get(&self, id: Uuid) -> Result<Option<Scan>, StoreError>;
    /// All scans for a server, newest first.
    async fn list_for_server(&self, server_id: Uuid) -> Result<Vec<Scan>, StoreError>;
    /// Scans currently in the given state.
    async fn list_by_status(&self, status: ScanStatus) -> Result<Vec<Scan>, StoreError>;
    /// Most recent scan for a server.
    async fn latest_for_server(&self, server_id: Uuid) -> Result<Option<Scan>, StoreError>;
    /// Mark a Pending scan Running and its server Scanning, in one
    /// transaction. Returns false when the scan already left Pending.
    async fn mark_running(
        &self,
        scan_id: Uuid,
        server_id: Uuid,
        job_name: &str,
    ) -> Result<bool, StoreError>;
    /// Finalize a scan and update its server row in one transaction.
    ///
    /// When `completion.server_status` is set, the server's status,
    /// `latest_scan_id`, `latest_risk_score`, and `updated_at` move with the
    /// scan; otherwise only the scan row changes. Returns false when the
    /// conditional state check failed (another writer got there first).
    async fn record_completion(&self, completion: &ScanCompletion) -> Result<bool, StoreError>;
    /// Insert an already-terminal scan and update the server row in one
    /// transaction (local scan uploads).
    async fn insert_completed(
        &self,
        scan: &Scan,
        server_status: ServerStatus,
    ) -> Result<(), StoreError>;
}

/// Repository for approval records.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Create the relation and indices if they do not exist.
    async fn ensure_schema(&self) -> Result<(), StoreError>;
    /// Append an approval and move the server to its new status, atomically.
    async fn record_decision(
        &self,
        approval: &Approval,
        new_server_status: ServerStatus,
    ) -> Result<(), StoreError>;
    /// Approval history for a server, newest first.
    async fn list_for_server(&self, server_id: Uuid) -> Result<Vec<Approval>, StoreError>;
}

/// Repository for audit events.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Create the relation and indices if they do not exist.
    async fn ensure_schema(&self) -> Result<(), StoreError>;
    /// Append one event.
    async fn insert(&self, event: &AuditEvent) -> Result<(), StoreError>;
    /// Filtered query with server-side pagination, newest first.
    async fn query(
        &self,
        filter: &AuditFilter,
        limit: i64,
        offset: i64,
    ) -> Result<AuditPage, StoreError>;
    /// Aggregate statistics over a filter window.
    async fn stats(&self, filter: &AuditFilter) -> Result<AuditStats, StoreError>;
}
