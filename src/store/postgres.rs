//! Postgres-backed repositories.
//!
//! Runtime sqlx queries over a shared [`PgPool`]. Schema bootstrap is
//! idempotent (`CREATE TABLE IF NOT EXISTS` plus index creation); compound
//! updates run in a single transaction so the server row can never disagree
//! with its latest scan or approval.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::model::{
    Approval, ApprovalAction, AuditEvent, Decision, DiscoveredTool, Scan, ScanIssue, ScanStatus,
    Server, ServerStatus, SourceType,
};

use super::{
    ApprovalStore, AuditFilter, AuditPage, AuditStats, AuditStore, ScanCompletion, ScanStore,
    ServerStore, StoreError,
};

/// How many entries the stats aggregations return per dimension.
const TOP_N: i64 = 10;

fn corrupt(what: &str) -> StoreError {
    StoreError::Corrupt(what.to_owned())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

// ---------------------------------------------------------------------------
// Servers
// ---------------------------------------------------------------------------

/// Server repository over Postgres.
#[derive(Debug, Clone)]
pub struct PgServerStore {
    pool: PgPool,
}

impl PgServerStore {
    /// Wrap a shared connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn server_from_row(row: &PgRow) -> Result<Server, StoreError> {
    Ok(Server {
        id: row.try_get("id")?,
        canonical_id: row.try_get("canonical_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        owner_team: row.try_get("owner_team")?,
        source_type: SourceType::from_i32(row.try_get("source_type")?)
            .ok_or_else(|| corrupt("server.source_type"))?,
        source_url: row.try_get("source_url")?,
        version: row.try_get("version")?,
        status: ServerStatus::from_i32(row.try_get("status")?)
            .ok_or_else(|| corrupt("server.status"))?,
        declared_tools: from_json(row.try_get("declared_tools")?)?,
        mcp_config: row.try_get("mcp_config")?,
        test_endpoint: row.try_get("test_endpoint")?,
        tags: from_json(row.try_get("tags")?)?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        latest_scan_id: row.try_get("latest_scan_id")?,
        latest_risk_score: row.try_get("latest_risk_score")?,
    })
}

const SERVER_COLUMNS: &str = "id, canonical_id, name, description, owner_team, source_type, \
     source_url, version, status, declared_tools, mcp_config, test_endpoint, tags, created_by, \
     created_at, updated_at, latest_scan_id, latest_risk_score";

#[async_trait]
impl ServerStore for PgServerStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS servers (
                id UUID PRIMARY KEY,
                canonical_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                owner_team TEXT NOT NULL,
                source_type INTEGER NOT NULL,
                source_url TEXT,
                version TEXT NOT NULL,
                status INTEGER NOT NULL,
                declared_tools JSONB NOT NULL DEFAULT '[]',
                mcp_config JSONB,
                test_endpoint TEXT,
                tags JSONB NOT NULL DEFAULT '[]',
                created_by TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                latest_scan_id UUID,
                latest_risk_score DOUBLE PRECISION
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS servers_canonical_id_key \
             ON servers (LOWER(canonical_id))",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS servers_status_idx ON servers (status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS servers_owner_team_idx ON servers (owner_team)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert(&self, server: &Server) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO servers (id, canonical_id, name, description, owner_team, source_type, \
             source_url, version, status, declared_tools, mcp_config, test_endpoint, tags, \
             created_by, created_at, updated_at, latest_scan_id, latest_risk_score) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
        )
        .bind(server.id)
        .bind(&server.canonical_id)
        .bind(&server.name)
        .bind(&server.description)
        .bind(&server.owner_team)
        .bind(server.source_type.as_i32())
        .bind(&server.source_url)
        .bind(&server.version)
        .bind(server.status.as_i32())
        .bind(to_json(&server.declared_tools)?)
        .bind(&server.mcp_config)
        .bind(&server.test_endpoint)
        .bind(to_json(&server.tags)?)
        .bind(&server.created_by)
        .bind(server.created_at)
        .bind(server.updated_at)
        .bind(server.latest_scan_id)
        .bind(server.latest_risk_score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Server>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SERVER_COLUMNS} FROM servers WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(server_from_row).transpose()
    }

    async fn get_by_canonical_id(&self, canonical_id: &str) -> Result<Option<Server>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SERVER_COLUMNS} FROM servers WHERE LOWER(canonical_id) = LOWER($1)"
        ))
        .bind(canonical_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(server_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<Server>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SERVER_COLUMNS} FROM servers ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(server_from_row).collect()
    }

    async fn list_by_status(&self, status: ServerStatus) -> Result<Vec<Server>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SERVER_COLUMNS} FROM servers WHERE status = $1 ORDER BY created_at DESC"
        ))
        .bind(status.as_i32())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(server_from_row).collect()
    }

    async fn list_by_team(&self, team: &str) -> Result<Vec<Server>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SERVER_COLUMNS} FROM servers WHERE owner_team = $1 ORDER BY created_at DESC"
        ))
        .bind(team)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(server_from_row).collect()
    }

    async fn update(&self, server: &Server) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE servers SET name = $2, description = $3, owner_team = $4, source_type = $5, \
             source_url = $6, version = $7, status = $8, declared_tools = $9, mcp_config = $10, \
             test_endpoint = $11, tags = $12, updated_at = $13, latest_scan_id = $14, \
             latest_risk_score = $15 WHERE id = $1",
        )
        .bind(server.id)
        .bind(&server.name)
        .bind(&server.description)
        .bind(&server.owner_team)
        .bind(server.source_type.as_i32())
        .bind(&server.source_url)
        .bind(&server.version)
        .bind(server.status.as_i32())
        .bind(to_json(&server.declared_tools)?)
        .bind(&server.mcp_config)
        .bind(&server.test_endpoint)
        .bind(to_json(&server.tags)?)
        .bind(server.updated_at)
        .bind(server.latest_scan_id)
        .bind(server.latest_risk_score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM servers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: &[ServerStatus],
        to: ServerStatus,
    ) -> Result<bool, StoreError> {
        let from: Vec<i32> = from.iter().map(|s| s.as_i32()).collect();
        let result = sqlx::query(
            "UPDATE servers SET status = $2, updated_at = $3 \
             WHERE id = $1 AND status = ANY($4)",
        )
        .bind(id)
        .bind(to.as_i32())
        .bind(Utc::now())
        .bind(from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_by_status(&self, status: ServerStatus) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM servers WHERE status = $1")
            .bind(status.as_i32())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

// ---------------------------------------------------------------------------
// Scans
// ---------------------------------------------------------------------------

/// Scan repository over Postgres.
#[derive(Debug, Clone)]
pub struct PgScanStore {
    pool: PgPool,
}

impl PgScanStore {
    /// Wrap a shared connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn scan_from_row(row: &PgRow) -> Result<Scan, StoreError> {
    let issues: Vec<ScanIssue> = from_json(row.try_get("issues")?)?;
    let discovered_tools: Vec<DiscoveredTool> = from_json(row.try_get("discovered_tools")?)?;
    Ok(Scan {
        id: row.try_get("id")?,
        server_id: row.try_get("server_id")?,
        scanner_version: row.try_get("scanner_version")?,
        status: ScanStatus::from_i32(row.try_get("status")?)
            .ok_or_else(|| corrupt("scan.status"))?,
        risk_score: row.try_get("risk_score")?,
        summary: row.try_get("summary")?,
        report_json: row.try_get("report_json")?,
        issues,
        discovered_tools,
        job_name: row.try_get("job_name")?,
        error_message: row.try_get("error_message")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        triggered_by: row.try_get("triggered_by")?,
    })
}

const SCAN_COLUMNS: &str = "id, server_id, scanner_version, status, risk_score, summary, \
     report_json, issues, discovered_tools, job_name, error_message, started_at, finished_at, \
     triggered_by";

async fn insert_scan_tx(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    scan: &Scan,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO scans (id, server_id, scanner_version, status, risk_score, summary, \
         report_json, issues, discovered_tools, job_name, error_message, started_at, \
         finished_at, triggered_by) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
    )
    .bind(scan.id)
    .bind(scan.server_id)
    .bind(&scan.scanner_version)
    .bind(scan.status.as_i32())
    .bind(scan.risk_score)
    .bind(&scan.summary)
    .bind(&scan.report_json)
    .bind(to_json(&scan.issues)?)
    .bind(to_json(&scan.discovered_tools)?)
    .bind(&scan.job_name)
    .bind(&scan.error_message)
    .bind(scan.started_at)
    .bind(scan.finished_at)
    .bind(&scan.triggered_by)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn update_server_scan_pointer_tx(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    server_id: Uuid,
    status: ServerStatus,
    scan_id: Uuid,
    risk_score: Option<f64>,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE servers SET status = $2, latest_scan_id = $3, latest_risk_score = $4, \
         updated_at = $5 WHERE id = $1",
    )
    .bind(server_id)
    .bind(status.as_i32())
    .bind(scan_id)
    .bind(risk_score)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl ScanStore for PgScanStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS scans (
                id UUID PRIMARY KEY,
                server_id UUID NOT NULL REFERENCES servers (id) ON DELETE CASCADE,
                scanner_version TEXT NOT NULL,
                status INTEGER NOT NULL,
                risk_score DOUBLE PRECISION,
                summary TEXT,
                report_json JSONB,
                issues JSONB NOT NULL DEFAULT '[]',
                discovered_tools JSONB NOT NULL DEFAULT '[]',
                job_name TEXT,
                error_message TEXT,
                started_at TIMESTAMPTZ NOT NULL,
                finished_at TIMESTAMPTZ,
                triggered_by TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS scans_server_id_idx ON scans (server_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS scans_status_idx ON scans (status)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS scans_started_at_idx ON scans (started_at DESC)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert(&self, scan: &Scan) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        insert_scan_tx(&mut tx, scan).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Scan>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SCAN_COLUMNS} FROM scans WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(scan_from_row).transpose()
    }

    async fn list_for_server(&self, server_id: Uuid) -> Result<Vec<Scan>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SCAN_COLUMNS} FROM scans WHERE server_id = $1 ORDER BY started_at DESC"
        ))
        .bind(server_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(scan_from_row).collect()
    }

    async fn list_by_status(&self, status: ScanStatus) -> Result<Vec<Scan>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SCAN_COLUMNS} FROM scans WHERE status = $1 ORDER BY started_at ASC"
        ))
        .bind(status.as_i32())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(scan_from_row).collect()
    }

    async fn latest_for_server(&self, server_id: Uuid) -> Result<Option<Scan>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SCAN_COLUMNS} FROM scans WHERE server_id = $1 \
             ORDER BY started_at DESC LIMIT 1"
        ))
        .bind(server_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(scan_from_row).transpose()
    }

    async fn mark_running(
        &self,
        scan_id: Uuid,
        server_id: Uuid,
        job_name: &str,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE scans SET status = $2, job_name = $3 WHERE id = $1 AND status = $4",
        )
        .bind(scan_id)
        .bind(ScanStatus::Running.as_i32())
        .bind(job_name)
        .bind(ScanStatus::Pending.as_i32())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        sqlx::query("UPDATE servers SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(server_id)
            .bind(ServerStatus::Scanning.as_i32())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn record_completion(&self, completion: &ScanCompletion) -> Result<bool, StoreError> {
        let expect: Vec<i32> = completion.expect.iter().map(|s| s.as_i32()).collect();
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE scans SET status = $2, risk_score = $3, summary = $4, report_json = $5, \
             issues = $6, discovered_tools = $7, error_message = $8, finished_at = $9 \
             WHERE id = $1 AND status = ANY($10)",
        )
        .bind(completion.scan_id)
        .bind(completion.status.as_i32())
        .bind(completion.risk_score)
        .bind(&completion.summary)
        .bind(&completion.report_json)
        .bind(to_json(&completion.issues)?)
        .bind(to_json(&completion.discovered_tools)?)
        .bind(&completion.error_message)
        .bind(completion.finished_at)
        .bind(expect)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        if let Some(server_status) = completion.server_status {
            update_server_scan_pointer_tx(
                &mut tx,
                completion.server_id,
                server_status,
                completion.scan_id,
                completion.risk_score,
            )
            .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn insert_completed(
        &self,
        scan: &Scan,
        server_status: ServerStatus,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        insert_scan_tx(&mut tx, scan).await?;
        update_server_scan_pointer_tx(&mut tx, scan.server_id, server_status, scan.id, scan.risk_score)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

/// Approval repository over Postgres.
#[derive(Debug, Clone)]
pub struct PgApprovalStore {
    pool: PgPool,
}

impl PgApprovalStore {
    /// Wrap a shared connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn approval_from_row(row: &PgRow) -> Result<Approval, StoreError> {
    Ok(Approval {
        id: row.try_get("id")?,
        server_id: row.try_get("server_id")?,
        server_canonical_id: row.try_get("server_canonical_id")?,
        actor: row.try_get("actor")?,
        action: ApprovalAction::from_i32(row.try_get("action")?)
            .ok_or_else(|| corrupt("approval.action"))?,
        reason: row.try_get("reason")?,
        notes: row.try_get("notes")?,
        timestamp: row.try_get("timestamp")?,
        expires_at: row.try_get("expires_at")?,
        scan_id: row.try_get("scan_id")?,
    })
}

#[async_trait]
impl ApprovalStore for PgApprovalStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS approvals (
                id UUID PRIMARY KEY,
                server_id UUID NOT NULL REFERENCES servers (id) ON DELETE CASCADE,
                server_canonical_id TEXT NOT NULL,
                actor TEXT NOT NULL,
                action INTEGER NOT NULL,
                reason TEXT NOT NULL,
                notes TEXT,
                timestamp TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ,
                scan_id UUID
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS approvals_server_id_idx ON approvals (server_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS approvals_timestamp_idx ON approvals (timestamp DESC)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_decision(
        &self,
        approval: &Approval,
        new_server_status: ServerStatus,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO approvals (id, server_id, server_canonical_id, actor, action, reason, \
             notes, timestamp, expires_at, scan_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(approval.id)
        .bind(approval.server_id)
        .bind(&approval.server_canonical_id)
        .bind(&approval.actor)
        .bind(approval.action.as_i32())
        .bind(&approval.reason)
        .bind(&approval.notes)
        .bind(approval.timestamp)
        .bind(approval.expires_at)
        .bind(approval.scan_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE servers SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(approval.server_id)
            .bind(new_server_status.as_i32())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_for_server(&self, server_id: Uuid) -> Result<Vec<Approval>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, server_id, server_canonical_id, actor, action, reason, notes, \
             timestamp, expires_at, scan_id FROM approvals WHERE server_id = $1 \
             ORDER BY timestamp DESC",
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(approval_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Audit events
// ---------------------------------------------------------------------------

/// Audit repository over Postgres.
#[derive(Debug, Clone)]
pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    /// Wrap a shared connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn audit_from_row(row: &PgRow) -> Result<AuditEvent, StoreError> {
    Ok(AuditEvent {
        id: row.try_get("id")?,
        timestamp: row.try_get("timestamp")?,
        actor: row.try_get("actor")?,
        actor_email: row.try_get("actor_email")?,
        team: row.try_get("team")?,
        server_canonical_id: row.try_get("server_canonical_id")?,
        tool_name: row.try_get("tool_name")?,
        decision: Decision::from_i32(row.try_get("decision")?)
            .ok_or_else(|| corrupt("audit.decision"))?,
        reason: row.try_get("reason")?,
        latency_ms: row.try_get("latency_ms")?,
        request_size: row.try_get("request_size")?,
        response_size: row.try_get("response_size")?,
        trace_id: row.try_get("trace_id")?,
        source_ip: row.try_get("source_ip")?,
        user_agent: row.try_get("user_agent")?,
        server_risk_score: row.try_get("server_risk_score")?,
    })
}

/// Append the filter's conditions to a builder that already ends in `WHERE 1=1`.
fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &AuditFilter) {
    if let Some(start) = filter.start {
        builder.push(" AND timestamp >= ").push_bind(start);
    }
    if let Some(end) = filter.end {
        builder.push(" AND timestamp <= ").push_bind(end);
    }
    if let Some(team) = filter.team.clone() {
        builder.push(" AND team = ").push_bind(team);
    }
    if let Some(server) = filter.server_canonical_id.clone() {
        builder
            .push(" AND server_canonical_id = ")
            .push_bind(server);
    }
    if let Some(tool) = filter.tool_name.clone() {
        builder.push(" AND tool_name = ").push_bind(tool);
    }
    if let Some(decision) = filter.decision {
        builder.push(" AND decision = ").push_bind(decision.as_i32());
    }
    if let Some(actor) = filter.actor.clone() {
        builder.push(" AND actor = ").push_bind(actor);
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS audit_events (
                id UUID PRIMARY KEY,
                timestamp TIMESTAMPTZ NOT NULL,
                actor TEXT NOT NULL,
                actor_email TEXT,
                team TEXT,
                server_canonical_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                decision INTEGER NOT NULL,
                reason TEXT,
                latency_ms DOUBLE PRECISION NOT NULL,
                request_size BIGINT NOT NULL,
                response_size BIGINT NOT NULL,
                trace_id TEXT,
                source_ip TEXT,
                user_agent TEXT,
                server_risk_score DOUBLE PRECISION
            )",
        )
        .execute(&self.pool)
        .await?;
        for statement in [
            "CREATE INDEX IF NOT EXISTS audit_timestamp_idx ON audit_events (timestamp DESC)",
            "CREATE INDEX IF NOT EXISTS audit_actor_idx ON audit_events (actor)",
            "CREATE INDEX IF NOT EXISTS audit_team_idx ON audit_events (team)",
            "CREATE INDEX IF NOT EXISTS audit_server_idx ON audit_events (server_canonical_id)",
            "CREATE INDEX IF NOT EXISTS audit_decision_idx ON audit_events (decision)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn insert(&self, event: &AuditEvent) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO audit_events (id, timestamp, actor, actor_email, team, \
             server_canonical_id, tool_name, decision, reason, latency_ms, request_size, \
             response_size, trace_id, source_ip, user_agent, server_risk_score) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(event.id)
        .bind(event.timestamp)
        .bind(&event.actor)
        .bind(&event.actor_email)
        .bind(&event.team)
        .bind(&event.server_canonical_id)
        .bind(&event.tool_name)
        .bind(event.decision.as_i32())
        .bind(&event.reason)
        .bind(event.latency_ms)
        .bind(event.request_size)
        .bind(event.response_size)
        .bind(&event.trace_id)
        .bind(&event.source_ip)
        .bind(&event.user_agent)
        .bind(event.server_risk_score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query(
        &self,
        filter: &AuditFilter,
        limit: i64,
        offset: i64,
    ) -> Result<AuditPage, StoreError> {
        let mut count = QueryBuilder::new("SELECT COUNT(*) AS n FROM audit_events WHERE 1=1");
        push_filter(&mut count, filter);
        let total: i64 = count.build().fetch_one(&self.pool).await?.try_get("n")?;

        let mut query = QueryBuilder::new(
            "SELECT id, timestamp, actor, actor_email, team, server_canonical_id, tool_name, \
             decision, reason, latency_ms, request_size, response_size, trace_id, source_ip, \
             user_agent, server_risk_score FROM audit_events WHERE 1=1",
        );
        push_filter(&mut query, filter);
        query.push(" ORDER BY timestamp DESC LIMIT ");
        query.push_bind(limit);
        query.push(" OFFSET ");
        query.push_bind(offset);
        let rows = query.build().fetch_all(&self.pool).await?;
        let events = rows
            .iter()
            .map(audit_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AuditPage { events, total })
    }

    async fn stats(&self, filter: &AuditFilter) -> Result<AuditStats, StoreError> {
        let mut totals = QueryBuilder::new(
            "SELECT COUNT(*) AS n, COALESCE(AVG(latency_ms), 0) AS mean_latency \
             FROM audit_events WHERE 1=1",
        );
        push_filter(&mut totals, filter);
        let row = totals.build().fetch_one(&self.pool).await?;
        let total: i64 = row.try_get("n")?;
        let mean_latency_ms: f64 = row.try_get("mean_latency")?;

        let mut by_decision_q = QueryBuilder::new(
            "SELECT decision, COUNT(*) AS n FROM audit_events WHERE 1=1",
        );
        push_filter(&mut by_decision_q, filter);
        by_decision_q.push(" GROUP BY decision ORDER BY n DESC");
        let mut by_decision = Vec::new();
        for row in by_decision_q.build().fetch_all(&self.pool).await? {
            let ordinal: i32 = row.try_get("decision")?;
            let decision =
                Decision::from_i32(ordinal).ok_or_else(|| corrupt("audit.decision"))?;
            by_decision.push((decision.label().to_owned(), row.try_get("n")?));
        }

        let mut top_servers_q = QueryBuilder::new(
            "SELECT server_canonical_id, COUNT(*) AS n FROM audit_events WHERE 1=1",
        );
        push_filter(&mut top_servers_q, filter);
        top_servers_q.push(" GROUP BY server_canonical_id ORDER BY n DESC LIMIT ");
        top_servers_q.push_bind(TOP_N);
        let mut top_servers = Vec::new();
        for row in top_servers_q.build().fetch_all(&self.pool).await? {
            top_servers.push((row.try_get("server_canonical_id")?, row.try_get("n")?));
        }

        let mut top_teams_q = QueryBuilder::new(
            "SELECT team, COUNT(*) AS n FROM audit_events WHERE team IS NOT NULL",
        );
        push_filter(&mut top_teams_q, filter);
        top_teams_q.push(" GROUP BY team ORDER BY n DESC LIMIT ");
        top_teams_q.push_bind(TOP_N);
        let mut top_teams = Vec::new();
        for row in top_teams_q.build().fetch_all(&self.pool).await? {
            top_teams.push((row.try_get("team")?, row.try_get("n")?));
        }

        Ok(AuditStats {
            total,
            by_decision,
            top_servers,
            top_teams,
            mean_latency_ms,
        })
    }
}
