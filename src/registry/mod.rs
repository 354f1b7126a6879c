//! Registry service: server lifecycle operations with per-op authorization.
//!
//! Every operation takes the authenticated principal and enforces the access
//! predicate before touching state. Mutations are written through the
//! conditional store primitives, so concurrent callers observe a
//! linearizable order per server row and invalid transitions surface as
//! InvalidState rather than lost updates.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::metrics::Metrics;
use crate::model::{
    canonical_id_valid, Approval, ApprovalAction, Principal, Scan, ScanStatus, Server,
    ServerStatus, SourceType,
};
use crate::scan::parse::parse_scan_output;
use crate::scan::ScanOrchestrator;
use crate::store::{ApprovalStore, ScanStore, ServerStore};

/// Payload for registering a new server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    /// Desired canonical id; immutable afterwards.
    pub canonical_id: String,
    /// Display name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Owning team.
    pub owner_team: String,
    /// Provenance of the server.
    pub source_type: SourceType,
    /// Repository or artifact URL.
    #[serde(default)]
    pub source_url: Option<String>,
    /// Declared version.
    pub version: String,
    /// Tools the owner claims the server exposes.
    #[serde(default)]
    pub declared_tools: Vec<String>,
    /// Opaque transport descriptor.
    #[serde(default)]
    pub mcp_config: Option<serde_json::Value>,
    /// Endpoint for dynamic testing.
    #[serde(default)]
    pub test_endpoint: Option<String>,
    /// Free-form labels.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Payload for updating a server. Unset fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    /// Rejected when it differs from the stored value.
    #[serde(default)]
    pub canonical_id: Option<String>,
    /// New display name.
    #[serde(default)]
    pub name: Option<String>,
    /// New description.
    #[serde(default)]
    pub description: Option<String>,
    /// New owning team.
    #[serde(default)]
    pub owner_team: Option<String>,
    /// New source URL (material).
    #[serde(default)]
    pub source_url: Option<String>,
    /// New version (material).
    #[serde(default)]
    pub version: Option<String>,
    /// New declared tool list (material).
    #[serde(default)]
    pub declared_tools: Option<Vec<String>>,
    /// New transport descriptor (material).
    #[serde(default)]
    pub mcp_config: Option<serde_json::Value>,
    /// New dynamic-testing endpoint.
    #[serde(default)]
    pub test_endpoint: Option<String>,
    /// New labels.
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

/// Payload for approve / deny / suspend / reinstate.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRequest {
    /// Required justification.
    #[serde(default)]
    pub reason: String,
    /// Optional free-form notes.
    #[serde(default)]
    pub notes: Option<String>,
    /// Required to approve a server whose latest scan failed.
    #[serde(default)]
    pub override_reason: Option<String>,
    /// Advisory expiry recorded with the approval.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Payload for uploading a locally produced scan result.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalScanUpload {
    /// Raw scanner JSON output.
    pub scan_output: String,
    /// Version of the scanner that produced it.
    #[serde(default = "default_scan_version")]
    pub scan_version: String,
    /// When the scan ran, if the uploader knows.
    #[serde(default)]
    pub scanned_at: Option<DateTime<Utc>>,
}

fn default_scan_version() -> String {
    "unknown".to_owned()
}

/// Server lifecycle service.
pub struct RegistryService {
    servers: Arc<dyn ServerStore>,
    scans: Arc<dyn ScanStore>,
    approvals: Arc<dyn ApprovalStore>,
    orchestrator: Arc<ScanOrchestrator>,
    scan_pass_threshold: f64,
    metrics: Arc<Metrics>,
}

impl RegistryService {
    /// Wire the service over its stores and the scan orchestrator.
    pub fn new(
        servers: Arc<dyn ServerStore>,
        scans: Arc<dyn ScanStore>,
        approvals: Arc<dyn ApprovalStore>,
        orchestrator: Arc<ScanOrchestrator>,
        scan_pass_threshold: f64,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            servers,
            scans,
            approvals,
            orchestrator,
            scan_pass_threshold,
            metrics,
        }
    }

    fn require_subject(principal: &Principal) -> Result<(), GatewayError> {
        if principal.id.is_empty() || principal.id == "anonymous" {
            return Err(GatewayError::Unauthenticated(
                "operation requires an authenticated principal".to_owned(),
            ));
        }
        Ok(())
    }

    fn require_admin(principal: &Principal) -> Result<(), GatewayError> {
        Self::require_subject(principal)?;
        if !principal.is_admin() {
            return Err(GatewayError::Forbidden(
                "operation requires the admin role".to_owned(),
            ));
        }
        Ok(())
    }

    fn require_access(principal: &Principal, server: &Server) -> Result<(), GatewayError> {
        if !principal.can_access(server) {
            return Err(GatewayError::Forbidden(format!(
                "principal {} may not access server {}",
                principal.id, server.canonical_id
            )));
        }
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Server, GatewayError> {
        self.servers.get(id).await?.ok_or(GatewayError::NotFound)
    }

    /// Register a new server in Draft.
    pub async fn register(
        &self,
        principal: &Principal,
        req: RegisterRequest,
    ) -> Result<Server, GatewayError> {
        Self::require_subject(principal)?;
        if !canonical_id_valid(&req.canonical_id) {
            return Err(GatewayError::InvalidArgument(format!(
                "canonical id {:?} does not match the required pattern",
                req.canonical_id
            )));
        }
        for (field, value) in [
            ("name", &req.name),
            ("ownerTeam", &req.owner_team),
            ("version", &req.version),
        ] {
            if value.trim().is_empty() {
                return Err(GatewayError::InvalidArgument(format!(
                    "{field} must not be empty"
                )));
            }
        }

        let now = Utc::now();
        let server = Server {
            id: Uuid::new_v4(),
            canonical_id: req.canonical_id,
            name: req.name,
            description: req.description,
            owner_team: req.owner_team,
            source_type: req.source_type,
            source_url: req.source_url,
            version: req.version,
            status: ServerStatus::Draft,
            declared_tools: req.declared_tools,
            mcp_config: req.mcp_config,
            test_endpoint: req.test_endpoint,
            tags: req.tags,
            created_by: principal.id.clone(),
            created_at: now,
            updated_at: now,
            latest_scan_id: None,
            latest_risk_score: None,
        };
        self.servers.insert(&server).await.map_err(|e| {
            if let crate::store::StoreError::Conflict { .. } = e {
                GatewayError::Conflict(format!(
                    "canonical id {} is already registered",
                    server.canonical_id
                ))
            } else {
                e.into()
            }
        })?;
        self.metrics
            .server_registered(server.source_type, server.status);
        info!(
            server = %server.canonical_id,
            owner_team = %server.owner_team,
            created_by = %principal.id,
            "server registered"
        );
        Ok(server)
    }

    /// Fetch a server by id; `None` when the id is unknown.
    pub async fn get(
        &self,
        principal: &Principal,
        id: Uuid,
    ) -> Result<Option<Server>, GatewayError> {
        let Some(server) = self.servers.get(id).await? else {
            return Ok(None);
        };
        Self::require_access(principal, &server)?;
        Ok(Some(server))
    }

    /// Fetch a server by canonical id; `None` when unknown.
    pub async fn get_by_canonical_id(
        &self,
        principal: &Principal,
        canonical_id: &str,
    ) -> Result<Option<Server>, GatewayError> {
        let Some(server) = self.servers.get_by_canonical_id(canonical_id).await? else {
            return Ok(None);
        };
        Self::require_access(principal, &server)?;
        Ok(Some(server))
    }

    /// List the servers the principal can access, with optional status and
    /// owner-team filters.
    pub async fn list(
        &self,
        principal: &Principal,
        status: Option<ServerStatus>,
        owner_team: Option<&str>,
    ) -> Result<Vec<Server>, GatewayError> {
        let all = match (status, owner_team) {
            (Some(status), _) => self.servers.list_by_status(status).await?,
            (None, Some(team)) => self.servers.list_by_team(team).await?,
            (None, None) => self.servers.list().await?,
        };
        Ok(all
            .into_iter()
            .filter(|s| principal.can_access(s))
            .filter(|s| owner_team.is_none_or(|team| s.owner_team == team))
            .collect())
    }

    /// Update mutable server fields.
    ///
    /// A material change (version, source URL, declared tools, transport
    /// config) on an Approved server forces it back to Draft for re-scan.
    pub async fn update(
        &self,
        principal: &Principal,
        id: Uuid,
        req: UpdateRequest,
    ) -> Result<Server, GatewayError> {
        Self::require_subject(principal)?;
        let mut server = self.load(id).await?;
        Self::require_access(principal, &server)?;

        if let Some(requested) = &req.canonical_id {
            if !requested.eq_ignore_ascii_case(&server.canonical_id) {
                return Err(GatewayError::InvalidArgument(
                    "canonical id is immutable".to_owned(),
                ));
            }
        }

        let was_approved = server.status == ServerStatus::Approved;
        let mut material_change = false;

        if let Some(name) = req.name {
            server.name = name;
        }
        if let Some(description) = req.description {
            server.description = Some(description);
        }
        if let Some(owner_team) = req.owner_team {
            server.owner_team = owner_team;
        }
        if let Some(source_url) = req.source_url {
            if server.source_url.as_deref() != Some(source_url.as_str()) {
                material_change = true;
            }
            server.source_url = Some(source_url);
        }
        if let Some(version) = req.version {
            if server.version != version {
                material_change = true;
            }
            server.version = version;
        }
        if let Some(declared_tools) = req.declared_tools {
            if server.declared_tools != declared_tools {
                material_change = true;
            }
            server.declared_tools = declared_tools;
        }
        if let Some(mcp_config) = req.mcp_config {
            if server.mcp_config.as_ref() != Some(&mcp_config) {
                material_change = true;
            }
            server.mcp_config = Some(mcp_config);
        }
        if let Some(test_endpoint) = req.test_endpoint {
            server.test_endpoint = Some(test_endpoint);
        }
        if let Some(tags) = req.tags {
            server.tags = tags;
        }

        if was_approved && material_change {
            server.status = ServerStatus::Draft;
            info!(
                server = %server.canonical_id,
                "material change on approved server, returning to Draft"
            );
        }
        server.updated_at = Utc::now();
        self.servers.update(&server).await?;
        Ok(server)
    }

    /// Delete a server, cascading to its scans and approvals.
    pub async fn delete(&self, principal: &Principal, id: Uuid) -> Result<(), GatewayError> {
        Self::require_subject(principal)?;
        let server = self.load(id).await?;
        Self::require_access(principal, &server)?;
        self.servers.delete(id).await?;
        info!(server = %server.canonical_id, deleted_by = %principal.id, "server deleted");
        Ok(())
    }

    /// Submit a server for scanning.
    ///
    /// Exactly one of several concurrent submitters wins the PendingScan
    /// transition; the rest observe InvalidState.
    pub async fn submit_for_scan(
        &self,
        principal: &Principal,
        id: Uuid,
    ) -> Result<Scan, GatewayError> {
        Self::require_subject(principal)?;
        let server = self.load(id).await?;
        Self::require_access(principal, &server)?;
        if server.source_type == SourceType::LocalDeclared {
            return Err(GatewayError::InvalidArgument(
                "local-declared servers are scanned via upload".to_owned(),
            ));
        }

        let transitioned = self
            .servers
            .transition_status(
                id,
                &[
                    ServerStatus::Draft,
                    ServerStatus::ScannedPass,
                    ServerStatus::ScannedFail,
                    ServerStatus::Denied,
                ],
                ServerStatus::PendingScan,
            )
            .await?;
        if !transitioned {
            return Err(GatewayError::InvalidState(format!(
                "server cannot be scanned from {:?}",
                server.status
            )));
        }

        let server = self.load(id).await?;
        self.orchestrator.launch(&server, &principal.id).await
    }

    /// Upload a locally produced scan for a LocalDeclared server.
    pub async fn upload_local_scan(
        &self,
        principal: &Principal,
        id: Uuid,
        payload: LocalScanUpload,
    ) -> Result<Scan, GatewayError> {
        Self::require_subject(principal)?;
        let server = self.load(id).await?;
        Self::require_access(principal, &server)?;
        if server.source_type != SourceType::LocalDeclared {
            return Err(GatewayError::InvalidArgument(
                "scan upload is only supported for local-declared servers".to_owned(),
            ));
        }

        let outcome = parse_scan_output(&payload.scan_output)
            .map_err(|e| GatewayError::InvalidArgument(e.to_string()))?;
        let passed = outcome.risk_score <= self.scan_pass_threshold;
        let server_status = if passed {
            ServerStatus::ScannedPass
        } else {
            ServerStatus::ScannedFail
        };

        let now = Utc::now();
        let scan = Scan {
            id: Uuid::new_v4(),
            server_id: server.id,
            scanner_version: payload.scan_version,
            status: ScanStatus::Completed,
            risk_score: Some(outcome.risk_score),
            summary: outcome.summary,
            report_json: Some(outcome.raw),
            issues: outcome.issues,
            discovered_tools: outcome.discovered_tools,
            job_name: None,
            error_message: None,
            started_at: payload.scanned_at.unwrap_or(now),
            finished_at: Some(now),
            triggered_by: principal.id.clone(),
        };
        self.scans.insert_completed(&scan, server_status).await?;
        self.metrics.scan_finished(ScanStatus::Completed);
        self.metrics.observe_risk_score(scan.risk_score.unwrap_or(0.0));
        info!(
            server = %server.canonical_id,
            risk_score = outcome.risk_score,
            passed,
            "local scan uploaded"
        );
        Ok(scan)
    }

    /// Approve a server (admin only).
    pub async fn approve(
        &self,
        principal: &Principal,
        id: Uuid,
        req: DecisionRequest,
    ) -> Result<Approval, GatewayError> {
        Self::require_admin(principal)?;
        let server = self.load(id).await?;
        require_reason(&req)?;

        match server.status {
            ServerStatus::ScannedPass | ServerStatus::PendingApproval => {}
            ServerStatus::ScannedFail => {
                if req
                    .override_reason
                    .as_deref()
                    .is_none_or(|r| r.trim().is_empty())
                {
                    return Err(GatewayError::InvalidState(
                        "approving a failed scan requires an override reason".to_owned(),
                    ));
                }
            }
            other => {
                return Err(GatewayError::InvalidState(format!(
                    "cannot approve a server in {other:?}"
                )));
            }
        }

        let notes = match (&req.notes, &req.override_reason) {
            (Some(notes), Some(override_reason)) => {
                Some(format!("{notes} (override: {override_reason})"))
            }
            (None, Some(override_reason)) => Some(format!("override: {override_reason}")),
            (notes, None) => notes.clone(),
        };
        self.record_decision(
            principal,
            &server,
            ApprovalAction::Approved,
            ServerStatus::Approved,
            req.reason,
            notes,
            req.expires_at,
        )
        .await
    }

    /// Deny a server (admin only). Allowed from any non-terminal state.
    pub async fn deny(
        &self,
        principal: &Principal,
        id: Uuid,
        req: DecisionRequest,
    ) -> Result<Approval, GatewayError> {
        Self::require_admin(principal)?;
        let server = self.load(id).await?;
        require_reason(&req)?;
        if server.status.is_terminal() || server.status == ServerStatus::Denied {
            return Err(GatewayError::InvalidState(format!(
                "cannot deny a server in {:?}",
                server.status
            )));
        }
        self.record_decision(
            principal,
            &server,
            ApprovalAction::Denied,
            ServerStatus::Denied,
            req.reason,
            req.notes,
            req.expires_at,
        )
        .await
    }

    /// Suspend an approved server (admin only).
    pub async fn suspend(
        &self,
        principal: &Principal,
        id: Uuid,
        req: DecisionRequest,
    ) -> Result<Approval, GatewayError> {
        Self::require_admin(principal)?;
        let server = self.load(id).await?;
        require_reason(&req)?;
        if server.status != ServerStatus::Approved {
            return Err(GatewayError::InvalidState(format!(
                "only approved servers can be suspended, server is {:?}",
                server.status
            )));
        }
        self.record_decision(
            principal,
            &server,
            ApprovalAction::Suspended,
            ServerStatus::Suspended,
            req.reason,
            req.notes,
            req.expires_at,
        )
        .await
    }

    /// Lift a suspension (admin only).
    pub async fn reinstate(
        &self,
        principal: &Principal,
        id: Uuid,
        req: DecisionRequest,
    ) -> Result<Approval, GatewayError> {
        Self::require_admin(principal)?;
        let server = self.load(id).await?;
        require_reason(&req)?;
        if server.status != ServerStatus::Suspended {
            return Err(GatewayError::InvalidState(format!(
                "only suspended servers can be reinstated, server is {:?}",
                server.status
            )));
        }
        self.record_decision(
            principal,
            &server,
            ApprovalAction::Reinstated,
            ServerStatus::Approved,
            req.reason,
            req.notes,
            req.expires_at,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_decision(
        &self,
        principal: &Principal,
        server: &Server,
        action: ApprovalAction,
        new_status: ServerStatus,
        reason: String,
        notes: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Approval, GatewayError> {
        let approval = Approval {
            id: Uuid::new_v4(),
            server_id: server.id,
            server_canonical_id: server.canonical_id.clone(),
            actor: principal.id.clone(),
            action,
            reason,
            notes,
            timestamp: Utc::now(),
            expires_at,
            scan_id: server.latest_scan_id,
        };
        self.approvals
            .record_decision(&approval, new_status)
            .await?;
        info!(
            server = %server.canonical_id,
            action = ?action,
            actor = %principal.id,
            from = ?server.status,
            to = ?new_status,
            "admin decision recorded"
        );
        Ok(approval)
    }

    /// Scan history for a server, newest first.
    pub async fn scan_history(
        &self,
        principal: &Principal,
        id: Uuid,
    ) -> Result<Vec<Scan>, GatewayError> {
        let server = self.load(id).await?;
        Self::require_access(principal, &server)?;
        Ok(self.scans.list_for_server(id).await?)
    }

    /// One scan by id, scoped to its server.
    pub async fn scan_detail(
        &self,
        principal: &Principal,
        id: Uuid,
        scan_id: Uuid,
    ) -> Result<Scan, GatewayError> {
        let server = self.load(id).await?;
        Self::require_access(principal, &server)?;
        let scan = self
            .scans
            .get(scan_id)
            .await?
            .filter(|s| s.server_id == id)
            .ok_or(GatewayError::NotFound)?;
        Ok(scan)
    }

    /// Most recent scan for a server.
    pub async fn latest_scan(
        &self,
        principal: &Principal,
        id: Uuid,
    ) -> Result<Scan, GatewayError> {
        let server = self.load(id).await?;
        Self::require_access(principal, &server)?;
        self.scans
            .latest_for_server(id)
            .await?
            .ok_or(GatewayError::NotFound)
    }

    /// Cancel a scan explicitly. Does not touch the server's lifecycle state.
    pub async fn cancel_scan(
        &self,
        principal: &Principal,
        id: Uuid,
        scan_id: Uuid,
    ) -> Result<Scan, GatewayError> {
        Self::require_subject(principal)?;
        let server = self.load(id).await?;
        Self::require_access(principal, &server)?;
        let scan = self
            .scans
            .get(scan_id)
            .await?
            .filter(|s| s.server_id == id)
            .ok_or(GatewayError::NotFound)?;
        self.orchestrator.cancel(&scan).await
    }

    /// Approval history for a server, newest first.
    pub async fn approval_history(
        &self,
        principal: &Principal,
        id: Uuid,
    ) -> Result<Vec<Approval>, GatewayError> {
        let server = self.load(id).await?;
        Self::require_access(principal, &server)?;
        Ok(self.approvals.list_for_server(id).await?)
    }

    /// Fast path for the policy engine: is the server currently Approved?
    pub async fn is_approved(&self, canonical_id: &str) -> Result<bool, GatewayError> {
        Ok(self
            .servers
            .get_by_canonical_id(canonical_id)
            .await?
            .is_some_and(|s| s.status == ServerStatus::Approved))
    }
}

fn require_reason(req: &DecisionRequest) -> Result<(), GatewayError> {
    if req.reason.trim().is_empty() {
        return Err(GatewayError::InvalidArgument(
            "a non-empty reason is required".to_owned(),
        ));
    }
    Ok(())
}
