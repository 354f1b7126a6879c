//! In-memory repositories for deterministic tests.
//!
//! All four stores share one [`MemoryStores`] backing so foreign-key
//! cascades behave like the database. Conditional transitions mirror the
//! Postgres semantics exactly, including returning `false` when the expected
//! state check misses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::{Approval, AuditEvent, Scan, ScanStatus, Server, ServerStatus};

use super::{
    ApprovalStore, AuditFilter, AuditPage, AuditStats, AuditStore, ScanCompletion, ScanStore,
    ServerStore, StoreError,
};

#[derive(Default)]
struct Inner {
    servers: Mutex<HashMap<Uuid, Server>>,
    scans: Mutex<HashMap<Uuid, Scan>>,
    approvals: Mutex<Vec<Approval>>,
    audit: Mutex<Vec<AuditEvent>>,
}

/// Shared backing for the in-memory store family.
#[derive(Clone, Default)]
pub struct MemoryStores {
    inner: Arc<Inner>,
}

impl MemoryStores {
    /// Fresh, empty backing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Server store view.
    pub fn servers(&self) -> MemoryServerStore {
        MemoryServerStore {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Scan store view.
    pub fn scans(&self) -> MemoryScanStore {
        MemoryScanStore {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Approval store view.
    pub fn approvals(&self) -> MemoryApprovalStore {
        MemoryApprovalStore {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Audit store view.
    pub fn audit(&self) -> MemoryAuditStore {
        MemoryAuditStore {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn lock_err<T>(_: T) -> StoreError {
    StoreError::Unavailable("store lock poisoned".to_owned())
}

// ---------------------------------------------------------------------------
// Servers
// ---------------------------------------------------------------------------

/// In-memory server repository.
#[derive(Clone)]
pub struct MemoryServerStore {
    inner: Arc<Inner>,
}

#[async_trait]
impl ServerStore for MemoryServerStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert(&self, server: &Server) -> Result<(), StoreError> {
        let mut servers = self.inner.servers.lock().map_err(lock_err)?;
        if servers.contains_key(&server.id) {
            return Err(StoreError::Conflict {
                field: "id".to_owned(),
            });
        }
        let duplicate = servers
            .values()
            .any(|s| s.canonical_id.eq_ignore_ascii_case(&server.canonical_id));
        if duplicate {
            return Err(StoreError::Conflict {
                field: "canonicalId".to_owned(),
            });
        }
        servers.insert(server.id, server.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Server>, StoreError> {
        Ok(self.inner.servers.lock().map_err(lock_err)?.get(&id).cloned())
    }

    async fn get_by_canonical_id(&self, canonical_id: &str) -> Result<Option<Server>, StoreError> {
        Ok(self
            .inner
            .servers
            .lock()
            .map_err(lock_err)?
            .values()
            .find(|s| s.canonical_id.eq_ignore_ascii_case(canonical_id))
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Server>, StoreError> {
        let mut servers: Vec<Server> = self
            .inner
            .servers
            .lock()
            .map_err(lock_err)?
            .values()
            .cloned()
            .collect();
        servers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(servers)
    }

    async fn list_by_status(&self, status: ServerStatus) -> Result<Vec<Server>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|s| s.status == status)
            .collect())
    }

    async fn list_by_team(&self, team: &str) -> Result<Vec<Server>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|s| s.owner_team == team)
            .collect())
    }

    async fn update(&self, server: &Server) -> Result<(), StoreError> {
        let mut servers = self.inner.servers.lock().map_err(lock_err)?;
        servers.insert(server.id, server.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let removed = self
            .inner
            .servers
            .lock()
            .map_err(lock_err)?
            .remove(&id)
            .is_some();
        if removed {
            self.inner
                .scans
                .lock()
                .map_err(lock_err)?
                .retain(|_, s| s.server_id != id);
            self.inner
                .approvals
                .lock()
                .map_err(lock_err)?
                .retain(|a| a.server_id != id);
        }
        Ok(removed)
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: &[ServerStatus],
        to: ServerStatus,
    ) -> Result<bool, StoreError> {
        let mut servers = self.inner.servers.lock().map_err(lock_err)?;
        match servers.get_mut(&id) {
            Some(server) if from.contains(&server.status) => {
                server.status = to;
                server.updated_at = chrono::Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_by_status(&self, status: ServerStatus) -> Result<i64, StoreError> {
        Ok(self
            .inner
            .servers
            .lock()
            .map_err(lock_err)?
            .values()
            .filter(|s| s.status == status)
            .count() as i64)
    }
}

// ---------------------------------------------------------------------------
// Scans
// ---------------------------------------------------------------------------

/// In-memory scan repository.
#[derive(Clone)]
pub struct MemoryScanStore {
    inner: Arc<Inner>,
}

impl MemoryScanStore {
    fn update_server_pointer(
        &self,
        server_id: Uuid,
        status: ServerStatus,
        scan_id: Uuid,
        risk: Option<f64>,
    ) -> Result<(), StoreError> {
        let mut servers = self.inner.servers.lock().map_err(lock_err)?;
        if let Some(server) = servers.get_mut(&server_id) {
            server.status = status;
            server.latest_scan_id = Some(scan_id);
            server.latest_risk_score = risk;
            server.updated_at = chrono::Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl ScanStore for MemoryScanStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert(&self, scan: &Scan) -> Result<(), StoreError> {
        self.inner
            .scans
            .lock()
            .map_err(lock_err)?
            .insert(scan.id, scan.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Scan>, StoreError> {
        Ok(self.inner.scans.lock().map_err(lock_err)?.get(&id).cloned())
    }

    async fn list_for_server(&self, server_id: Uuid) -> Result<Vec<Scan>, StoreError> {
        let mut scans: Vec<Scan> = self
            .inner
            .scans
            .lock()
            .map_err(lock_err)?
            .values()
            .filter(|s| s.server_id == server_id)
            .cloned()
            .collect();
        scans.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(scans)
    }

    async fn list_by_status(&self, status: ScanStatus) -> Result<Vec<Scan>, StoreError> {
        let mut scans: Vec<Scan> = self
            .inner
            .scans
            .lock()
            .map_err(lock_err)?
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        scans.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(scans)
    }

    async fn latest_for_server(&self, server_id: Uuid) -> Result<Option<Scan>, StoreError> {
        Ok(self.list_for_server(server_id).await?.into_iter().next())
    }

    async fn mark_running(
        &self,
        scan_id: Uuid,
        server_id: Uuid,
        job_name: &str,
    ) -> Result<bool, StoreError> {
        {
            let mut scans = self.inner.scans.lock().map_err(lock_err)?;
            match scans.get_mut(&scan_id) {
                Some(scan) if scan.status == ScanStatus::Pending => {
                    scan.status = ScanStatus::Running;
                    scan.job_name = Some(job_name.to_owned());
                }
                _ => return Ok(false),
            }
        }
        let mut servers = self.inner.servers.lock().map_err(lock_err)?;
        if let Some(server) = servers.get_mut(&server_id) {
            if server.status == ServerStatus::PendingScan {
                server.status = ServerStatus::Scanning;
                server.updated_at = chrono::Utc::now();
            }
        }
        Ok(true)
    }

    async fn record_completion(&self, completion: &ScanCompletion) -> Result<bool, StoreError> {
        {
            let mut scans = self.inner.scans.lock().map_err(lock_err)?;
            match scans.get_mut(&completion.scan_id) {
                Some(scan) if completion.expect.contains(&scan.status) => {
                    scan.status = completion.status;
                    scan.risk_score = completion.risk_score;
                    scan.summary = completion.summary.clone();
                    scan.report_json = completion.report_json.clone();
                    scan.issues = completion.issues.clone();
                    scan.discovered_tools = completion.discovered_tools.clone();
                    scan.error_message = completion.error_message.clone();
                    scan.finished_at = Some(completion.finished_at);
                }
                _ => return Ok(false),
            }
        }
        if let Some(status) = completion.server_status {
            self.update_server_pointer(
                completion.server_id,
                status,
                completion.scan_id,
                completion.risk_score,
            )?;
        }
        Ok(true)
    }

    async fn insert_completed(
        &self,
        scan: &Scan,
        server_status: ServerStatus,
    ) -> Result<(), StoreError> {
        self.insert(scan).await?;
        self.update_server_pointer(scan.server_id, server_status, scan.id, scan.risk_score)
    }
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

/// In-memory approval repository.
#[derive(Clone)]
pub struct MemoryApprovalStore {
    inner: Arc<Inner>,
}

#[async_trait]
impl ApprovalStore for MemoryApprovalStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn record_decision(
        &self,
        approval: &Approval,
        new_server_status: ServerStatus,
    ) -> Result<(), StoreError> {
        self.inner
            .approvals
            .lock()
            .map_err(lock_err)?
            .push(approval.clone());
        let mut servers = self.inner.servers.lock().map_err(lock_err)?;
        if let Some(server) = servers.get_mut(&approval.server_id) {
            server.status = new_server_status;
            server.updated_at = chrono::Utc::now();
        }
        Ok(())
    }

    async fn list_for_server(&self, server_id: Uuid) -> Result<Vec<Approval>, StoreError> {
        let mut approvals: Vec<Approval> = self
            .inner
            .approvals
            .lock()
            .map_err(lock_err)?
            .iter()
            .filter(|a| a.server_id == server_id)
            .cloned()
            .collect();
        approvals.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(approvals)
    }
}

// ---------------------------------------------------------------------------
// Audit events
// ---------------------------------------------------------------------------

/// In-memory audit repository.
#[derive(Clone)]
pub struct MemoryAuditStore {
    inner: Arc<Inner>,
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.inner
            .audit
            .lock()
            .map_err(lock_err)?
            .push(event.clone());
        Ok(())
    }

    async fn query(
        &self,
        filter: &AuditFilter,
        limit: i64,
        offset: i64,
    ) -> Result<AuditPage, StoreError> {
        let mut matching: Vec<AuditEvent> = self
            .inner
            .audit
            .lock()
            .map_err(lock_err)?
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let total = matching.len() as i64;
        let events = matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok(AuditPage { events, total })
    }

    async fn stats(&self, filter: &AuditFilter) -> Result<AuditStats, StoreError> {
        let matching: Vec<AuditEvent> = self
            .inner
            .audit
            .lock()
            .map_err(lock_err)?
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        let total = matching.len() as i64;
        let mean_latency_ms = if matching.is_empty() {
            0.0
        } else {
            matching.iter().map(|e| e.latency_ms).sum::<f64>() / matching.len() as f64
        };

        let mut by_decision: HashMap<String, i64> = HashMap::new();
        let mut by_server: HashMap<String, i64> = HashMap::new();
        let mut by_team: HashMap<String, i64> = HashMap::new();
        for event in &matching {
            *by_decision
                .entry(event.decision.label().to_owned())
                .or_default() += 1;
            *by_server
                .entry(event.server_canonical_id.clone())
                .or_default() += 1;
            if let Some(team) = &event.team {
                *by_team.entry(team.clone()).or_default() += 1;
            }
        }

        Ok(AuditStats {
            total,
            by_decision: sorted_desc(by_decision, usize::MAX),
            top_servers: sorted_desc(by_server, 10),
            top_teams: sorted_desc(by_team, 10),
            mean_latency_ms,
        })
    }
}

fn sorted_desc(counts: HashMap<String, i64>, take: usize) -> Vec<(String, i64)> {
    let mut entries: Vec<(String, i64)> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(take);
    entries
}
