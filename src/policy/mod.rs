//! Synchronous admission decisions for proxied tool calls.
//!
//! `decide` is evaluated on every governed MCP request, so it does at most
//! one registry lookup and no writes. Rules short-circuit in a fixed order;
//! the verdict carries a typed decision code plus an optional reason for the
//! audit trail. The active configuration lives in an immutable snapshot
//! behind an atomic pointer swap: in-flight decisions keep the snapshot they
//! started with, reloads replace it wholesale.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::config::PolicyConfig;
use crate::model::{Decision, Principal, ServerStatus};
use crate::store::{ServerStore, StoreError};

/// Outcome of one policy evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyVerdict {
    /// Typed decision code.
    pub decision: Decision,
    /// Human-readable explanation for denials.
    pub reason: Option<String>,
    /// Risk score of the target server, for audit decoration.
    pub server_risk_score: Option<f64>,
}

impl PolicyVerdict {
    fn allow(server_risk_score: Option<f64>) -> Self {
        Self {
            decision: Decision::Allowed,
            reason: None,
            server_risk_score,
        }
    }

    fn deny(decision: Decision, reason: String, server_risk_score: Option<f64>) -> Self {
        Self {
            decision,
            reason: Some(reason),
            server_risk_score,
        }
    }
}

/// Immutable, pre-lowercased view of the policy configuration.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    bypass_principals: HashSet<String>,
    enforce_registry_only: bool,
    risk_threshold: f64,
    require_admin_for_high_risk: bool,
    tool_denylist: HashSet<String>,
    denied_categories: Vec<String>,
    team_allowlists: HashMap<String, Vec<String>>,
    team_denylists: HashMap<String, Vec<String>>,
}

impl PolicySnapshot {
    /// Normalize a policy configuration into a decision-ready snapshot.
    pub fn from_config(config: &PolicyConfig) -> Self {
        Self {
            bypass_principals: config.bypass_allowed_principals.iter().cloned().collect(),
            enforce_registry_only: config.enforce_registry_only,
            risk_threshold: config.risk_threshold,
            require_admin_for_high_risk: config.require_admin_for_high_risk,
            tool_denylist: config
                .global_tool_denylist
                .iter()
                .map(|t| t.to_lowercase())
                .collect(),
            denied_categories: config
                .denied_tool_categories
                .iter()
                .map(|c| c.to_lowercase())
                .collect(),
            team_allowlists: lower_values(&config.team_allowlists),
            team_denylists: lower_values(&config.team_denylists),
        }
    }
}

fn lower_values(map: &HashMap<String, Vec<String>>) -> HashMap<String, Vec<String>> {
    map.iter()
        .map(|(team, servers)| {
            (
                team.clone(),
                servers.iter().map(|s| s.to_lowercase()).collect(),
            )
        })
        .collect()
}

/// Stateless decision engine over a policy snapshot and the server registry.
pub struct PolicyEngine {
    snapshot: RwLock<Arc<PolicySnapshot>>,
    servers: Arc<dyn ServerStore>,
}

impl PolicyEngine {
    /// Build an engine with an initial snapshot.
    pub fn new(config: &PolicyConfig, servers: Arc<dyn ServerStore>) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(PolicySnapshot::from_config(config))),
            servers,
        }
    }

    /// Atomically replace the active snapshot.
    pub fn reload(&self, config: &PolicyConfig) {
        let next = Arc::new(PolicySnapshot::from_config(config));
        if let Ok(mut guard) = self.snapshot.write() {
            *guard = next;
            debug!("policy snapshot reloaded");
        }
    }

    /// The snapshot decisions are currently evaluated under.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.snapshot
            .read()
            .map(|guard| Arc::clone(&guard))
            .unwrap_or_default()
    }

    /// Decide whether `principal` may invoke `tool_name` on the server known
    /// as `server_canonical_id`.
    ///
    /// # Errors
    ///
    /// Propagates the registry read failure; the enforcement adapter decides
    /// whether that fails open or closed.
    pub async fn decide(
        &self,
        principal: &Principal,
        server_canonical_id: &str,
        tool_name: &str,
    ) -> Result<PolicyVerdict, StoreError> {
        let snapshot = self.snapshot();

        // Break-glass principals skip every other rule.
        if snapshot.bypass_principals.contains(&principal.id) {
            return Ok(PolicyVerdict::allow(None));
        }

        // The single registry read; feeds rules 2 and 3 and the allow
        // decoration.
        let server = self
            .servers
            .get_by_canonical_id(server_canonical_id)
            .await?;
        let risk = server.as_ref().and_then(|s| s.latest_risk_score);

        if snapshot.enforce_registry_only {
            match &server {
                None => {
                    return Ok(PolicyVerdict::deny(
                        Decision::DeniedServerNotApproved,
                        format!("server {server_canonical_id} is not registered"),
                        None,
                    ));
                }
                Some(server) if server.status != ServerStatus::Approved => {
                    return Ok(PolicyVerdict::deny(
                        Decision::DeniedServerNotApproved,
                        format!(
                            "server {server_canonical_id} is {:?}, not Approved",
                            server.status
                        ),
                        risk,
                    ));
                }
                Some(_) => {}
            }
        }

        if let Some(score) = risk {
            if score > snapshot.risk_threshold
                && snapshot.require_admin_for_high_risk
                && !principal.is_admin()
            {
                return Ok(PolicyVerdict::deny(
                    Decision::DeniedHighRisk,
                    format!(
                        "server risk score {score:.2} exceeds threshold {:.2}",
                        snapshot.risk_threshold
                    ),
                    risk,
                ));
            }
        }

        let tool_lower = tool_name.to_lowercase();
        if snapshot.tool_denylist.contains(&tool_lower) {
            return Ok(PolicyVerdict::deny(
                Decision::DeniedToolDenylisted,
                format!("tool {tool_name} is globally denylisted"),
                risk,
            ));
        }
        if let Some(category) = snapshot
            .denied_categories
            .iter()
            .find(|c| tool_lower.contains(c.as_str()))
        {
            return Ok(PolicyVerdict::deny(
                Decision::DeniedToolDenylisted,
                format!("tool {tool_name} matches denied category {category}"),
                risk,
            ));
        }

        if let Some(team) = principal.team.as_deref() {
            let server_lower = server_canonical_id.to_lowercase();
            if let Some(allowed) = snapshot.team_allowlists.get(team) {
                if !allowed.is_empty() && !allowed.contains(&server_lower) {
                    return Ok(PolicyVerdict::deny(
                        Decision::DeniedTeamNotAuthorized,
                        format!("team {team} is not allowlisted for {server_canonical_id}"),
                        risk,
                    ));
                }
            }
            if let Some(denied) = snapshot.team_denylists.get(team) {
                if denied.contains(&server_lower) {
                    return Ok(PolicyVerdict::deny(
                        Decision::DeniedTeamNotAuthorized,
                        format!("team {team} is denylisted for {server_canonical_id}"),
                        risk,
                    ));
                }
            }
        }

        Ok(PolicyVerdict::allow(risk))
    }
}
