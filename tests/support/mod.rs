//! Shared fixtures: in-memory stores, a fake workload runner, and principals.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use turing::config::ScannerConfig;
use turing::metrics::Metrics;
use turing::model::{Principal, SourceType};
use turing::registry::{RegisterRequest, RegistryService};
use turing::scan::runner::{RunnerError, ScanRunner, WorkloadPhase, WorkloadSpec};
use turing::scan::{Reconciler, ScanOrchestrator};
use turing::store::MemoryStores;

/// Scan runner double with scriptable phases and logs.
#[derive(Default)]
pub struct FakeRunner {
    /// Every spec submitted through `launch`.
    pub launches: Mutex<Vec<WorkloadSpec>>,
    /// Phase to report per workload name; unknown names are NotFound.
    pub phases: Mutex<HashMap<String, WorkloadPhase>>,
    /// Stdout to report per workload name.
    pub logs: Mutex<HashMap<String, String>>,
    /// Every name passed to `delete`.
    pub deleted: Mutex<Vec<String>>,
    /// When set, every launch attempt is rejected.
    pub fail_launch: AtomicBool,
}

impl FakeRunner {
    pub fn set_phase(&self, name: &str, phase: WorkloadPhase) {
        self.phases
            .lock()
            .expect("phases lock")
            .insert(name.to_owned(), phase);
    }

    pub fn set_logs(&self, name: &str, logs: &str) {
        self.logs
            .lock()
            .expect("logs lock")
            .insert(name.to_owned(), logs.to_owned());
    }

    pub fn deleted_names(&self) -> Vec<String> {
        self.deleted.lock().expect("deleted lock").clone()
    }
}

#[async_trait::async_trait]
impl ScanRunner for FakeRunner {
    async fn launch(&self, spec: &WorkloadSpec) -> Result<(), RunnerError> {
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(RunnerError::Rejected("scheduler says no".to_owned()));
        }
        self.launches.lock().expect("launch lock").push(spec.clone());
        self.set_phase(&spec.name, WorkloadPhase::Running);
        Ok(())
    }

    async fn phase(&self, name: &str) -> Result<WorkloadPhase, RunnerError> {
        Ok(self
            .phases
            .lock()
            .expect("phases lock")
            .get(name)
            .copied()
            .unwrap_or(WorkloadPhase::NotFound))
    }

    async fn logs(&self, name: &str) -> Result<String, RunnerError> {
        Ok(self
            .logs
            .lock()
            .expect("logs lock")
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete(&self, name: &str) -> Result<(), RunnerError> {
        self.deleted
            .lock()
            .expect("deleted lock")
            .push(name.to_owned());
        Ok(())
    }
}

/// Everything a registry/scan test needs, wired over in-memory stores.
pub struct World {
    pub stores: MemoryStores,
    pub runner: Arc<FakeRunner>,
    pub orchestrator: Arc<ScanOrchestrator>,
    pub registry: Arc<RegistryService>,
    pub metrics: Arc<Metrics>,
    pub scanner_config: ScannerConfig,
}

/// Pass threshold used by the fixtures.
pub const PASS_THRESHOLD: f64 = 0.5;

pub fn world() -> World {
    let stores = MemoryStores::new();
    let runner = Arc::new(FakeRunner::default());
    let metrics = Arc::new(Metrics::new().expect("metrics registry"));
    let scanner_config = ScannerConfig {
        retries: 0,
        ..ScannerConfig::default()
    };
    let orchestrator = Arc::new(ScanOrchestrator::new(
        Arc::new(stores.scans()),
        runner.clone() as Arc<dyn ScanRunner>,
        scanner_config.clone(),
        metrics.clone(),
    ));
    let registry = Arc::new(RegistryService::new(
        Arc::new(stores.servers()),
        Arc::new(stores.scans()),
        Arc::new(stores.approvals()),
        orchestrator.clone(),
        PASS_THRESHOLD,
        metrics.clone(),
    ));
    World {
        stores,
        runner,
        orchestrator,
        registry,
        metrics,
        scanner_config,
    }
}

impl World {
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            Arc::new(self.stores.scans()),
            Arc::new(self.stores.servers()),
            self.runner.clone(),
            self.scanner_config.clone(),
            PASS_THRESHOLD,
            self.metrics.clone(),
        )
    }
}

pub fn admin() -> Principal {
    Principal {
        id: "root".to_owned(),
        email: Some("root@example.com".to_owned()),
        team: Some("platform".to_owned()),
        roles: vec!["admin".to_owned()],
    }
}

pub fn member(id: &str, team: &str) -> Principal {
    Principal {
        id: id.to_owned(),
        email: Some(format!("{id}@example.com")),
        team: Some(team.to_owned()),
        roles: vec![],
    }
}

pub fn register_req(canonical_id: &str, team: &str, source_type: SourceType) -> RegisterRequest {
    RegisterRequest {
        canonical_id: canonical_id.to_owned(),
        name: canonical_id.to_owned(),
        description: None,
        owner_team: team.to_owned(),
        source_type,
        source_url: Some("https://example.com/repo.git".to_owned()),
        version: "1".to_owned(),
        declared_tools: vec![],
        mcp_config: None,
        test_endpoint: None,
        tags: vec![],
    }
}
