//! Docker-backed scan workload runner with hardening defaults.
//!
//! Each scan runs as a one-shot container: non-root user, read-only root
//! filesystem, all capabilities dropped, no privilege escalation, bounded
//! memory and CPU. The container enforces the active deadline itself via
//! `timeout(1)` as a backstop under the reconciler's own timeout check.

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::HostConfig;
use bollard::Docker;
use tokio_stream::StreamExt;

use super::runner::{RunnerError, ScanRunner, WorkloadPhase, WorkloadSpec};

const SCAN_USER: &str = "65534:65534";
const PIDS_LIMIT: i64 = 256;
const TMPFS_SPEC: &str = "rw,size=512m";

/// Scan runner over the Docker Engine API.
#[derive(Debug, Clone)]
pub struct DockerRunner {
    docker: Docker,
}

impl DockerRunner {
    /// Connect using the local daemon defaults.
    ///
    /// # Errors
    ///
    /// Returns an error when the Docker socket cannot be reached.
    pub fn connect() -> Result<Self, RunnerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RunnerError::Scheduler(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Whether the daemon answers pings.
    pub async fn available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }
}

#[async_trait::async_trait]
impl ScanRunner for DockerRunner {
    async fn launch(&self, spec: &WorkloadSpec) -> Result<(), RunnerError> {
        let memory_limit = i64::try_from(spec.memory_limit_mb)
            .unwrap_or(i64::MAX / (1024 * 1024))
            .saturating_mul(1024)
            .saturating_mul(1024);
        let nano_cpus = cpu_to_nanos(spec.cpu_limit)?;

        let mut tmpfs = std::collections::HashMap::new();
        tmpfs.insert("/tmp".to_owned(), TMPFS_SPEC.to_owned());

        let host_config = HostConfig {
            readonly_rootfs: Some(true),
            cap_drop: Some(vec!["ALL".to_owned()]),
            security_opt: Some(vec!["no-new-privileges:true".to_owned()]),
            pids_limit: Some(PIDS_LIMIT),
            memory: Some(memory_limit),
            nano_cpus: Some(nano_cpus),
            tmpfs: Some(tmpfs),
            ..Default::default()
        };

        let deadline = spec.active_deadline.as_secs().max(1);
        let mut cmd = vec![
            "timeout".to_owned(),
            "--signal=TERM".to_owned(),
            "--kill-after=5".to_owned(),
            deadline.to_string(),
        ];
        cmd.extend(spec.command.iter().cloned());

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let labels: std::collections::HashMap<String, String> = spec.labels.clone();

        let container_config = ContainerConfig {
            image: Some(spec.image.clone()),
            cmd: Some(cmd),
            env: Some(env),
            user: Some(SCAN_USER.to_owned()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        });
        self.docker
            .create_container(options, container_config)
            .await
            .map_err(|e| match e {
                BollardError::DockerResponseServerError {
                    status_code: 409, ..
                } => RunnerError::Rejected(format!("workload {} already exists", spec.name)),
                other => RunnerError::Scheduler(other.to_string()),
            })?;

        self.docker
            .start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RunnerError::Scheduler(e.to_string()))?;
        Ok(())
    }

    async fn phase(&self, name: &str) -> Result<WorkloadPhase, RunnerError> {
        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await;
        let state = match inspect {
            Ok(details) => details.state,
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(WorkloadPhase::NotFound),
            Err(other) => return Err(RunnerError::Scheduler(other.to_string())),
        };
        let Some(state) = state else {
            return Ok(WorkloadPhase::Pending);
        };
        if state.running.unwrap_or(false) {
            return Ok(WorkloadPhase::Running);
        }
        match state.exit_code {
            Some(0) => Ok(WorkloadPhase::Succeeded),
            Some(_) => Ok(WorkloadPhase::Failed),
            None => Ok(WorkloadPhase::Pending),
        }
    }

    async fn logs(&self, name: &str) -> Result<String, RunnerError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: false,
            tail: "all".to_owned(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));
        let mut stdout = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| RunnerError::Scheduler(e.to_string()))?;
            match chunk {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                _ => {}
            }
        }
        Ok(stdout)
    }

    async fn delete(&self, name: &str) -> Result<(), RunnerError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(other) => Err(RunnerError::Scheduler(other.to_string())),
        }
    }
}

fn cpu_to_nanos(cpu_cores: f64) -> Result<i64, RunnerError> {
    if !cpu_cores.is_finite() || cpu_cores <= 0.0 {
        return Err(RunnerError::Rejected(
            "cpu limit must be a positive finite number".to_owned(),
        ));
    }
    let nanos = cpu_cores * 1_000_000_000.0;
    if nanos > i64::MAX as f64 {
        return Err(RunnerError::Rejected("cpu limit out of range".to_owned()));
    }
    #[allow(clippy::cast_possible_truncation)]
    let nanos = nanos.round() as i64;
    Ok(nanos)
}
