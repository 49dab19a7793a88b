//! Container/process runtime interface consumed by the dispatcher.
//!
//! The dispatcher never assumes a runtime vendor; `DockerRuntime` drives the
//! docker CLI and is the production implementation, tests use a fake.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RuntimeError;

/// Everything needed to launch one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub job_id: Uuid,
    /// Container image to run.
    pub image: String,
    /// Runtime-visible name, derived from the job id.
    pub name: String,
    /// Environment passed to the worker process. Job-scoped credentials ride
    /// here, never in the image.
    pub env: HashMap<String, String>,
    /// Memory limit, e.g. "4g".
    pub mem_limit: String,
    /// CPU count limit.
    pub cpu_count: u32,
}

impl WorkerSpec {
    pub fn new(job_id: Uuid, image: impl Into<String>) -> Self {
        Self {
            job_id,
            image: image.into(),
            name: format!("scan-worker-{}", &job_id.to_string()[..8]),
            env: HashMap::new(),
            mem_limit: "4g".to_string(),
            cpu_count: 2,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Opaque handle to a launched worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    /// Runtime-native id (container id).
    pub id: String,
    pub name: String,
}

/// Kind of stop signal to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Ask the worker to stop (SIGTERM).
    Graceful,
    /// Kill it (SIGKILL).
    Force,
}

/// Exit status of a finished worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i64,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Vendor-neutral worker runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a worker. Returns a handle for later signalling/waiting.
    async fn launch(&self, spec: &WorkerSpec) -> Result<WorkerHandle, RuntimeError>;

    /// Deliver a stop signal.
    async fn signal(&self, handle: &WorkerHandle, kind: SignalKind) -> Result<(), RuntimeError>;

    /// Block until the worker exits.
    async fn wait(&self, handle: &WorkerHandle) -> Result<ExitStatus, RuntimeError>;

    /// Reclaim the worker's resources. Safe to call after any exit path.
    async fn remove(&self, handle: &WorkerHandle) -> Result<(), RuntimeError>;
}

/// Docker CLI runtime. Labels every container so leaked workers stay
/// identifiable (`scanforge.role=worker`).
pub struct DockerRuntime {
    docker_bin: String,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self {
            docker_bin: std::env::var("SCANFORGE_DOCKER_BIN")
                .unwrap_or_else(|_| "docker".to_string()),
        }
    }

    async fn run_docker(&self, args: &[String]) -> Result<String, RuntimeError> {
        let output = Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| RuntimeError::Launch(format!("docker invocation failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::Launch(format!(
                "docker {} exited {}: {}",
                args.first().map(String::as_str).unwrap_or(""),
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn launch(&self, spec: &WorkerSpec) -> Result<WorkerHandle, RuntimeError> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--name".into(),
            spec.name.clone(),
            "--memory".into(),
            spec.mem_limit.clone(),
            "--cpus".into(),
            spec.cpu_count.to_string(),
            "--label".into(),
            format!("scanforge.job_id={}", spec.job_id),
            "--label".into(),
            "scanforge.role=worker".into(),
        ];
        for (key, value) in &spec.env {
            args.push("--env".into());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());

        let container_id = self.run_docker(&args).await?;
        debug!(job_id = %spec.job_id, container = %container_id, image = %spec.image, "Worker launched");

        Ok(WorkerHandle {
            id: container_id,
            name: spec.name.clone(),
        })
    }

    async fn signal(&self, handle: &WorkerHandle, kind: SignalKind) -> Result<(), RuntimeError> {
        let args = match kind {
            SignalKind::Graceful => {
                vec!["stop".to_string(), "--time".into(), "10".into(), handle.id.clone()]
            }
            SignalKind::Force => vec!["kill".to_string(), handle.id.clone()],
        };
        self.run_docker(&args)
            .await
            .map_err(|e| RuntimeError::Signal {
                handle: handle.id.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn wait(&self, handle: &WorkerHandle) -> Result<ExitStatus, RuntimeError> {
        let out = self
            .run_docker(&["wait".to_string(), handle.id.clone()])
            .await
            .map_err(|e| RuntimeError::Wait {
                handle: handle.id.clone(),
                reason: e.to_string(),
            })?;

        let code = out.trim().parse::<i64>().map_err(|e| RuntimeError::Wait {
            handle: handle.id.clone(),
            reason: format!("unparseable exit code {out:?}: {e}"),
        })?;

        Ok(ExitStatus { code })
    }

    async fn remove(&self, handle: &WorkerHandle) -> Result<(), RuntimeError> {
        // --force also covers the still-running case after a failed stop.
        if let Err(e) = self
            .run_docker(&["rm".to_string(), "--force".into(), handle.id.clone()])
            .await
        {
            // The container may already be gone (e.g. auto-removed).
            warn!(container = %handle.id, error = %e, "Worker removal reported an error");
            return Err(RuntimeError::Remove {
                handle: handle.id.clone(),
                reason: e.to_string(),
            });
        }
        Ok(())
    }
}
