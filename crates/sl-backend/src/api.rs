//! Collaborator interfaces: the experiment-tracking backend and the launch
//! queue.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sl_types::{BackendError, BackendResult, QueuedRun, QueuedRunStatus};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// A sweep as stored on the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRecord {
    pub id: String,
    pub name: String,
    /// Sweep configuration as a YAML document.
    pub config: String,
    pub state: String,
}

/// Returned by agent registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
}

/// A run record minted by `upsert_run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Opaque backend id.
    pub id: String,
    /// Display name; used as the run id everywhere else.
    pub name: String,
}

/// Input to `upsert_run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertRun {
    pub entity: String,
    pub project: String,
    pub sweep_name: String,
    /// Run config in `{name: {"value": v}}` form.
    pub config: serde_json::Value,
}

/// A file-backed artifact to log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub name: String,
    /// Artifact type, e.g. "optuna".
    pub kind: String,
    pub path: PathBuf,
}

/// Core backend interface.
///
/// Implementations may talk to the real GraphQL API (see
/// [`crate::http::GraphqlClient`]) or keep everything in process (see
/// [`crate::memory::MemoryBackend`]).
#[async_trait]
pub trait SweepBackend: Send + Sync {
    /// Look up a sweep. `Ok(None)` when the backend has no such sweep.
    async fn sweep(
        &self,
        entity: &str,
        project: &str,
        sweep_id: &str,
    ) -> BackendResult<Option<SweepRecord>>;

    async fn register_agent(
        &self,
        host: &str,
        sweep_id: &str,
        project: &str,
        entity: &str,
    ) -> BackendResult<AgentConfig>;

    /// Poll for commands addressed to an agent. Commands are returned raw so
    /// the protocol layer can reject malformed ones.
    async fn agent_heartbeat(
        &self,
        agent_id: &str,
        run_states: &BTreeMap<String, bool>,
    ) -> BackendResult<Vec<serde_json::Value>>;

    /// Raw remote status string of a run ("running", "finished", ...).
    async fn get_run_state(&self, entity: &str, project: &str, run_id: &str)
        -> BackendResult<String>;

    async fn stop_run(&self, run_id: &str) -> BackendResult<bool>;

    async fn upsert_run(&self, request: UpsertRun) -> BackendResult<RunRecord>;

    /// Values of `metric` logged by a run, skipping the first `since`.
    async fn run_metric_history(
        &self,
        entity: &str,
        project: &str,
        run_id: &str,
        metric: &str,
        since: usize,
    ) -> BackendResult<Vec<f64>>;

    async fn job_exists(&self, entity: &str, project: &str, job: &str) -> BackendResult<bool>;

    async fn log_artifact(
        &self,
        entity: &str,
        project: &str,
        artifact: ArtifactSpec,
    ) -> BackendResult<()>;

    /// Download the latest version of an artifact into `dest`, returning the
    /// directory its files were written to.
    async fn download_artifact(
        &self,
        entity: &str,
        project: &str,
        name: &str,
        dest: &Path,
    ) -> BackendResult<PathBuf>;
}

/// Parameter overrides attached to a launch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchOverrides {
    /// Run config in `{name: {"value": v}}` form.
    pub run_config: serde_json::Map<String, serde_json::Value>,
    /// Command-line arguments after template expansion.
    pub args: Vec<String>,
}

/// One job submission to the launch queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub run_id: String,
    pub entity: String,
    pub project: String,
    /// Project that owns `queue`.
    pub project_queue: String,
    pub queue: String,
    pub job: Option<String>,
    pub image_uri: Option<String>,
    pub entry_point: Option<Vec<String>>,
    pub overrides: LaunchOverrides,
}

/// Launch queue interface.
#[async_trait]
pub trait LaunchQueue: Send + Sync {
    /// Push a job onto the queue and return its handle.
    async fn submit(&self, request: LaunchRequest) -> BackendResult<QueuedRun>;

    async fn status(&self, queued: &QueuedRun) -> BackendResult<QueuedRunStatus>;

    /// Block until the queued item is running. Fails if it finishes or fails
    /// first.
    async fn wait_until_running(&self, queued: &QueuedRun, poll: Duration) -> BackendResult<()> {
        loop {
            match self.status(queued).await? {
                QueuedRunStatus::Running => return Ok(()),
                QueuedRunStatus::Pending => {
                    debug!(item = %queued.id, run_id = %queued.run_id, "queued run still pending");
                    tokio::time::sleep(poll).await;
                }
                status @ (QueuedRunStatus::Finished | QueuedRunStatus::Failed) => {
                    return Err(BackendError::InvalidResponse {
                        message: format!(
                            "queued run {} ended as {:?} before running",
                            queued.id, status
                        ),
                    })
                }
            }
        }
    }
}
