//! In-process sandbox backend.
//!
//! Implements both collaborator traits with no network access. Heartbeat
//! replies, run states, and metric histories are scripted by the caller;
//! every submission, stop, and artifact is recorded for inspection.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sl_types::{BackendError, BackendResult, QueuedRun, QueuedRunStatus};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::api::{
    AgentConfig, ArtifactSpec, LaunchQueue, LaunchRequest, RunRecord, SweepBackend, SweepRecord,
    UpsertRun,
};

#[derive(Debug, Default)]
struct MemoryState {
    sweeps: HashMap<String, SweepRecord>,
    agents: Vec<String>,
    heartbeats: VecDeque<Vec<Value>>,
    heartbeat_calls: usize,
    run_states: HashMap<String, String>,
    unreachable_runs: HashSet<String>,
    stopped: Vec<String>,
    upserted: Vec<UpsertRun>,
    metrics: HashMap<String, Vec<f64>>,
    jobs: HashSet<String>,
    artifacts: HashMap<String, Vec<(String, Vec<u8>)>>,
    logged_artifacts: Vec<ArtifactSpec>,
    submissions: Vec<LaunchRequest>,
    failing_submissions: usize,
    queue_status: HashMap<String, QueuedRunStatus>,
}

/// A fully in-process backend and launch queue.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sweep so lookups for `sweep_id` succeed.
    pub fn add_sweep(&self, sweep_id: &str, config_yaml: &str) {
        self.state.lock().sweeps.insert(
            sweep_id.to_string(),
            SweepRecord {
                id: format!("sweep-record-{sweep_id}"),
                name: sweep_id.to_string(),
                config: config_yaml.to_string(),
                state: "RUNNING".to_string(),
            },
        );
    }

    /// Queue one heartbeat reply. Replies are handed out in order across all
    /// agents; an empty queue answers with no commands.
    pub fn push_heartbeat(&self, commands: Vec<Value>) {
        self.state.lock().heartbeats.push_back(commands);
    }

    pub fn set_run_state(&self, run_id: &str, state: &str) {
        self.state
            .lock()
            .run_states
            .insert(run_id.to_string(), state.to_string());
    }

    /// Make run-state lookups for `run_id` fail with a communication error.
    pub fn make_unreachable(&self, run_id: &str) {
        self.state.lock().unreachable_runs.insert(run_id.to_string());
    }

    pub fn push_metrics(&self, run_id: &str, values: &[f64]) {
        self.state
            .lock()
            .metrics
            .entry(run_id.to_string())
            .or_default()
            .extend_from_slice(values);
    }

    pub fn add_job(&self, job: &str) {
        self.state.lock().jobs.insert(job.to_string());
    }

    /// Seed an artifact that `download_artifact` can return.
    pub fn add_artifact(&self, name: &str, files: Vec<(String, Vec<u8>)>) {
        self.state.lock().artifacts.insert(name.to_string(), files);
    }

    /// Fail the next `n` submissions.
    pub fn fail_submissions(&self, n: usize) {
        self.state.lock().failing_submissions = n;
    }

    pub fn set_queue_status(&self, item_id: &str, status: QueuedRunStatus) {
        self.state
            .lock()
            .queue_status
            .insert(item_id.to_string(), status);
    }

    pub fn submissions(&self) -> Vec<LaunchRequest> {
        self.state.lock().submissions.clone()
    }

    pub fn stopped_runs(&self) -> Vec<String> {
        self.state.lock().stopped.clone()
    }

    pub fn agents(&self) -> Vec<String> {
        self.state.lock().agents.clone()
    }

    pub fn heartbeat_calls(&self) -> usize {
        self.state.lock().heartbeat_calls
    }

    pub fn upserted_runs(&self) -> Vec<UpsertRun> {
        self.state.lock().upserted.clone()
    }

    pub fn logged_artifacts(&self) -> Vec<ArtifactSpec> {
        self.state.lock().logged_artifacts.clone()
    }

    pub fn artifact_files(&self, name: &str) -> Option<Vec<(String, Vec<u8>)>> {
        self.state.lock().artifacts.get(name).cloned()
    }
}

#[async_trait]
impl SweepBackend for MemoryBackend {
    async fn sweep(
        &self,
        _entity: &str,
        _project: &str,
        sweep_id: &str,
    ) -> BackendResult<Option<SweepRecord>> {
        Ok(self.state.lock().sweeps.get(sweep_id).cloned())
    }

    async fn register_agent(
        &self,
        host: &str,
        sweep_id: &str,
        _project: &str,
        _entity: &str,
    ) -> BackendResult<AgentConfig> {
        let mut state = self.state.lock();
        let id = format!("agent-{}", state.agents.len());
        state.agents.push(host.to_string());
        info!(agent = %id, host, sweep = sweep_id, "registered agent");
        Ok(AgentConfig { id })
    }

    async fn agent_heartbeat(
        &self,
        _agent_id: &str,
        _run_states: &BTreeMap<String, bool>,
    ) -> BackendResult<Vec<Value>> {
        let mut state = self.state.lock();
        state.heartbeat_calls += 1;
        Ok(state.heartbeats.pop_front().unwrap_or_default())
    }

    async fn get_run_state(
        &self,
        _entity: &str,
        _project: &str,
        run_id: &str,
    ) -> BackendResult<String> {
        let state = self.state.lock();
        if state.unreachable_runs.contains(run_id) {
            return Err(BackendError::Communication {
                message: format!("connection reset while fetching {run_id}"),
            });
        }
        // Runs nobody scripted are still running.
        Ok(state
            .run_states
            .get(run_id)
            .cloned()
            .unwrap_or_else(|| "running".to_string()))
    }

    async fn stop_run(&self, run_id: &str) -> BackendResult<bool> {
        let mut state = self.state.lock();
        state.stopped.push(run_id.to_string());
        state
            .run_states
            .insert(run_id.to_string(), "killed".to_string());
        Ok(true)
    }

    async fn upsert_run(&self, request: UpsertRun) -> BackendResult<RunRecord> {
        let mut state = self.state.lock();
        let n = state.upserted.len();
        state.upserted.push(request);
        Ok(RunRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: format!("run-{n:04}"),
        })
    }

    async fn run_metric_history(
        &self,
        _entity: &str,
        _project: &str,
        run_id: &str,
        _metric: &str,
        since: usize,
    ) -> BackendResult<Vec<f64>> {
        Ok(self
            .state
            .lock()
            .metrics
            .get(run_id)
            .map(|values| values.iter().skip(since).copied().collect())
            .unwrap_or_default())
    }

    async fn job_exists(&self, _entity: &str, _project: &str, job: &str) -> BackendResult<bool> {
        let state = self.state.lock();
        let bare = job.split(':').next().unwrap_or(job);
        Ok(state.jobs.contains(job) || state.jobs.contains(bare))
    }

    async fn log_artifact(
        &self,
        _entity: &str,
        _project: &str,
        artifact: ArtifactSpec,
    ) -> BackendResult<()> {
        let contents = std::fs::read(&artifact.path)?;
        let file_name = artifact
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("artifact")
            .to_string();

        let mut state = self.state.lock();
        state
            .artifacts
            .insert(artifact.name.clone(), vec![(file_name, contents)]);
        state.logged_artifacts.push(artifact);
        Ok(())
    }

    async fn download_artifact(
        &self,
        _entity: &str,
        _project: &str,
        name: &str,
        dest: &Path,
    ) -> BackendResult<PathBuf> {
        let bare = name.split(':').next().unwrap_or(name);
        let files = self
            .state
            .lock()
            .artifacts
            .get(bare)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("artifact {name}")))?;

        std::fs::create_dir_all(dest)?;
        for (file_name, contents) in files {
            std::fs::write(dest.join(file_name), contents)?;
        }
        Ok(dest.to_path_buf())
    }
}

#[async_trait]
impl LaunchQueue for MemoryBackend {
    async fn submit(&self, request: LaunchRequest) -> BackendResult<QueuedRun> {
        let mut state = self.state.lock();
        if state.failing_submissions > 0 {
            state.failing_submissions -= 1;
            return Err(BackendError::Http {
                status: 500,
                message: format!("queue {} rejected run {}", request.queue, request.run_id),
            });
        }

        let queued = QueuedRun {
            id: format!("queue-item-{}", state.submissions.len()),
            entity: request.entity.clone(),
            project_queue: request.project_queue.clone(),
            queue: request.queue.clone(),
            run_id: request.run_id.clone(),
        };
        state
            .queue_status
            .insert(queued.id.clone(), QueuedRunStatus::Pending);
        state.submissions.push(request);
        Ok(queued)
    }

    async fn status(&self, queued: &QueuedRun) -> BackendResult<QueuedRunStatus> {
        self.state
            .lock()
            .queue_status
            .get(&queued.id)
            .copied()
            .ok_or_else(|| BackendError::NotFound(format!("queue item {}", queued.id)))
    }
}
