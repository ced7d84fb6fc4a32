//! Scheduler-owned state and the operations strategies act through.

use sl_backend::{LaunchQueue, SweepBackend, SweepRecord};
use sl_types::{
    RunState, SchedulerConfig, SchedulerError, SchedulerState, SweepConfig, SweepResult, SweepRun,
    Worker,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::command::CommandConvention;
use crate::entrypoint::with_alias;
use crate::launch::{build_launch_request, Executable};
use crate::reconcile::{reconcile, Reconciliation};
use crate::runs::RunTable;

/// Everything the control loop owns for one scheduler instance.
///
/// Strategies get `&mut SchedulerContext` for the duration of a hook and
/// change runs only through its methods, which keep the worker partition
/// and the run cap consistent.
pub struct SchedulerContext {
    config: SchedulerConfig,
    sweep: SweepRecord,
    sweep_config: SweepConfig,
    backend: Arc<dyn SweepBackend>,
    queue: Arc<dyn LaunchQueue>,
    convention: CommandConvention,
    state: SchedulerState,
    runs: RunTable,
    workers: Vec<Worker>,
    executable: Option<Executable>,
    num_runs_launched: usize,
    run_cap: Option<usize>,
    exit_requested: bool,
}

impl SchedulerContext {
    pub fn new(
        config: SchedulerConfig,
        sweep: SweepRecord,
        sweep_config: SweepConfig,
        backend: Arc<dyn SweepBackend>,
        queue: Arc<dyn LaunchQueue>,
    ) -> Self {
        let run_cap = config.run_cap.or(sweep_config.run_cap);
        let runs = RunTable::new(config.num_workers);
        Self {
            config,
            sweep,
            sweep_config,
            backend,
            queue,
            convention: CommandConvention::default(),
            state: SchedulerState::Pending,
            runs,
            workers: Vec::new(),
            executable: None,
            num_runs_launched: 0,
            run_cap,
            exit_requested: false,
        }
    }

    pub fn with_convention(mut self, convention: CommandConvention) -> Self {
        self.convention = convention;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn sweep(&self) -> &SweepRecord {
        &self.sweep
    }

    pub fn sweep_config(&self) -> &SweepConfig {
        &self.sweep_config
    }

    pub fn backend(&self) -> &Arc<dyn SweepBackend> {
        &self.backend
    }

    pub fn queue(&self) -> &Arc<dyn LaunchQueue> {
        &self.queue
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn set_state(&mut self, state: SchedulerState) {
        if self.state != state {
            info!(sweep = %self.config.sweep_id, from = %self.state, to = %state, "scheduler state changed");
            self.state = state;
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state.is_alive()
    }

    pub fn runs(&self) -> &RunTable {
        &self.runs
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn busy_workers(&self) -> Vec<usize> {
        self.runs.busy_workers().into_iter().collect()
    }

    pub fn available_workers(&self) -> Vec<usize> {
        self.runs.available_workers()
    }

    pub fn num_runs_launched(&self) -> usize {
        self.num_runs_launched
    }

    pub fn run_cap(&self) -> Option<usize> {
        self.run_cap
    }

    pub fn set_run_cap(&mut self, run_cap: Option<usize>) {
        if run_cap != self.run_cap {
            info!(sweep = %self.config.sweep_id, ?run_cap, "run cap updated");
            self.run_cap = run_cap;
        }
    }

    pub fn at_run_cap(&self) -> bool {
        matches!(self.run_cap, Some(cap) if self.num_runs_launched >= cap)
    }

    pub fn executable(&self) -> Option<&Executable> {
        self.executable.as_ref()
    }

    /// Ask the loop to leave without a terminal state. The loop treats this
    /// as abnormal and ends FAILED.
    pub fn request_exit(&mut self) {
        self.exit_requested = true;
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested
    }

    /// How long the loop waits before its next iteration.
    pub fn poll_sleep(&self) -> Duration {
        if self.runs.is_empty() {
            self.config.queue_sleep
        } else {
            self.config.polling_sleep
        }
    }

    /// Work out what trials run. A job from the scheduler config wins over
    /// the sweep config's and must exist on the backend; an image is taken
    /// as is.
    pub async fn resolve_executable(&mut self) -> SweepResult<Executable> {
        let job = self.config.job.clone().or_else(|| self.sweep_config.job.clone());
        let image = self
            .config
            .image_uri
            .clone()
            .or_else(|| self.sweep_config.image_uri.clone());

        let executable = match (job, image) {
            (Some(job), _) => {
                let job = with_alias(&job);
                let exists = self
                    .backend
                    .job_exists(&self.config.entity, &self.config.project, &job)
                    .await?;
                if !exists {
                    return Err(SchedulerError::ExecutableNotFound {
                        message: format!("job {job} not found"),
                    }
                    .into());
                }
                Executable::Job(job)
            }
            (None, Some(image)) => Executable::Image(image),
            (None, None) => {
                return Err(SchedulerError::ExecutableNotFound {
                    message: "neither a job nor an image_uri is configured".into(),
                }
                .into())
            }
        };

        info!(sweep = %self.config.sweep_id, %executable, "resolved executable");
        self.executable = Some(executable.clone());
        Ok(executable)
    }

    /// Register one backend agent per worker slot.
    pub async fn register_agents(&mut self, host: &str) -> SweepResult<()> {
        for worker_id in 0..self.config.num_workers {
            let agent = self
                .backend
                .register_agent(
                    &format!("{host}-{worker_id}"),
                    &self.config.sweep_id,
                    &self.config.project,
                    &self.config.entity,
                )
                .await?;
            debug!(worker = worker_id, agent = %agent.id, "registered worker");
            self.workers.push(Worker {
                id: worker_id,
                agent_id: agent.id,
            });
        }
        Ok(())
    }

    /// Submit `run` to the launch queue and track it.
    ///
    /// Returns `Ok(true)` only when the queue accepted it. Nothing is
    /// tracked when the run cap is reached, the id is already tracked, or
    /// the worker slot is taken. The run enters the table only once the
    /// queue has answered, so a submission dropped mid-flight leaves no
    /// handle-less ALIVE run behind. A rejected submission is tracked DEAD
    /// and the next reconciliation frees its worker.
    pub async fn launch_run(&mut self, mut run: SweepRun) -> SweepResult<bool> {
        if self.at_run_cap() {
            debug!(run_id = %run.id, "at run cap, not launching");
            return Ok(false);
        }
        if self.runs.contains(&run.id) {
            debug!(run_id = %run.id, "run already tracked, ignoring launch");
            return Ok(false);
        }
        if !self.available_workers().contains(&run.worker_id) {
            warn!(run_id = %run.id, worker = run.worker_id, "worker not available, ignoring launch");
            return Ok(false);
        }
        let Some(executable) = self.executable.clone() else {
            return Err(SchedulerError::ExecutableNotFound {
                message: "executable was never resolved".into(),
            }
            .into());
        };

        let template = self.sweep_config.command_tokens();
        let request =
            build_launch_request(&self.config, &executable, &self.convention, &template, &run);

        match self.queue.submit(request).await {
            Ok(queued) => {
                run.queued_run = Some(queued);
                self.num_runs_launched += 1;
                info!(
                    run_id = %run.id,
                    worker = run.worker_id,
                    launched = self.num_runs_launched,
                    run_cap = ?self.run_cap,
                    "launched run"
                );
                self.runs.register(run);
                Ok(true)
            }
            Err(e) => {
                error!(run_id = %run.id, error = %e, "failed to submit run to launch queue");
                run.state = RunState::Dead;
                self.runs.register(run);
                Ok(false)
            }
        }
    }

    /// Stop a tracked run that was submitted. Returns `false` for unknown
    /// runs and runs the queue never accepted.
    pub async fn stop_run(&mut self, run_id: &str) -> bool {
        match self.runs.get(run_id) {
            None => {
                debug!(run_id, "stop requested for unknown run");
                return false;
            }
            Some(run) if !run.was_submitted() => {
                debug!(run_id, "stop requested for run that was never submitted");
                return false;
            }
            Some(_) => {}
        }

        match self.backend.stop_run(run_id).await {
            Ok(true) => info!(run_id, "stopped run"),
            Ok(false) => warn!(run_id, "backend declined to stop run"),
            Err(e) => warn!(run_id, error = %e, "failed to stop run"),
        }
        self.runs.set_state(run_id, RunState::Dead);
        true
    }

    /// Stop every submitted run that is not known to be DEAD. UNKNOWN runs
    /// are included since they may still hold compute.
    pub async fn stop_live_runs(&mut self) {
        let live: Vec<String> = self
            .runs
            .iter()
            .filter(|run| run.state != RunState::Dead && run.was_submitted())
            .map(|run| run.id.clone())
            .collect();
        for run_id in live {
            self.stop_run(&run_id).await;
        }
    }

    pub async fn reconcile(&mut self) -> Reconciliation {
        reconcile(
            self.backend.as_ref(),
            &self.config.entity,
            &self.config.project,
            &mut self.runs,
        )
        .await
    }
}
