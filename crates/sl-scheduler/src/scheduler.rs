//! The scheduler control loop.

use sl_backend::{LaunchQueue, SweepBackend};
use sl_types::{SchedulerConfig, SchedulerError, SchedulerState, SweepConfig, SweepResult};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::SchedulerContext;
use crate::strategy::{HeartbeatStrategy, StrategyKind, StudyStrategy, SweepStrategy};

/// Drives one sweep from PENDING to a terminal state.
pub struct Scheduler {
    ctx: SchedulerContext,
    strategy: Box<dyn SweepStrategy>,
    cancel: CancellationToken,
    exited: bool,
}

impl Scheduler {
    /// Look the sweep up on the backend and pick a strategy, by name when
    /// the config gives one and from the sweep's method otherwise. Fails
    /// when the sweep does not exist or the strategy name is unknown.
    pub async fn new(
        backend: Arc<dyn SweepBackend>,
        queue: Arc<dyn LaunchQueue>,
        config: SchedulerConfig,
    ) -> SweepResult<Self> {
        let sweep = backend
            .sweep(&config.entity, &config.project, &config.sweep_id)
            .await?
            .ok_or_else(|| SchedulerError::SweepNotFound {
                sweep_id: config.sweep_id.clone(),
                entity: config.entity.clone(),
                project: config.project.clone(),
            })?;
        let sweep_config = SweepConfig::from_yaml(&sweep.config)?;

        let kind = match config.strategy.as_deref() {
            Some(name) => StrategyKind::from_name(name)?,
            None => StrategyKind::from_method(sweep_config.method.as_deref()),
        };
        let strategy: Box<dyn SweepStrategy> = match kind {
            StrategyKind::Heartbeat => Box::new(HeartbeatStrategy::new()),
            StrategyKind::Study => Box::new(StudyStrategy::new(default_work_dir(&config.sweep_id))),
        };
        info!(
            sweep = %config.sweep_id,
            entity = %config.entity,
            project = %config.project,
            strategy = strategy.name(),
            num_workers = config.num_workers,
            "scheduler created"
        );

        Ok(Self {
            ctx: SchedulerContext::new(config, sweep, sweep_config, backend, queue),
            strategy,
            cancel: CancellationToken::new(),
            exited: false,
        })
    }

    /// Replace the strategy picked at construction.
    pub fn with_strategy(mut self, strategy: Box<dyn SweepStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Cancelling this token stops the loop; the scheduler ends STOPPED.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SchedulerState {
        self.ctx.state()
    }

    pub fn set_state(&mut self, state: SchedulerState) {
        self.ctx.set_state(state);
    }

    pub fn is_alive(&self) -> bool {
        self.ctx.is_alive()
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut SchedulerContext {
        &mut self.ctx
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Run the scheduler until it reaches a terminal state.
    ///
    /// Cancellation ends STOPPED and returns `Ok`. Any other error ends
    /// FAILED, runs cleanup, and is returned.
    pub async fn start(&mut self) -> SweepResult<()> {
        if self.ctx.state() != SchedulerState::Pending {
            warn!(state = %self.ctx.state(), "scheduler not pending, refusing to start");
            self.ctx.set_state(SchedulerState::Failed);
            return Ok(());
        }

        if let Err(e) = self.ctx.resolve_executable().await {
            error!(error = %e, "failed to resolve executable");
            self.ctx.set_state(SchedulerState::Failed);
            self.exit().await;
            return Ok(());
        }

        self.ctx.set_state(SchedulerState::Running);
        let result = match self.setup().await {
            Ok(()) => self.run_loop().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.exit().await;
                Ok(())
            }
            Err(e) if e.is_cancellation() => {
                info!("scheduler interrupted");
                self.ctx.set_state(SchedulerState::Stopped);
                self.exit().await;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "scheduler failed");
                self.ctx.set_state(SchedulerState::Failed);
                self.exit().await;
                Err(e)
            }
        }
    }

    async fn setup(&mut self) -> SweepResult<()> {
        let cancel = self.cancel.clone();
        let ctx = &mut self.ctx;
        let strategy = &mut self.strategy;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SchedulerError::Cancelled.into()),
            result = async {
                strategy.load_state(ctx).await?;
                strategy.start(ctx).await
            } => result,
        }
    }

    async fn run_loop(&mut self) -> SweepResult<()> {
        let cancel = self.cancel.clone();
        while self.ctx.state() == SchedulerState::Running {
            let ctx = &mut self.ctx;
            let strategy = &mut self.strategy;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SchedulerError::Cancelled.into()),
                result = async {
                    ctx.reconcile().await;
                    strategy.run(ctx).await
                } => result?,
            }

            if self.ctx.exit_requested() {
                warn!("strategy requested exit");
                return Ok(());
            }

            if self.ctx.state() == SchedulerState::Running
                && self.ctx.at_run_cap()
                && self.ctx.runs().is_empty()
            {
                info!(launched = self.ctx.num_runs_launched(), "run cap reached and all runs done");
                self.ctx.set_state(SchedulerState::Completed);
                break;
            }

            if self.ctx.state() != SchedulerState::Running {
                break;
            }

            let sleep = self.ctx.poll_sleep();
            debug!(runs = self.ctx.runs().len(), sleep_ms = sleep.as_millis() as u64, "iteration done");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SchedulerError::Cancelled.into()),
                _ = tokio::time::sleep(sleep) => {}
            }
        }
        Ok(())
    }

    /// Tear down: strategy exit and checkpoint, then stop every live
    /// submitted run. A scheduler that gets here without a terminal state
    /// ends FAILED. Safe to call more than once.
    pub async fn exit(&mut self) {
        if self.exited {
            return;
        }
        self.exited = true;

        if let Err(e) = self.strategy.exit(&mut self.ctx).await {
            warn!(error = %e, "strategy exit failed");
        }
        if let Err(e) = self.strategy.save_state(&mut self.ctx).await {
            warn!(error = %e, "failed to save strategy state");
        }
        self.ctx.stop_live_runs().await;

        if self.ctx.is_alive() {
            self.ctx.set_state(SchedulerState::Failed);
        }
        info!(
            sweep = %self.ctx.config().sweep_id,
            state = %self.ctx.state(),
            launched = self.ctx.num_runs_launched(),
            "scheduler exited"
        );
    }
}

fn default_work_dir(sweep_id: &str) -> PathBuf {
    std::env::temp_dir().join("sweepline").join(sweep_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use sl_backend::MemoryBackend;
    use sl_types::{RunState, SweepError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_test::assert_ok;

    const GRID_SWEEP: &str = r#"
method: grid
metric:
  name: loss
parameters:
  foo_arg:
    values: [1, 2, 3]
"#;

    fn config(num_workers: usize) -> SchedulerConfig {
        SchedulerConfig::new("sweep-1", "entity", "project")
            .with_image_uri("image:latest")
            .with_num_workers(num_workers)
            .with_polling_sleep(Duration::ZERO)
            .with_queue_sleep(Duration::ZERO)
    }

    fn backend_with_sweep(yaml: &str) -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        backend.add_sweep("sweep-1", yaml);
        backend
    }

    async fn scheduler(backend: &Arc<MemoryBackend>, config: SchedulerConfig) -> Scheduler {
        Scheduler::new(backend.clone(), backend.clone(), config)
            .await
            .unwrap()
    }

    fn run_command(run_id: &str) -> serde_json::Value {
        json!({"type": "run", "run_id": run_id, "args": {"foo_arg": {"value": 1}}})
    }

    /// Counts iterations and runs a caller-supplied step.
    struct ScriptedStrategy<F> {
        iterations: Arc<AtomicUsize>,
        step: F,
    }

    #[async_trait]
    impl<F> SweepStrategy for ScriptedStrategy<F>
    where
        F: FnMut(&mut SchedulerContext) -> SweepResult<()> + Send + 'static,
    {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn start(&mut self, _ctx: &mut SchedulerContext) -> SweepResult<()> {
            Ok(())
        }

        async fn run(&mut self, ctx: &mut SchedulerContext) -> SweepResult<()> {
            self.iterations.fetch_add(1, Ordering::SeqCst);
            (self.step)(ctx)
        }
    }

    fn scripted<F>(step: F) -> (Box<dyn SweepStrategy>, Arc<AtomicUsize>)
    where
        F: FnMut(&mut SchedulerContext) -> SweepResult<()> + Send + 'static,
    {
        let iterations = Arc::new(AtomicUsize::new(0));
        let strategy = ScriptedStrategy {
            iterations: iterations.clone(),
            step,
        };
        (Box::new(strategy), iterations)
    }

    #[tokio::test]
    async fn picks_strategy_from_method() {
        let backend = backend_with_sweep(GRID_SWEEP);
        assert_eq!(scheduler(&backend, config(1)).await.strategy_name(), "sweep");

        let backend = backend_with_sweep("method: optuna\nmetric:\n  name: loss\n");
        assert_eq!(scheduler(&backend, config(1)).await.strategy_name(), "optuna");
    }

    #[tokio::test]
    async fn strategy_name_overrides_method() {
        let backend = backend_with_sweep(GRID_SWEEP);
        let named = scheduler(&backend, config(1).with_strategy("optuna")).await;
        assert_eq!(named.strategy_name(), "optuna");

        let err = Scheduler::new(backend.clone(), backend.clone(), config(1).with_strategy("ray"))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("unknown scheduler strategy"));
    }

    #[tokio::test]
    async fn run_cap_limits_submissions() {
        let backend = backend_with_sweep(GRID_SWEEP);
        for id in ["run-a", "run-b", "run-c"] {
            backend.push_heartbeat(vec![run_command(id)]);
            backend.set_run_state(id, "finished");
        }
        let mut scheduler = scheduler(&backend, config(3).with_run_cap(2)).await;

        assert_ok!(scheduler.start().await);

        assert_eq!(backend.submissions().len(), 2);
        assert!(scheduler.context().at_run_cap());
        assert_eq!(scheduler.context().num_runs_launched(), 2);
        assert_eq!(scheduler.state(), SchedulerState::Completed);
    }

    #[tokio::test]
    async fn unknown_sweep_fails_construction() {
        let backend = Arc::new(MemoryBackend::new());
        let err = Scheduler::new(backend.clone(), backend, config(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            SweepError::Scheduler(SchedulerError::SweepNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn stop_command_stops_the_scheduler() {
        let backend = backend_with_sweep(GRID_SWEEP);
        backend.push_heartbeat(vec![json!({"type": "stop"})]);
        let mut scheduler = scheduler(&backend, config(1)).await;

        assert_ok!(scheduler.start().await);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(!scheduler.is_alive());
    }

    #[tokio::test]
    async fn stop_after_repeated_run_commands() {
        let backend = backend_with_sweep(GRID_SWEEP);
        for _ in 0..10 {
            backend.push_heartbeat(vec![run_command("mock-run-id-1")]);
        }
        backend.push_heartbeat(vec![json!({"type": "stop", "run_cap": 7})]);
        backend.set_run_state("mock-run-id-1", "finished");
        let mut scheduler = scheduler(&backend, config(1)).await;

        assert_ok!(scheduler.start().await);

        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert_eq!(scheduler.context().run_cap(), Some(7));
        assert!(!scheduler.context().runs().contains("mock-run-id-1"));
        assert_eq!(scheduler.context().num_runs_launched(), 10);
        assert!(scheduler.context().at_run_cap());
    }

    #[tokio::test]
    async fn unknown_command_fails_the_scheduler() {
        let backend = backend_with_sweep(GRID_SWEEP);
        backend.push_heartbeat(vec![json!({"type": "foo"})]);
        let mut scheduler = scheduler(&backend, config(1)).await;

        let err = scheduler.start().await.unwrap_err();
        assert!(err.to_string().contains("unknown command"));
        assert_eq!(scheduler.state(), SchedulerState::Failed);
    }

    #[tokio::test]
    async fn run_without_id_fails_the_scheduler() {
        let backend = backend_with_sweep(GRID_SWEEP);
        backend.push_heartbeat(vec![json!({"type": "run"})]);
        let mut scheduler = scheduler(&backend, config(1)).await;

        let err = scheduler.start().await.unwrap_err();
        assert!(err.to_string().contains("No run id"));
        assert_eq!(scheduler.state(), SchedulerState::Failed);
    }

    #[tokio::test]
    async fn unreachable_runs_stay_tracked_as_unknown() {
        let backend = backend_with_sweep(GRID_SWEEP);
        backend.push_heartbeat(vec![run_command("run1")]);
        backend.push_heartbeat(vec![run_command("run2")]);
        backend.make_unreachable("run1");
        backend.make_unreachable("run2");
        let mut scheduler = scheduler(&backend, config(2)).await;

        let (strategy, iterations) = scripted(|ctx: &mut SchedulerContext| {
            if ctx.runs().iter().all(|run| run.state == RunState::Unknown) {
                ctx.set_state(SchedulerState::Completed);
            }
            Ok(())
        });
        // Launch through the heartbeat strategy first, then swap in the
        // scripted one for the reconciliation pass.
        scheduler.ctx.resolve_executable().await.unwrap();
        let mut heartbeat = HeartbeatStrategy::new();
        heartbeat.start(&mut scheduler.ctx).await.unwrap();
        heartbeat.run(&mut scheduler.ctx).await.unwrap();
        assert_eq!(scheduler.context().runs().len(), 2);

        scheduler.ctx.reconcile().await;
        let runs = scheduler.context().runs();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|run| run.state == RunState::Unknown));
        assert!(scheduler.context().available_workers().is_empty());

        let mut scheduler = scheduler.with_strategy(strategy);
        scheduler.ctx.set_state(SchedulerState::Pending);
        assert_ok!(scheduler.start().await);
        assert_eq!(iterations.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.context().runs().len(), 2);
    }

    #[tokio::test]
    async fn cancelled_before_start_fails_without_iterating() {
        let backend = backend_with_sweep(GRID_SWEEP);
        let mut scheduler = scheduler(&backend, config(1)).await;
        let (strategy, iterations) = scripted(|_: &mut SchedulerContext| Ok(()));
        let mut scheduler = scheduler.with_strategy(strategy);

        scheduler.set_state(SchedulerState::Cancelled);
        assert_ok!(scheduler.start().await);

        assert_eq!(scheduler.state(), SchedulerState::Failed);
        assert_eq!(iterations.load(Ordering::SeqCst), 0);
        assert_eq!(backend.heartbeat_calls(), 0);
    }

    #[tokio::test]
    async fn early_exit_is_a_failure() {
        let backend = backend_with_sweep(GRID_SWEEP);
        let scheduler = scheduler(&backend, config(1)).await;
        let (strategy, _) = scripted(|ctx: &mut SchedulerContext| {
            ctx.request_exit();
            Ok(())
        });
        let mut scheduler = scheduler.with_strategy(strategy);

        assert_ok!(scheduler.start().await);
        assert_eq!(scheduler.state(), SchedulerState::Failed);
    }

    #[tokio::test]
    async fn missing_executable_fails() {
        let backend = backend_with_sweep(GRID_SWEEP);
        let config = SchedulerConfig::new("sweep-1", "entity", "project").with_job("nope");
        let mut scheduler = scheduler(&backend, config).await;

        assert_ok!(scheduler.start().await);
        assert_eq!(scheduler.state(), SchedulerState::Failed);
        assert!(backend.agents().is_empty());
    }

    #[tokio::test]
    async fn job_from_scheduler_config_wins() {
        let backend = backend_with_sweep("method: grid\njob: sweep-job\n");
        backend.add_job("cli-job");
        backend.push_heartbeat(vec![json!({"type": "stop"})]);
        let config = SchedulerConfig::new("sweep-1", "entity", "project")
            .with_job("cli-job")
            .with_num_workers(1)
            .with_polling_sleep(Duration::ZERO)
            .with_queue_sleep(Duration::ZERO);
        let mut scheduler = scheduler(&backend, config).await;

        assert_ok!(scheduler.start().await);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert_eq!(
            scheduler.context().executable(),
            Some(&crate::launch::Executable::Job("cli-job:latest".into()))
        );
    }

    #[tokio::test]
    async fn strategy_error_fails_and_cleans_up() {
        let backend = backend_with_sweep(GRID_SWEEP);
        backend.push_heartbeat(vec![run_command("run-a")]);
        backend.push_heartbeat(vec![json!({"type": "bogus"})]);
        let mut scheduler = scheduler(&backend, config(2)).await;

        assert!(scheduler.start().await.is_err());
        assert_eq!(scheduler.state(), SchedulerState::Failed);
        assert_eq!(backend.stopped_runs(), vec!["run-a".to_string()]);

        // A second exit is a no-op.
        scheduler.exit().await;
        assert_eq!(backend.stopped_runs().len(), 1);
        assert_eq!(scheduler.state(), SchedulerState::Failed);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let backend = backend_with_sweep(GRID_SWEEP);
        let config = config(1)
            .with_polling_sleep(Duration::from_secs(3600))
            .with_queue_sleep(Duration::from_secs(3600));
        let mut scheduler = scheduler(&backend, config).await;
        let token = scheduler.cancellation_token();

        let handle = tokio::spawn(async move {
            let result = scheduler.start().await;
            (result, scheduler.state())
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        // The loop is parked in its hour-long idle sleep when cancelled.
        let (result, state) = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_ok!(result);
        assert_eq!(state, SchedulerState::Stopped);
        assert_eq!(backend.heartbeat_calls(), 1);
    }
}
