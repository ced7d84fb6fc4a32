//! Backend-driven trial suggestion over agent heartbeats.

use async_trait::async_trait;
use sl_types::{SchedulerState, SweepResult, SweepRun};
use tracing::{debug, info, warn};

use super::{host_label, SweepStrategy};
use crate::context::SchedulerContext;
use crate::heartbeat::AgentCommand;

/// Polls one agent heartbeat per free worker and launches whatever run the
/// backend hands out.
#[derive(Debug, Default)]
pub struct HeartbeatStrategy;

impl HeartbeatStrategy {
    pub fn new() -> Self {
        Self
    }

    /// Apply one heartbeat reply to `worker_id`. Returns `false` once the
    /// sweep has been stopped.
    async fn apply(
        &mut self,
        ctx: &mut SchedulerContext,
        worker_id: usize,
        commands: Vec<AgentCommand>,
    ) -> SweepResult<bool> {
        let mut assigned = false;
        for command in commands {
            match command {
                AgentCommand::Run {
                    run_id,
                    args,
                    program,
                } => {
                    if ctx.runs().contains(&run_id) {
                        debug!(run_id = %run_id, "run already tracked, ignoring heartbeat command");
                        continue;
                    }
                    if ctx.at_run_cap() {
                        debug!(run_id = %run_id, "at run cap, ignoring heartbeat command");
                        continue;
                    }
                    if assigned {
                        warn!(run_id = %run_id, worker = worker_id, "worker already assigned this round, ignoring run");
                        continue;
                    }

                    let run = SweepRun::new(run_id, worker_id, args).with_program(program);
                    ctx.launch_run(run).await?;
                    assigned = true;
                }
                AgentCommand::Stop { run_cap } => {
                    if run_cap.is_some() {
                        ctx.set_run_cap(run_cap);
                    }
                    info!(sweep = %ctx.config().sweep_id, "backend requested sweep stop");
                    ctx.set_state(SchedulerState::Stopped);
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl SweepStrategy for HeartbeatStrategy {
    fn name(&self) -> &str {
        "sweep"
    }

    async fn start(&mut self, ctx: &mut SchedulerContext) -> SweepResult<()> {
        ctx.register_agents(&host_label()).await
    }

    async fn run(&mut self, ctx: &mut SchedulerContext) -> SweepResult<()> {
        for worker_id in ctx.available_workers() {
            if ctx.at_run_cap() {
                debug!(launched = ctx.num_runs_launched(), "sweep at run cap");
                break;
            }
            let Some(agent_id) = ctx
                .workers()
                .iter()
                .find(|w| w.id == worker_id)
                .map(|w| w.agent_id.clone())
            else {
                continue;
            };

            let liveness = ctx.runs().liveness();
            let raw = ctx.backend().agent_heartbeat(&agent_id, &liveness).await?;
            debug!(worker = worker_id, commands = raw.len(), "agent heartbeat");
            let commands = AgentCommand::parse_all(&raw)?;

            if !self.apply(ctx, worker_id, commands).await? {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sl_backend::{MemoryBackend, SweepRecord};
    use sl_types::{SchedulerConfig, SweepConfig};
    use std::sync::Arc;

    async fn started(backend: &Arc<MemoryBackend>, num_workers: usize) -> SchedulerContext {
        let config = SchedulerConfig::new("sweep", "e", "p")
            .with_image_uri("image")
            .with_num_workers(num_workers);
        let sweep = SweepRecord {
            id: "record".into(),
            name: "sweep".into(),
            config: String::new(),
            state: "RUNNING".into(),
        };
        let mut ctx =
            SchedulerContext::new(config, sweep, SweepConfig::default(), backend.clone(), backend.clone());
        ctx.resolve_executable().await.unwrap();
        HeartbeatStrategy::new().start(&mut ctx).await.unwrap();
        ctx
    }

    #[tokio::test]
    async fn registers_one_agent_per_worker() {
        let backend = Arc::new(MemoryBackend::new());
        let ctx = started(&backend, 3).await;
        assert_eq!(ctx.workers().len(), 3);
        assert_eq!(backend.agents().len(), 3);
        assert!(backend.agents()[2].ends_with("-2"));
    }

    #[tokio::test]
    async fn launches_run_commands() {
        let backend = Arc::new(MemoryBackend::new());
        let mut ctx = started(&backend, 2).await;
        backend.push_heartbeat(vec![json!({
            "type": "run",
            "run_id": "mock-run-id-1",
            "args": {"foo_arg": {"value": 1}},
        })]);

        HeartbeatStrategy::new().run(&mut ctx).await.unwrap();

        assert_eq!(ctx.num_runs_launched(), 1);
        let run = ctx.runs().get("mock-run-id-1").unwrap();
        assert_eq!(run.worker_id, 0);
        assert!(run.was_submitted());
        assert_eq!(backend.submissions()[0].overrides.args, vec!["--foo_arg=1".to_string()]);
    }

    #[tokio::test]
    async fn repeated_run_id_is_not_relaunched() {
        let backend = Arc::new(MemoryBackend::new());
        let mut ctx = started(&backend, 2).await;
        let command = json!({"type": "run", "run_id": "same"});
        backend.push_heartbeat(vec![command.clone()]);
        backend.push_heartbeat(vec![command]);

        HeartbeatStrategy::new().run(&mut ctx).await.unwrap();

        assert_eq!(backend.heartbeat_calls(), 2);
        assert_eq!(backend.submissions().len(), 1);
        assert_eq!(ctx.runs().len(), 1);
    }

    #[tokio::test]
    async fn stop_applies_run_cap() {
        let backend = Arc::new(MemoryBackend::new());
        let mut ctx = started(&backend, 2).await;
        backend.push_heartbeat(vec![json!({"type": "stop", "run_cap": 7})]);

        HeartbeatStrategy::new().run(&mut ctx).await.unwrap();

        assert_eq!(ctx.state(), SchedulerState::Stopped);
        assert_eq!(ctx.run_cap(), Some(7));
        assert_eq!(backend.heartbeat_calls(), 1);
    }

    #[tokio::test]
    async fn protocol_violations_are_errors() {
        let backend = Arc::new(MemoryBackend::new());
        let mut ctx = started(&backend, 1).await;
        backend.push_heartbeat(vec![json!({"type": "foo"})]);

        let err = HeartbeatStrategy::new().run(&mut ctx).await.unwrap_err();
        assert!(err.to_string().contains("unknown command"));
        assert_eq!(backend.submissions().len(), 0);
    }
}
