//! Run-generation strategies.

use async_trait::async_trait;
use sl_types::{config_error, SweepResult};

use crate::context::SchedulerContext;

pub mod heartbeat;
pub mod study;

pub use heartbeat::HeartbeatStrategy;
pub use study::StudyStrategy;

/// Decides which trials to start and when to stop them.
///
/// The control loop calls `load_state` and `start` once, `run` every
/// iteration after reconciliation, and `exit` then `save_state` once on the
/// way out.
#[async_trait]
pub trait SweepStrategy: Send {
    fn name(&self) -> &str;

    /// Restore persisted state before the first iteration.
    async fn load_state(&mut self, _ctx: &mut SchedulerContext) -> SweepResult<()> {
        Ok(())
    }

    async fn start(&mut self, ctx: &mut SchedulerContext) -> SweepResult<()>;

    async fn run(&mut self, ctx: &mut SchedulerContext) -> SweepResult<()>;

    async fn exit(&mut self, _ctx: &mut SchedulerContext) -> SweepResult<()> {
        Ok(())
    }

    async fn save_state(&mut self, _ctx: &mut SchedulerContext) -> SweepResult<()> {
        Ok(())
    }
}

/// Built-in strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// The backend suggests trials through agent heartbeats.
    Heartbeat,
    /// A local study suggests trials and prunes them.
    Study,
}

impl StrategyKind {
    pub fn from_name(name: &str) -> SweepResult<Self> {
        match name {
            "sweep" => Ok(Self::Heartbeat),
            "optuna" | "study" => Ok(Self::Study),
            other => Err(config_error!("unknown scheduler strategy: {other}")),
        }
    }

    /// Pick the strategy for a sweep `method`. Methods the backend handles
    /// itself (grid, random, bayes) go through heartbeats.
    pub fn from_method(method: Option<&str>) -> Self {
        match method {
            Some("optuna") | Some("study") => Self::Study,
            _ => Self::Heartbeat,
        }
    }
}

/// Host part of agent labels.
pub(crate) fn host_label() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
