//! Run, worker, and scheduler lifecycle types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Local view of a trial's liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Alive,
    Dead,
    Unknown,
}

impl RunState {
    /// Map a backend run status string to a local state.
    ///
    /// Returns `None` for statuses the backend has not documented; callers
    /// treat those like a failed lookup.
    pub fn from_remote(status: &str) -> Option<Self> {
        match status {
            "finished" | "crashed" | "failed" | "killed" | "preempted" => Some(Self::Dead),
            "running" | "pending" | "preempting" => Some(Self::Alive),
            _ => None,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alive => write!(f, "alive"),
            Self::Dead => write!(f, "dead"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Scheduler lifecycle. `Pending` and `Running` are the only live states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
    Cancelled,
}

impl SchedulerState {
    pub fn is_alive(&self) -> bool {
        match self {
            Self::Pending | Self::Running => true,
            Self::Completed | Self::Failed | Self::Stopped | Self::Cancelled => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_alive()
    }

    /// Process exit code for a scheduler that ended in this state.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed | Self::Stopped | Self::Cancelled => 0,
            Self::Pending | Self::Running | Self::Failed => 1,
        }
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// A single hyperparameter assignment, in the `{"value": ...}` shape the
/// backend uses for run configs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgValue {
    pub value: serde_json::Value,
}

impl ArgValue {
    pub fn new(value: impl Into<serde_json::Value>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

/// Hyperparameter name → value specification.
pub type RunArgs = BTreeMap<String, ArgValue>;

/// Handle returned by the launch queue after a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedRun {
    /// Queue item id assigned by the launch queue.
    pub id: String,
    pub entity: String,
    /// Project owning the queue the item was pushed to.
    pub project_queue: String,
    pub queue: String,
    /// Sweep run this item launches.
    pub run_id: String,
}

/// Status of a queued launch, as reported by the launch queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueuedRunStatus {
    Pending,
    Running,
    Finished,
    Failed,
}

impl QueuedRunStatus {
    pub fn from_remote(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "pending" | "leased" | "claimed" => Self::Pending,
            "running" => Self::Running,
            "finished" => Self::Finished,
            _ => Self::Failed,
        }
    }
}

/// One logical trial of the sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRun {
    pub id: String,
    pub state: RunState,
    /// Worker slot the run occupies.
    pub worker_id: usize,
    pub args: RunArgs,
    pub program: Option<String>,
    pub queued_run: Option<QueuedRun>,
    pub created_at: DateTime<Utc>,
}

impl SweepRun {
    pub fn new(id: impl Into<String>, worker_id: usize, args: RunArgs) -> Self {
        Self {
            id: id.into(),
            state: RunState::Alive,
            worker_id,
            args,
            program: None,
            queued_run: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_program(mut self, program: Option<String>) -> Self {
        self.program = program;
        self
    }

    pub fn with_state(mut self, state: RunState) -> Self {
        self.state = state;
        self
    }

    pub fn with_queued_run(mut self, queued_run: QueuedRun) -> Self {
        self.queued_run = Some(queued_run);
        self
    }

    /// Whether the launch queue ever accepted this run.
    pub fn was_submitted(&self) -> bool {
        self.queued_run.is_some()
    }
}

/// A launch slot, bound to one backend agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub id: usize,
    pub agent_id: String,
}
