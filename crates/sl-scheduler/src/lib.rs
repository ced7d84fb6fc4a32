//! # sweepline
//!
//! Hyperparameter-sweep scheduler. A [`Scheduler`] owns the runs of one
//! sweep, reconciles them against the tracking backend every iteration, and
//! lets a [`SweepStrategy`] decide which trials to launch on the launch
//! queue and which to stop.

pub mod command;
pub mod context;
pub mod entrypoint;
pub mod heartbeat;
pub mod launch;
pub mod reconcile;
pub mod runs;
pub mod scheduler;
pub mod strategy;

pub use command::CommandConvention;
pub use context::SchedulerContext;
pub use entrypoint::construct_scheduler_entrypoint;
pub use heartbeat::AgentCommand;
pub use launch::Executable;
pub use reconcile::{reconcile, Reconciliation};
pub use runs::RunTable;
pub use scheduler::Scheduler;
pub use strategy::{HeartbeatStrategy, StrategyKind, StudyStrategy, SweepStrategy};
