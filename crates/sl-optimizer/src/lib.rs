//! # sl-optimizer
//!
//! Local ask/tell/prune study for sweepline's optimization-driven scheduler.
//!
//! Provides search spaces derived from sweep parameters, samplers (grid,
//! random, Bayesian), early-stopping pruners, name-based registries for both,
//! and SQLite persistence so a study survives scheduler restarts.

mod pruners;
mod registry;
mod search;
mod store;
mod study;
mod trial;

pub use pruners::{
    HyperbandPruner, NopPruner, PercentilePruner, Pruner, SuccessiveHalvingPruner,
    ThresholdPruner,
};
pub use registry::{
    default_pruner, default_sampler, pruner_from_args, sampler_from_args, CustomOptimizer,
};
pub use search::{
    BayesianSampler, GridSampler, ParameterDef, ParameterKind, ParameterValue, Params,
    RandomSampler, Sampler, SearchSpace,
};
pub use store::StudyStore;
pub use study::{LocalStudy, Study};
pub use trial::{
    format_trials, ObjectiveDirection, StudySummary, TrialHandle, TrialRecord, TrialState,
};
