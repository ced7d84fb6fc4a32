//! Name → constructor tables for pruners and samplers.

use serde::{Deserialize, Serialize};
use sl_types::{ComponentArgs, SchedulerError, StudyError, SweepResult};
use std::path::Path;
use tracing::info;

use crate::pruners::{
    HyperbandPruner, NopPruner, PercentilePruner, Pruner, SuccessiveHalvingPruner,
    ThresholdPruner,
};
use crate::search::{BayesianSampler, GridSampler, RandomSampler, Sampler};

/// Pruner used when the sweep config names none.
pub fn default_pruner() -> Box<dyn Pruner> {
    Box::new(PercentilePruner::median())
}

/// Sampler used when the sweep config names none.
pub fn default_sampler() -> Box<dyn Sampler> {
    Box::new(BayesianSampler::new(0.3, None))
}

fn unsupported(kind: &str, name: &str) -> SchedulerError {
    SchedulerError::UnsupportedComponent {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

/// Build a pruner from its `{type, ...}` block.
pub fn pruner_from_args(args: &ComponentArgs) -> SweepResult<Box<dyn Pruner>> {
    info!(pruner = %args.kind, "configuring pruner");
    let pruner: Box<dyn Pruner> = match args.kind.as_str() {
        "NopPruner" => Box::new(NopPruner),
        "MedianPruner" => Box::new(percentile_from_args(args, 50.0)),
        "PercentilePruner" => {
            let percentile = args.get_f64("percentile").ok_or_else(|| StudyError::InvalidParameter {
                parameter: "percentile".to_string(),
                message: "PercentilePruner requires a percentile".to_string(),
            })?;
            Box::new(percentile_from_args(args, percentile))
        }
        "ThresholdPruner" => {
            let pruner = ThresholdPruner {
                lower: args.get_f64("lower"),
                upper: args.get_f64("upper"),
                n_warmup_steps: args.get_u64("n_warmup_steps").unwrap_or(0),
            };
            if pruner.lower.is_none() && pruner.upper.is_none() {
                return Err(StudyError::InvalidParameter {
                    parameter: "lower".to_string(),
                    message: "ThresholdPruner requires lower or upper".to_string(),
                }
                .into());
            }
            Box::new(pruner)
        }
        "SuccessiveHalvingPruner" => Box::new(SuccessiveHalvingPruner {
            min_resource: args.get_u64("min_resource").unwrap_or(1),
            reduction_factor: reduction_factor(args)?,
            min_early_stopping_rate: args
                .get_u64("min_early_stopping_rate")
                .unwrap_or(0) as u32,
        }),
        "HyperbandPruner" => Box::new(HyperbandPruner {
            min_resource: args.get_u64("min_resource").unwrap_or(1),
            // `epochs` is the name sweep configs use for the budget.
            max_resource: args
                .get_u64("max_resource")
                .or_else(|| args.get_u64("epochs")),
            reduction_factor: reduction_factor(args)?,
        }),
        other => return Err(unsupported("Pruner", other).into()),
    };
    Ok(pruner)
}

fn percentile_from_args(args: &ComponentArgs, percentile: f64) -> PercentilePruner {
    let mut pruner = PercentilePruner::new(percentile);
    if let Some(n) = args.get_u64("n_startup_trials") {
        pruner = pruner.with_startup_trials(n as usize);
    }
    if let Some(n) = args.get_u64("n_warmup_steps") {
        pruner = pruner.with_warmup_steps(n);
    }
    if let Some(n) = args.get_u64("interval_steps") {
        pruner = pruner.with_interval_steps(n);
    }
    pruner
}

fn reduction_factor(args: &ComponentArgs) -> SweepResult<u64> {
    let factor = args.get_u64("reduction_factor").unwrap_or(3);
    if factor < 2 {
        return Err(StudyError::InvalidParameter {
            parameter: "reduction_factor".to_string(),
            message: format!("must be at least 2, got {factor}"),
        }
        .into());
    }
    Ok(factor)
}

/// Build a sampler from its `{type, ...}` block.
pub fn sampler_from_args(args: &ComponentArgs) -> SweepResult<Box<dyn Sampler>> {
    info!(sampler = %args.kind, "configuring sampler");
    let seed = args.get_u64("seed");
    let sampler: Box<dyn Sampler> = match args.kind.as_str() {
        "RandomSampler" => Box::new(RandomSampler::new(seed)),
        "GridSampler" => Box::new(GridSampler::new(
            args.get_u64("float_steps").unwrap_or(5) as usize,
        )),
        "BayesianSampler" | "TPESampler" => Box::new(BayesianSampler::new(
            args.get_f64("exploration_weight").unwrap_or(0.3),
            seed,
        )),
        other => return Err(unsupported("Sampler", other).into()),
    };
    Ok(sampler)
}

/// A user-supplied optimizer configuration, shipped as `optimizer.json`
/// inside an artifact. Its components supersede the sweep config's.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomOptimizer {
    #[serde(default)]
    pub pruner: Option<ComponentArgs>,
    #[serde(default)]
    pub sampler: Option<ComponentArgs>,
    #[serde(default)]
    pub direction: Option<String>,
}

impl CustomOptimizer {
    pub const FILE_NAME: &'static str = "optimizer.json";

    /// Read `optimizer.json` from a downloaded artifact directory.
    pub fn load(dir: &Path) -> SweepResult<Self> {
        let raw = std::fs::read_to_string(dir.join(Self::FILE_NAME))?;
        Ok(serde_json::from_str(&raw)?)
    }
}
