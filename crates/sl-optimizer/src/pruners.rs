//! Early-stopping rules applied to a trial's intermediate values.

use std::cmp::Ordering;

use crate::trial::{ObjectiveDirection, TrialRecord, TrialState};

/// Decides whether a running trial should stop early.
pub trait Pruner: Send + Sync {
    /// `trial` is the candidate, `trials` every trial in the study (the
    /// candidate included).
    fn prune(&self, trial: &TrialRecord, trials: &[TrialRecord], direction: ObjectiveDirection)
        -> bool;

    fn name(&self) -> &str;
}

/// Never prunes.
#[derive(Debug, Clone, Default)]
pub struct NopPruner;

impl Pruner for NopPruner {
    fn prune(&self, _: &TrialRecord, _: &[TrialRecord], _: ObjectiveDirection) -> bool {
        false
    }

    fn name(&self) -> &str {
        "NopPruner"
    }
}

// ---- Percentile / Median ----

/// Prunes when the trial's best intermediate value is worse than the given
/// percentile of completed trials at the same step.
#[derive(Debug, Clone)]
pub struct PercentilePruner {
    pub percentile: f64,
    pub n_startup_trials: usize,
    pub n_warmup_steps: u64,
    pub interval_steps: u64,
}

impl PercentilePruner {
    pub fn new(percentile: f64) -> Self {
        Self {
            percentile: percentile.clamp(0.0, 100.0),
            n_startup_trials: 5,
            n_warmup_steps: 0,
            interval_steps: 1,
        }
    }

    /// The median rule is the 50th percentile.
    pub fn median() -> Self {
        Self::new(50.0)
    }

    pub fn with_startup_trials(mut self, n: usize) -> Self {
        self.n_startup_trials = n;
        self
    }

    pub fn with_warmup_steps(mut self, n: u64) -> Self {
        self.n_warmup_steps = n;
        self
    }

    pub fn with_interval_steps(mut self, n: u64) -> Self {
        self.interval_steps = n.max(1);
        self
    }
}

/// Linear-interpolated percentile of an unsorted slice.
fn percentile_of(values: &mut [f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let rank = (q / 100.0) * (values.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(values[lo] + (values[hi] - values[lo]) * frac)
}

impl Pruner for PercentilePruner {
    fn prune(
        &self,
        trial: &TrialRecord,
        trials: &[TrialRecord],
        direction: ObjectiveDirection,
    ) -> bool {
        let Some(step) = trial.last_step() else {
            return false;
        };

        let completed: Vec<&TrialRecord> = trials
            .iter()
            .filter(|t| t.state == TrialState::Complete && t.number != trial.number)
            .collect();
        if completed.len() < self.n_startup_trials {
            return false;
        }
        if step < self.n_warmup_steps {
            return false;
        }
        if (step - self.n_warmup_steps) % self.interval_steps != 0 {
            return false;
        }

        let own = trial.intermediate_values.values().copied();
        let best = match direction {
            ObjectiveDirection::Minimize => own.fold(f64::INFINITY, f64::min),
            ObjectiveDirection::Maximize => own.fold(f64::NEG_INFINITY, f64::max),
        };
        if best.is_nan() {
            return true;
        }

        let mut at_step: Vec<f64> = completed
            .iter()
            .filter_map(|t| t.intermediate_values.get(&step).copied())
            .filter(|v| !v.is_nan())
            .collect();

        match direction {
            ObjectiveDirection::Minimize => percentile_of(&mut at_step, self.percentile)
                .map(|p| best > p)
                .unwrap_or(false),
            ObjectiveDirection::Maximize => percentile_of(&mut at_step, 100.0 - self.percentile)
                .map(|p| best < p)
                .unwrap_or(false),
        }
    }

    fn name(&self) -> &str {
        if (self.percentile - 50.0).abs() < f64::EPSILON {
            "MedianPruner"
        } else {
            "PercentilePruner"
        }
    }
}

// ---- Threshold ----

/// Prunes once the latest value leaves `[lower, upper]` or is NaN.
#[derive(Debug, Clone, Default)]
pub struct ThresholdPruner {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub n_warmup_steps: u64,
}

impl Pruner for ThresholdPruner {
    fn prune(&self, trial: &TrialRecord, _: &[TrialRecord], _: ObjectiveDirection) -> bool {
        let Some(step) = trial.last_step() else {
            return false;
        };
        if step < self.n_warmup_steps {
            return false;
        }
        let Some(value) = trial.intermediate_values.get(&step).copied() else {
            return false;
        };
        if value.is_nan() {
            return true;
        }
        self.lower.map(|lower| value < lower).unwrap_or(false)
            || self.upper.map(|upper| value > upper).unwrap_or(false)
    }

    fn name(&self) -> &str {
        "ThresholdPruner"
    }
}

// ---- Successive halving ----

/// Asynchronous successive halving.
///
/// Rung `r` sits at step `min_resource * reduction_factor^(min_early_stopping_rate + r)`.
/// When a trial reaches a rung it must rank in the top `1 / reduction_factor`
/// of every trial that reached the same rung, or it is pruned.
#[derive(Debug, Clone)]
pub struct SuccessiveHalvingPruner {
    pub min_resource: u64,
    pub reduction_factor: u64,
    pub min_early_stopping_rate: u32,
}

impl Default for SuccessiveHalvingPruner {
    fn default() -> Self {
        Self {
            min_resource: 1,
            reduction_factor: 3,
            min_early_stopping_rate: 0,
        }
    }
}

impl SuccessiveHalvingPruner {
    fn rung_step(&self, rung: u32) -> Option<u64> {
        self.reduction_factor
            .max(2)
            .checked_pow(self.min_early_stopping_rate + rung)
            .and_then(|scale| scale.checked_mul(self.min_resource.max(1)))
    }

    /// Value a trial recorded for a rung: its first reported step at or past
    /// the rung's step.
    fn rung_value(trial: &TrialRecord, rung_step: u64) -> Option<f64> {
        trial
            .intermediate_values
            .range(rung_step..)
            .next()
            .map(|(_, v)| *v)
    }

    fn promotable(
        value: f64,
        mut competing: Vec<f64>,
        reduction_factor: u64,
        direction: ObjectiveDirection,
    ) -> bool {
        competing.sort_by(|a, b| {
            let ord = a.partial_cmp(b).unwrap_or(Ordering::Equal);
            match direction {
                ObjectiveDirection::Minimize => ord,
                ObjectiveDirection::Maximize => ord.reverse(),
            }
        });
        let idx = (competing.len() / reduction_factor.max(1) as usize).saturating_sub(1);
        let Some(threshold) = competing.get(idx).copied() else {
            return true;
        };
        match direction {
            ObjectiveDirection::Minimize => value <= threshold,
            ObjectiveDirection::Maximize => value >= threshold,
        }
    }

    pub(crate) fn prune_among<'a>(
        &self,
        trial: &TrialRecord,
        peers: impl Iterator<Item = &'a TrialRecord> + Clone,
        direction: ObjectiveDirection,
    ) -> bool {
        let Some(step) = trial.last_step() else {
            return false;
        };
        // Only rungs crossed by the latest report are judged.
        let previous_step = trial.intermediate_values.keys().rev().nth(1).copied();

        let mut rung = 0;
        while let Some(rung_step) = self.rung_step(rung) {
            if step < rung_step {
                return false;
            }
            let newly_reached = previous_step.map(|prev| prev < rung_step).unwrap_or(true);
            if newly_reached {
                let Some(value) = Self::rung_value(trial, rung_step) else {
                    return false;
                };
                if value.is_nan() {
                    return true;
                }
                let mut competing: Vec<f64> = peers
                    .clone()
                    .filter(|t| t.number != trial.number)
                    .filter_map(|t| Self::rung_value(t, rung_step))
                    .filter(|v| !v.is_nan())
                    .collect();
                competing.push(value);
                if !Self::promotable(value, competing, self.reduction_factor.max(2), direction) {
                    return true;
                }
            }
            rung += 1;
        }
        false
    }
}

impl Pruner for SuccessiveHalvingPruner {
    fn prune(
        &self,
        trial: &TrialRecord,
        trials: &[TrialRecord],
        direction: ObjectiveDirection,
    ) -> bool {
        self.prune_among(trial, trials.iter(), direction)
    }

    fn name(&self) -> &str {
        "SuccessiveHalvingPruner"
    }
}

// ---- Hyperband ----

/// Several successive-halving brackets with increasing early-stopping
/// rates. Trials are assigned to brackets round-robin by number and only
/// compete within their bracket.
#[derive(Debug, Clone)]
pub struct HyperbandPruner {
    pub min_resource: u64,
    /// `None` infers the budget from the longest completed trial.
    pub max_resource: Option<u64>,
    pub reduction_factor: u64,
}

impl Default for HyperbandPruner {
    fn default() -> Self {
        Self {
            min_resource: 1,
            max_resource: None,
            reduction_factor: 3,
        }
    }
}

impl HyperbandPruner {
    pub fn n_brackets(&self, max_resource: u64) -> u64 {
        let eta = self.reduction_factor.max(2) as f64;
        let ratio = max_resource as f64 / self.min_resource.max(1) as f64;
        if ratio < 1.0 {
            return 1;
        }
        // Small epsilon so exact powers of eta are not lost to rounding.
        ((ratio.ln() / eta.ln()) + 1e-9).floor() as u64 + 1
    }

    fn max_resource(&self, trials: &[TrialRecord]) -> Option<u64> {
        self.max_resource.or_else(|| {
            trials
                .iter()
                .filter(|t| t.state == TrialState::Complete)
                .filter_map(|t| t.last_step())
                .max()
                .map(|step| step + 1)
        })
    }
}

impl Pruner for HyperbandPruner {
    fn prune(
        &self,
        trial: &TrialRecord,
        trials: &[TrialRecord],
        direction: ObjectiveDirection,
    ) -> bool {
        let Some(max_resource) = self.max_resource(trials) else {
            return false;
        };
        let n_brackets = self.n_brackets(max_resource);
        let bracket = trial.number % n_brackets;

        let halving = SuccessiveHalvingPruner {
            min_resource: self.min_resource,
            reduction_factor: self.reduction_factor,
            min_early_stopping_rate: bracket as u32,
        };
        let peers = trials.iter().filter(move |t| t.number % n_brackets == bracket);
        halving.prune_among(trial, peers, direction)
    }

    fn name(&self) -> &str {
        "HyperbandPruner"
    }
}
