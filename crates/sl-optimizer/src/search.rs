//! Search space definitions and parameter samplers.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sl_types::ParameterConfig;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::trial::{ObjectiveDirection, TrialRecord, TrialState};

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Hyperparameter name as it appears in the sweep config.
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices.
    Choice { values: Vec<serde_json::Value> },
}

/// A concrete parameter value produced by a sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl ParameterValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Int(v) => serde_json::json!(v),
            Self::Float(v) => serde_json::json!(v),
            Self::Json(v) => v.clone(),
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

/// One parameter assignment, ordered by name.
pub type Params = BTreeMap<String, ParameterValue>;

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    /// Build a search space from a sweep config's `parameters` block.
    ///
    /// `values` become categorical, `value` a single-choice categorical, and
    /// numeric `min`/`max` pairs a range (integer when both bounds are
    /// integers). A `distribution` starting with "log" selects log scale.
    pub fn from_sweep_parameters(parameters: &BTreeMap<String, ParameterConfig>) -> Self {
        let mut space = Self::new();
        for (name, param) in parameters {
            let log = param
                .distribution
                .as_deref()
                .map(|d| d.starts_with("log"))
                .unwrap_or(false);

            if let Some(values) = &param.values {
                space = space.add_choice(name.as_str(), values.clone());
            } else if let Some(value) = &param.value {
                space = space.add_choice(name.as_str(), vec![value.clone()]);
            } else if let (Some(min), Some(max)) = (&param.min, &param.max) {
                if let (Some(low), Some(high)) = (min.as_i64(), max.as_i64()) {
                    if log {
                        space = space.add_log_uniform(name.as_str(), low as f64, high as f64);
                    } else {
                        space = space.add_int(name.as_str(), low, high);
                    }
                } else if let (Some(low), Some(high)) = (min.as_f64(), max.as_f64()) {
                    if log {
                        space = space.add_log_uniform(name.as_str(), low, high);
                    } else {
                        space = space.add_float(name.as_str(), low, high);
                    }
                } else {
                    debug!(parameter = %name, "non-numeric min/max, skipping parameter");
                }
            } else {
                debug!(parameter = %name, ?param, "unknown parameter type, skipping");
            }
        }
        space
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::FloatRange { low, high },
        });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::IntRange { low, high },
        });
        self
    }

    pub fn add_log_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogUniform { low, high },
        });
        self
    }

    pub fn add_choice(mut self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Choice { values },
        });
        self
    }

    /// Total number of grid points (returns `None` if any parameter is
    /// continuous without a natural grid).
    pub fn grid_size(&self) -> Option<usize> {
        let mut total: usize = 1;
        for param in &self.parameters {
            let dim_size = match &param.kind {
                ParameterKind::IntRange { low, high } => (high - low + 1) as usize,
                ParameterKind::Choice { values } => values.len(),
                _ => return None,
            };
            total = total.checked_mul(dim_size)?;
        }
        Some(total)
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Samplers
// ---------------------------------------------------------------------------

/// Chooses the parameters of the next trial.
pub trait Sampler: Send {
    /// Propose one parameter assignment given every trial seen so far.
    fn sample(
        &mut self,
        space: &SearchSpace,
        history: &[TrialRecord],
        direction: ObjectiveDirection,
    ) -> Params;

    /// Name used in logs and the registry.
    fn name(&self) -> &str;
}

fn sample_param(rng: &mut StdRng, kind: &ParameterKind) -> ParameterValue {
    match kind {
        ParameterKind::FloatRange { low, high } => {
            ParameterValue::Float(rng.random_range(*low..=*high))
        }
        ParameterKind::IntRange { low, high } => ParameterValue::Int(rng.random_range(*low..=*high)),
        ParameterKind::LogUniform { low, high } => {
            let log_val: f64 = rng.random_range(low.ln()..=high.ln());
            ParameterValue::Float(log_val.exp())
        }
        ParameterKind::Choice { values } if values.is_empty() => {
            ParameterValue::Json(serde_json::Value::Null)
        }
        ParameterKind::Choice { values } => {
            let idx = rng.random_range(0..values.len());
            ParameterValue::Json(values[idx].clone())
        }
    }
}

fn rng_from_seed(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

// ---- Random ----

/// Independent random sampling across the search space.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    rng: StdRng,
}

impl RandomSampler {
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            rng: rng_from_seed(seed),
        }
    }

    fn sample_one(&mut self, space: &SearchSpace) -> Params {
        space
            .parameters
            .iter()
            .map(|param| (param.name.clone(), sample_param(&mut self.rng, &param.kind)))
            .collect()
    }
}

impl Sampler for RandomSampler {
    fn sample(&mut self, space: &SearchSpace, _: &[TrialRecord], _: ObjectiveDirection) -> Params {
        self.sample_one(space)
    }

    fn name(&self) -> &str {
        "RandomSampler"
    }
}

// ---- Grid ----

/// Exhaustive grid over discrete parameter combinations. Combinations that
/// an earlier trial already used are skipped, so a resumed study carries on
/// where it left off.
#[derive(Debug, Clone)]
pub struct GridSampler {
    /// Number of steps for continuous dimensions.
    float_steps: usize,
}

impl GridSampler {
    pub fn new(float_steps: usize) -> Self {
        Self { float_steps }
    }

    fn build_grid(space: &SearchSpace, float_steps: usize) -> Vec<Params> {
        let mut axes: Vec<Vec<(&str, ParameterValue)>> = Vec::new();

        for param in &space.parameters {
            let values: Vec<ParameterValue> = match &param.kind {
                ParameterKind::FloatRange { low, high } => {
                    let steps = float_steps.max(2);
                    (0..steps)
                        .map(|i| {
                            let t = i as f64 / (steps - 1) as f64;
                            ParameterValue::Float(low + t * (high - low))
                        })
                        .collect()
                }
                ParameterKind::IntRange { low, high } => {
                    (*low..=*high).map(ParameterValue::Int).collect()
                }
                ParameterKind::LogUniform { low, high } => {
                    let steps = float_steps.max(2);
                    let log_low = low.ln();
                    let log_high = high.ln();
                    (0..steps)
                        .map(|i| {
                            let t = i as f64 / (steps - 1) as f64;
                            ParameterValue::Float((log_low + t * (log_high - log_low)).exp())
                        })
                        .collect()
                }
                ParameterKind::Choice { values } => values
                    .iter()
                    .map(|v| ParameterValue::Json(v.clone()))
                    .collect(),
            };
            axes.push(
                values
                    .into_iter()
                    .map(|v| (param.name.as_str(), v))
                    .collect(),
            );
        }

        // Cartesian product
        let mut result: Vec<Params> = vec![Params::new()];
        for axis in &axes {
            let mut next = Vec::with_capacity(result.len() * axis.len());
            for existing in &result {
                for (name, value) in axis {
                    let mut combo = existing.clone();
                    combo.insert(name.to_string(), value.clone());
                    next.push(combo);
                }
            }
            result = next;
        }

        result
    }
}

impl Sampler for GridSampler {
    fn sample(
        &mut self,
        space: &SearchSpace,
        history: &[TrialRecord],
        _: ObjectiveDirection,
    ) -> Params {
        let combos = Self::build_grid(space, self.float_steps);
        if combos.is_empty() {
            return Params::new();
        }

        let seen: HashSet<String> = history
            .iter()
            .filter_map(|t| serde_json::to_string(&t.params).ok())
            .collect();

        combos
            .iter()
            .find(|combo| {
                serde_json::to_string(combo)
                    .map(|key| !seen.contains(&key))
                    .unwrap_or(true)
            })
            .cloned()
            // Grid exhausted: cycle through it again.
            .unwrap_or_else(|| combos[history.len() % combos.len()].clone())
    }

    fn name(&self) -> &str {
        "GridSampler"
    }
}

// ---- Bayesian (surrogate-model stub) ----

/// Biased sampling that perturbs the best completed trial.
///
/// Explores uniformly until a trial completes, then exploits the best
/// observation with probability `1 - exploration_weight`.
#[derive(Debug, Clone)]
pub struct BayesianSampler {
    exploration_weight: f64,
    rng: StdRng,
}

impl BayesianSampler {
    pub fn new(exploration_weight: f64, seed: Option<u64>) -> Self {
        Self {
            exploration_weight,
            rng: rng_from_seed(seed),
        }
    }

    fn explore(&mut self, space: &SearchSpace) -> Params {
        space
            .parameters
            .iter()
            .map(|param| (param.name.clone(), sample_param(&mut self.rng, &param.kind)))
            .collect()
    }

    /// Exploitation: perturb the best-known point.
    fn exploit(&mut self, space: &SearchSpace, base: &Params) -> Params {
        let mut perturbed = Params::new();

        for param in &space.parameters {
            let value = match (&param.kind, base.get(&param.name)) {
                (ParameterKind::FloatRange { low, high }, Some(ParameterValue::Float(v))) => {
                    let noise = self.rng.random_range(-0.1..0.1) * (high - low);
                    ParameterValue::Float((v + noise).clamp(*low, *high))
                }
                (ParameterKind::IntRange { low, high }, Some(ParameterValue::Int(v))) => {
                    let delta: i64 = self.rng.random_range(-2..=2);
                    ParameterValue::Int((v + delta).clamp(*low, *high))
                }
                (ParameterKind::LogUniform { low, high }, Some(ParameterValue::Float(v))) => {
                    let log_range = high.ln() - low.ln();
                    let noise = self.rng.random_range(-0.1..0.1) * log_range;
                    ParameterValue::Float((v.ln() + noise).exp().clamp(*low, *high))
                }
                // Fall back to random for choices or a missing base value
                (kind, _) => sample_param(&mut self.rng, kind),
            };
            perturbed.insert(param.name.clone(), value);
        }

        perturbed
    }
}

impl Sampler for BayesianSampler {
    fn sample(
        &mut self,
        space: &SearchSpace,
        history: &[TrialRecord],
        direction: ObjectiveDirection,
    ) -> Params {
        let best = history
            .iter()
            .filter(|t| t.state == TrialState::Complete)
            .filter_map(|t| t.value.map(|v| (t, v)))
            .max_by(|a, b| {
                let ord = a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal);
                match direction {
                    ObjectiveDirection::Maximize => ord,
                    ObjectiveDirection::Minimize => ord.reverse(),
                }
            })
            .map(|(t, _)| t.params.clone());

        match best {
            Some(base) if self.rng.random::<f64>() >= self.exploration_weight => {
                self.exploit(space, &base)
            }
            _ => self.explore(space),
        }
    }

    fn name(&self) -> &str {
        "BayesianSampler"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trial::TrialRecord;

    fn sample_space() -> SearchSpace {
        SearchSpace::new()
            .add_int("short_period", 5, 15)
            .add_int("long_period", 20, 50)
            .add_float("dropout", 0.5, 1.0)
    }

    fn completed(number: u64, params: Params, value: f64) -> TrialRecord {
        let mut trial = TrialRecord::new(number, params);
        trial.state = TrialState::Complete;
        trial.value = Some(value);
        trial
    }

    #[test]
    fn space_from_sweep_parameters() {
        let parameters: BTreeMap<String, ParameterConfig> = serde_json::from_value(
            serde_json::json!({
                "batch_size": {"values": [16, 32]},
                "epochs": {"value": 10},
                "layers": {"min": 1, "max": 4},
                "lr": {"min": 0.0001, "max": 0.1, "distribution": "log_uniform_values"},
                "dropout": {"min": 0.1, "max": 0.5},
                "mystery": {}
            }),
        )
        .unwrap();

        let space = SearchSpace::from_sweep_parameters(&parameters);
        assert_eq!(space.parameters.len(), 5);

        let kind = |name: &str| {
            space
                .parameters
                .iter()
                .find(|p| p.name == name)
                .map(|p| p.kind.clone())
                .unwrap()
        };
        assert!(matches!(kind("batch_size"), ParameterKind::Choice { values } if values.len() == 2));
        assert!(matches!(kind("epochs"), ParameterKind::Choice { values } if values.len() == 1));
        assert_eq!(kind("layers"), ParameterKind::IntRange { low: 1, high: 4 });
        assert!(matches!(kind("lr"), ParameterKind::LogUniform { .. }));
        assert_eq!(kind("dropout"), ParameterKind::FloatRange { low: 0.1, high: 0.5 });
    }

    #[test]
    fn grid_sampler_skips_seen_combinations() {
        let space = SearchSpace::new().add_int("a", 1, 3);
        let mut sampler = GridSampler::new(5);
        let mut history = Vec::new();

        for number in 0..3 {
            let params = sampler.sample(&space, &history, ObjectiveDirection::Minimize);
            history.push(TrialRecord::new(number, params));
        }

        let seen: HashSet<i64> = history
            .iter()
            .map(|t| match t.params["a"] {
                ParameterValue::Int(v) => v,
                ref other => panic!("unexpected value: {other:?}"),
            })
            .collect();
        assert_eq!(seen, HashSet::from([1, 2, 3]));

        // Exhausted grid cycles instead of returning nothing.
        let next = sampler.sample(&space, &history, ObjectiveDirection::Minimize);
        assert_eq!(next.len(), 1);
    }

    #[test]
    fn random_sampler_respects_bounds() {
        let space = sample_space();
        let mut sampler = RandomSampler::new(Some(7));

        for _ in 0..50 {
            let params = sampler.sample(&space, &[], ObjectiveDirection::Minimize);
            match params.get("short_period") {
                Some(ParameterValue::Int(v)) => assert!(*v >= 5 && *v <= 15),
                other => panic!("unexpected short_period value: {other:?}"),
            }
            match params.get("dropout") {
                Some(ParameterValue::Float(v)) => assert!(*v >= 0.5 && *v <= 1.0),
                other => panic!("unexpected dropout value: {other:?}"),
            }
        }
    }

    #[test]
    fn seeded_random_sampler_is_deterministic() {
        let space = sample_space();
        let a = RandomSampler::new(Some(42)).sample(&space, &[], ObjectiveDirection::Minimize);
        let b = RandomSampler::new(Some(42)).sample(&space, &[], ObjectiveDirection::Minimize);
        assert_eq!(a, b);
    }

    #[test]
    fn bayesian_sampler_exploits_best_trial() {
        let space = SearchSpace::new().add_float("lr", 0.0, 1.0);
        let mut sampler = BayesianSampler::new(0.0, Some(1));

        let mut good = Params::new();
        good.insert("lr".into(), ParameterValue::Float(0.5));
        let mut bad = Params::new();
        bad.insert("lr".into(), ParameterValue::Float(0.95));
        let history = vec![completed(0, good, 0.1), completed(1, bad, 0.9)];

        for _ in 0..20 {
            let params = sampler.sample(&space, &history, ObjectiveDirection::Minimize);
            match params.get("lr") {
                // Perturbations stay within 10% of the range around the best point.
                Some(ParameterValue::Float(v)) => assert!((0.4..=0.6).contains(v), "lr={v}"),
                other => panic!("unexpected lr value: {other:?}"),
            }
        }
    }

    #[test]
    fn log_uniform_stays_in_bounds() {
        let space = SearchSpace::new().add_log_uniform("lr", 1e-5, 1e-1);
        let mut sampler = RandomSampler::new(None);
        for _ in 0..100 {
            match sampler.sample(&space, &[], ObjectiveDirection::Minimize).get("lr") {
                Some(ParameterValue::Float(v)) => {
                    assert!(*v >= 1e-5 && *v <= 1e-1, "lr out of bounds: {v}");
                }
                other => panic!("unexpected lr value: {other:?}"),
            }
        }
    }

    #[test]
    fn grid_size_none_for_float_only() {
        let space = SearchSpace::new().add_float("x", 0.0, 1.0);
        assert_eq!(space.grid_size(), None);
        let space = SearchSpace::new().add_int("a", 1, 3).add_int("b", 10, 11);
        assert_eq!(space.grid_size(), Some(6));
    }
}
