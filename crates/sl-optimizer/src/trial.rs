//! Trial records and study-level bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::search::Params;

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

impl ObjectiveDirection {
    /// Parse a sweep `metric.goal`. Anything other than "maximize" minimizes.
    pub fn from_goal(goal: Option<&str>) -> Self {
        match goal.map(str::to_ascii_lowercase).as_deref() {
            Some("maximize") => Self::Maximize,
            _ => Self::Minimize,
        }
    }

    /// True if `candidate` beats `incumbent` in this direction.
    pub fn improves(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Maximize => candidate > incumbent,
            Self::Minimize => candidate < incumbent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Maximize => "maximize",
            Self::Minimize => "minimize",
        }
    }
}

impl Default for ObjectiveDirection {
    fn default() -> Self {
        Self::Minimize
    }
}

/// Trial lifecycle inside a study.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialState {
    Running,
    Complete,
    Pruned,
    Fail,
}

impl TrialState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Complete => "COMPLETE",
            Self::Pruned => "PRUNED",
            Self::Fail => "FAIL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(Self::Running),
            "COMPLETE" => Some(Self::Complete),
            "PRUNED" => Some(Self::Pruned),
            "FAIL" => Some(Self::Fail),
            _ => None,
        }
    }
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a trial handed out by `ask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrialHandle(pub u64);

impl fmt::Display for TrialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trial-{}", self.0)
    }
}

/// Everything the study knows about one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub number: u64,
    pub state: TrialState,
    pub params: Params,
    /// step → reported value
    pub intermediate_values: BTreeMap<u64, f64>,
    /// Final objective value.
    pub value: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TrialRecord {
    pub fn new(number: u64, params: Params) -> Self {
        Self {
            number,
            state: TrialState::Running,
            params,
            intermediate_values: BTreeMap::new(),
            value: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn handle(&self) -> TrialHandle {
        TrialHandle(self.number)
    }

    /// Most recent step reported, if any.
    pub fn last_step(&self) -> Option<u64> {
        self.intermediate_values.keys().next_back().copied()
    }

    pub fn mark_complete(&mut self, value: f64) {
        self.state = TrialState::Complete;
        self.value = Some(value);
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_pruned(&mut self) {
        self.state = TrialState::Pruned;
        self.value = self
            .last_step()
            .and_then(|step| self.intermediate_values.get(&step).copied());
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self) {
        self.state = TrialState::Fail;
        self.finished_at = Some(Utc::now());
    }
}

/// Counts and best trial across a study.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudySummary {
    pub direction: ObjectiveDirection,
    pub trials_running: usize,
    pub trials_completed: usize,
    pub trials_pruned: usize,
    pub trials_failed: usize,
    pub best_trial: Option<TrialRecord>,
}

impl StudySummary {
    pub fn from_trials(direction: ObjectiveDirection, trials: &[TrialRecord]) -> Self {
        let mut summary = Self {
            direction,
            ..Self::default()
        };
        for trial in trials {
            match trial.state {
                TrialState::Running => summary.trials_running += 1,
                TrialState::Complete => {
                    summary.trials_completed += 1;
                    summary.update_best(trial);
                }
                TrialState::Pruned => summary.trials_pruned += 1,
                TrialState::Fail => summary.trials_failed += 1,
            }
        }
        summary
    }

    /// Update the best trial if `trial` improves on the current best.
    pub fn update_best(&mut self, trial: &TrialRecord) {
        let Some(value) = trial.value else {
            return;
        };
        let dominated = match self.best_trial.as_ref().and_then(|best| best.value) {
            None => true,
            Some(best) => self.direction.improves(value, best),
        };
        if dominated {
            self.best_trial = Some(trial.clone());
        }
    }
}

/// Multi-line human-readable summary of a study's trials, logged when a
/// study-driven scheduler exits.
pub fn format_trials(trials: &[TrialRecord], direction: ObjectiveDirection) -> String {
    let summary = StudySummary::from_trials(direction, trials);
    let mut out = format!(
        "{} trials ({} complete, {} pruned, {} failed, {} running)",
        trials.len(),
        summary.trials_completed,
        summary.trials_pruned,
        summary.trials_failed,
        summary.trials_running,
    );
    for trial in trials {
        let params = trial
            .params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        let value = trial
            .value
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "\n  #{:<3} {:<8} value={} steps={} params=[{}]",
            trial.number,
            trial.state,
            value,
            trial.intermediate_values.len(),
            params
        ));
    }
    if let Some(best) = summary.best_trial {
        out.push_str(&format!(
            "\n  best: #{} ({} {})",
            best.number,
            direction.as_str(),
            best.value.unwrap_or_default()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::ParameterValue;

    fn complete(number: u64, value: f64) -> TrialRecord {
        let mut trial = TrialRecord::new(number, Params::new());
        trial.mark_complete(value);
        trial
    }

    #[test]
    fn direction_from_goal() {
        assert_eq!(ObjectiveDirection::from_goal(Some("maximize")), ObjectiveDirection::Maximize);
        assert_eq!(ObjectiveDirection::from_goal(Some("Maximize")), ObjectiveDirection::Maximize);
        assert_eq!(ObjectiveDirection::from_goal(Some("minimize")), ObjectiveDirection::Minimize);
        assert_eq!(ObjectiveDirection::from_goal(None), ObjectiveDirection::Minimize);
    }

    #[test]
    fn trial_lifecycle() {
        let mut params = Params::new();
        params.insert("lr".into(), ParameterValue::Float(0.1));
        let mut trial = TrialRecord::new(0, params);
        assert_eq!(trial.state, TrialState::Running);
        assert!(trial.last_step().is_none());

        trial.intermediate_values.insert(0, 3.0);
        trial.intermediate_values.insert(1, 2.0);
        assert_eq!(trial.last_step(), Some(1));

        trial.mark_pruned();
        assert_eq!(trial.state, TrialState::Pruned);
        assert_eq!(trial.value, Some(2.0));
        assert!(trial.finished_at.is_some());
    }

    #[test]
    fn best_trial_tracking_minimize() {
        let trials = vec![complete(0, 0.15), complete(1, 0.05), complete(2, 0.3)];
        let summary = StudySummary::from_trials(ObjectiveDirection::Minimize, &trials);
        assert_eq!(summary.trials_completed, 3);
        assert_eq!(summary.best_trial.unwrap().number, 1);
    }

    #[test]
    fn best_trial_tracking_maximize() {
        let mut failed = TrialRecord::new(3, Params::new());
        failed.mark_failed();
        let trials = vec![complete(0, 1.5), complete(1, 2.0), complete(2, 1.0), failed];
        let summary = StudySummary::from_trials(ObjectiveDirection::Maximize, &trials);
        assert_eq!(summary.trials_failed, 1);
        assert_eq!(summary.best_trial.unwrap().value, Some(2.0));
    }

    #[test]
    fn state_round_trips_through_storage_names() {
        for state in [
            TrialState::Running,
            TrialState::Complete,
            TrialState::Pruned,
            TrialState::Fail,
        ] {
            assert_eq!(TrialState::parse(state.as_str()), Some(state));
        }
        assert_eq!(TrialState::parse("WAITING"), None);
    }

    #[test]
    fn format_mentions_best() {
        let text = format_trials(&[complete(0, 0.5), complete(1, 0.2)], ObjectiveDirection::Minimize);
        assert!(text.starts_with("2 trials (2 complete"));
        assert!(text.contains("best: #1"));
    }
}
