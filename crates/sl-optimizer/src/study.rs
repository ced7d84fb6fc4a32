//! The ask/tell/prune study.

use sl_types::{StudyError, StudyResult};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::pruners::Pruner;
use crate::search::{Params, Sampler, SearchSpace};
use crate::store::StudyStore;
use crate::trial::{ObjectiveDirection, TrialHandle, TrialRecord, TrialState};

/// Narrow interface the optimization-driven scheduler talks to.
pub trait Study: Send {
    fn name(&self) -> &str;

    fn direction(&self) -> ObjectiveDirection;

    /// Start a new trial and return its parameters.
    fn ask(&mut self) -> StudyResult<(TrialHandle, Params)>;

    /// Record an intermediate value. Returns `false` when the trial already
    /// holds a value for `step`; the first report wins.
    fn report(&mut self, trial: TrialHandle, step: u64, value: f64) -> StudyResult<bool>;

    fn should_prune(&self, trial: TrialHandle) -> StudyResult<bool>;

    fn tell_complete(&mut self, trial: TrialHandle, value: f64) -> StudyResult<()>;

    fn tell_pruned(&mut self, trial: TrialHandle) -> StudyResult<()>;

    fn tell_failed(&mut self, trial: TrialHandle) -> StudyResult<()>;

    fn trial(&self, trial: TrialHandle) -> Option<&TrialRecord>;

    fn trials(&self) -> &[TrialRecord];
}

/// In-process study, optionally persisted to SQLite after every change.
pub struct LocalStudy {
    name: String,
    direction: ObjectiveDirection,
    space: SearchSpace,
    sampler: Box<dyn Sampler>,
    pruner: Box<dyn Pruner>,
    trials: Vec<TrialRecord>,
    store: Option<(StudyStore, i64)>,
}

impl std::fmt::Debug for LocalStudy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStudy")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("sampler", &self.sampler.name())
            .field("pruner", &self.pruner.name())
            .field("trials", &self.trials.len())
            .finish()
    }
}

impl LocalStudy {
    /// A study that lives only in memory.
    pub fn new(
        name: impl Into<String>,
        direction: ObjectiveDirection,
        space: SearchSpace,
        sampler: Box<dyn Sampler>,
        pruner: Box<dyn Pruner>,
    ) -> Self {
        Self {
            name: name.into(),
            direction,
            space,
            sampler,
            pruner,
            trials: Vec::new(),
            store: None,
        }
    }

    /// Open (or create) a study in the SQLite file at `path`, loading any
    /// trials a previous scheduler left behind.
    pub fn open<P: AsRef<Path>>(
        path: P,
        name: impl Into<String>,
        direction: ObjectiveDirection,
        space: SearchSpace,
        sampler: Box<dyn Sampler>,
        pruner: Box<dyn Pruner>,
    ) -> StudyResult<Self> {
        let name = name.into();
        let store = StudyStore::open(path)?;
        let (study_id, direction) = store.ensure_study(&name, direction)?;
        let trials = store.load_trials(study_id)?;
        if !trials.is_empty() {
            info!(study = %name, trials = trials.len(), "loaded existing study");
        }

        Ok(Self {
            name,
            direction,
            space,
            sampler,
            pruner,
            trials,
            store: Some((store, study_id)),
        })
    }

    pub fn storage_path(&self) -> Option<PathBuf> {
        self.store.as_ref().map(|(store, _)| store.path().to_path_buf())
    }

    pub fn sampler_name(&self) -> &str {
        self.sampler.name()
    }

    pub fn pruner_name(&self) -> &str {
        self.pruner.name()
    }

    fn index_of(&self, trial: TrialHandle) -> StudyResult<usize> {
        self.trials
            .iter()
            .position(|t| t.number == trial.0)
            .ok_or(StudyError::UnknownTrial { trial: trial.0 })
    }

    fn running_index(&self, trial: TrialHandle) -> StudyResult<usize> {
        let idx = self.index_of(trial)?;
        if self.trials[idx].state.is_finished() {
            return Err(StudyError::TrialFinished { trial: trial.0 });
        }
        Ok(idx)
    }

    fn persist(&mut self, idx: usize) -> StudyResult<()> {
        if let Some((store, study_id)) = self.store.as_mut() {
            store.save_trial(*study_id, &self.trials[idx])?;
        }
        Ok(())
    }
}

impl Study for LocalStudy {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> ObjectiveDirection {
        self.direction
    }

    fn ask(&mut self) -> StudyResult<(TrialHandle, Params)> {
        let number = self.trials.iter().map(|t| t.number + 1).max().unwrap_or(0);
        let params = self.sampler.sample(&self.space, &self.trials, self.direction);
        let trial = TrialRecord::new(number, params.clone());
        self.trials.push(trial);
        self.persist(self.trials.len() - 1)?;

        debug!(study = %self.name, trial = number, ?params, "asked for trial");
        Ok((TrialHandle(number), params))
    }

    fn report(&mut self, trial: TrialHandle, step: u64, value: f64) -> StudyResult<bool> {
        let idx = self.running_index(trial)?;
        if self.trials[idx].intermediate_values.contains_key(&step) {
            return Ok(false);
        }
        self.trials[idx].intermediate_values.insert(step, value);
        self.persist(idx)?;
        Ok(true)
    }

    fn should_prune(&self, trial: TrialHandle) -> StudyResult<bool> {
        let idx = self.index_of(trial)?;
        let record = &self.trials[idx];
        if record.state != TrialState::Running {
            return Ok(false);
        }
        Ok(self.pruner.prune(record, &self.trials, self.direction))
    }

    fn tell_complete(&mut self, trial: TrialHandle, value: f64) -> StudyResult<()> {
        let idx = self.running_index(trial)?;
        self.trials[idx].mark_complete(value);
        self.persist(idx)
    }

    fn tell_pruned(&mut self, trial: TrialHandle) -> StudyResult<()> {
        let idx = self.running_index(trial)?;
        self.trials[idx].mark_pruned();
        self.persist(idx)
    }

    fn tell_failed(&mut self, trial: TrialHandle) -> StudyResult<()> {
        let idx = self.running_index(trial)?;
        self.trials[idx].mark_failed();
        self.persist(idx)
    }

    fn trial(&self, trial: TrialHandle) -> Option<&TrialRecord> {
        self.trials.iter().find(|t| t.number == trial.0)
    }

    fn trials(&self) -> &[TrialRecord] {
        &self.trials
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pruners::{NopPruner, ThresholdPruner};
    use crate::search::{ParameterValue, RandomSampler};
    use tempfile::TempDir;

    fn space() -> SearchSpace {
        SearchSpace::new().add_float("lr", 0.001, 0.1).add_int("layers", 1, 4)
    }

    fn memory_study() -> LocalStudy {
        LocalStudy::new(
            "optuna-study-test",
            ObjectiveDirection::Minimize,
            space(),
            Box::new(RandomSampler::new(Some(3))),
            Box::new(NopPruner),
        )
    }

    #[test]
    fn ask_numbers_trials_sequentially() {
        let mut study = memory_study();
        let (a, params) = study.ask().unwrap();
        let (b, _) = study.ask().unwrap();
        assert_eq!(a, TrialHandle(0));
        assert_eq!(b, TrialHandle(1));
        assert!(matches!(params["layers"], ParameterValue::Int(v) if (1..=4).contains(&v)));
    }

    #[test]
    fn report_ignores_duplicate_steps() {
        let mut study = memory_study();
        let (trial, _) = study.ask().unwrap();
        assert!(study.report(trial, 0, 1.0).unwrap());
        assert!(!study.report(trial, 0, 5.0).unwrap());
        assert_eq!(study.trial(trial).unwrap().intermediate_values[&0], 1.0);
    }

    #[test]
    fn finished_trials_reject_updates() {
        let mut study = memory_study();
        let (trial, _) = study.ask().unwrap();
        study.tell_complete(trial, 0.3).unwrap();
        assert!(matches!(
            study.report(trial, 1, 0.2),
            Err(StudyError::TrialFinished { trial: 0 })
        ));
        assert!(matches!(
            study.tell_failed(TrialHandle(9)),
            Err(StudyError::UnknownTrial { trial: 9 })
        ));
    }

    #[test]
    fn should_prune_consults_pruner() {
        let mut study = LocalStudy::new(
            "threshold",
            ObjectiveDirection::Minimize,
            space(),
            Box::new(RandomSampler::new(None)),
            Box::new(ThresholdPruner {
                lower: None,
                upper: Some(1.0),
                n_warmup_steps: 0,
            }),
        );
        let (trial, _) = study.ask().unwrap();
        study.report(trial, 0, 0.5).unwrap();
        assert!(!study.should_prune(trial).unwrap());
        study.report(trial, 1, 2.0).unwrap();
        assert!(study.should_prune(trial).unwrap());

        study.tell_pruned(trial).unwrap();
        assert_eq!(study.trial(trial).unwrap().state, TrialState::Pruned);
        assert!(!study.should_prune(trial).unwrap());
    }

    #[test]
    fn persisted_study_resumes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("optuna.db");

        {
            let mut study = LocalStudy::open(
                &path,
                "optuna-study-sweep",
                ObjectiveDirection::Maximize,
                space(),
                Box::new(RandomSampler::new(Some(1))),
                Box::new(NopPruner),
            )
            .unwrap();
            let (trial, _) = study.ask().unwrap();
            study.report(trial, 0, 0.4).unwrap();
            study.tell_complete(trial, 0.4).unwrap();
            assert_eq!(study.storage_path().as_deref(), Some(path.as_path()));
        }

        let mut study = LocalStudy::open(
            &path,
            "optuna-study-sweep",
            ObjectiveDirection::Minimize,
            space(),
            Box::new(RandomSampler::new(Some(1))),
            Box::new(NopPruner),
        )
        .unwrap();
        assert_eq!(study.direction(), ObjectiveDirection::Maximize);
        assert_eq!(study.trials().len(), 1);
        assert_eq!(study.trials()[0].value, Some(0.4));

        let (next, _) = study.ask().unwrap();
        assert_eq!(next, TrialHandle(1));
    }
}
