//! Local ask/tell/prune search.
//!
//! Trials come from a [`LocalStudy`] persisted in SQLite. Each iteration
//! feeds new metric values into the study, stops runs it wants pruned,
//! finishes trials whose runs are gone, and asks for a new trial per free
//! worker. The study file is checkpointed as a backend artifact on exit and
//! restored when the scheduler is resumed.

use async_trait::async_trait;
use sl_backend::{ArtifactSpec, UpsertRun};
use sl_optimizer::{
    default_pruner, default_sampler, format_trials, pruner_from_args, sampler_from_args,
    CustomOptimizer, LocalStudy, ObjectiveDirection, Pruner, Sampler, SearchSpace, Study,
    TrialHandle,
};
use sl_types::{
    internal_error, ArgValue, BackendError, QueuedRunStatus, RunArgs, RunState, SchedulerError,
    SweepResult, SweepRun,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{host_label, SweepStrategy};
use crate::command::run_config;
use crate::context::SchedulerContext;

/// Artifact the study file is checkpointed under.
pub const STORAGE_ARTIFACT: &str = "optuna-storage";
pub const STORAGE_ARTIFACT_TYPE: &str = "optuna";
pub const STORAGE_FILE: &str = "optuna.db";

/// A trial whose run is in flight.
#[derive(Debug, Clone, Copy)]
struct TrialSlot {
    handle: TrialHandle,
    /// Metric values already fed to the study.
    num_metrics: usize,
}

/// What polling a trial concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrialOutcome {
    Running,
    Pruned,
    Finished,
}

pub struct StudyStrategy {
    work_dir: PathBuf,
    study: Option<LocalStudy>,
    trials: BTreeMap<String, TrialSlot>,
}

impl StudyStrategy {
    /// `work_dir` holds the study file and downloaded artifacts.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            study: None,
            trials: BTreeMap::new(),
        }
    }

    pub fn study_name(sweep_id: &str) -> String {
        format!("optuna-study-{sweep_id}")
    }

    pub fn study(&self) -> Option<&LocalStudy> {
        self.study.as_ref()
    }

    /// Trials whose runs are still in flight.
    pub fn in_flight(&self) -> usize {
        self.trials.len()
    }

    fn study_mut(&mut self) -> SweepResult<&mut LocalStudy> {
        self.study
            .as_mut()
            .ok_or_else(|| internal_error!("study used before load_state"))
    }

    /// Feed new metrics for one trial into the study.
    async fn poll_trial(
        &mut self,
        ctx: &SchedulerContext,
        run_id: &str,
        metric: &str,
    ) -> SweepResult<TrialOutcome> {
        let Some(slot) = self.trials.get(run_id).copied() else {
            return Ok(TrialOutcome::Finished);
        };

        let run = ctx.runs().get(run_id).filter(|run| run.state != RunState::Dead);
        let queued = run.and_then(|run| run.queued_run.clone());
        let in_flight = run.is_some();

        if let Some(queued) = queued {
            match ctx.queue().status(&queued).await {
                Ok(QueuedRunStatus::Pending) => {
                    debug!(run_id, "run still queued, no metrics yet");
                    return Ok(TrialOutcome::Running);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(run_id, error = %e, "failed to fetch queue status");
                    return Ok(TrialOutcome::Running);
                }
            }
        }

        let config = ctx.config();
        let values = match ctx
            .backend()
            .run_metric_history(&config.entity, &config.project, run_id, metric, slot.num_metrics)
            .await
        {
            Ok(values) => values,
            Err(e) => {
                warn!(run_id, error = %e, "failed to poll run metrics");
                return Ok(TrialOutcome::Running);
            }
        };

        let num_metrics = slot.num_metrics + values.len();
        if let Some(slot) = self.trials.get_mut(run_id) {
            slot.num_metrics = num_metrics;
        }

        let study = self.study_mut()?;
        for (offset, value) in values.iter().enumerate() {
            let step = (slot.num_metrics + offset) as u64;
            debug!(run_id, step, value, "reporting metric");
            study.report(slot.handle, step, *value)?;

            if study.should_prune(slot.handle)? {
                info!(run_id, trial = slot.handle.0, step, "pruning run");
                study.tell_pruned(slot.handle)?;
                return Ok(TrialOutcome::Pruned);
            }
        }

        if in_flight {
            return Ok(TrialOutcome::Running);
        }

        let last_value = study
            .trial(slot.handle)
            .and_then(|trial| trial.last_step().and_then(|step| trial.intermediate_values.get(&step)))
            .copied();
        match last_value {
            Some(value) => {
                info!(run_id, trial = slot.handle.0, num_metrics, value, "completing trial");
                study.tell_complete(slot.handle, value)?;
            }
            None => {
                warn!(run_id, trial = slot.handle.0, "run ended without logging metrics");
                study.tell_failed(slot.handle)?;
            }
        }
        Ok(TrialOutcome::Finished)
    }

    /// Ask the study for a trial, mint a backend run for it and launch it
    /// on `worker_id`.
    async fn launch_trial(&mut self, ctx: &mut SchedulerContext, worker_id: usize) -> SweepResult<()> {
        let (handle, params) = self.study_mut()?.ask()?;
        let args: RunArgs = params
            .iter()
            .map(|(name, value)| (name.clone(), ArgValue::new(value.to_json())))
            .collect();

        let config = ctx.config();
        let record = ctx
            .backend()
            .upsert_run(UpsertRun {
                entity: config.entity.clone(),
                project: config.project.clone(),
                sweep_name: config.sweep_id.clone(),
                config: serde_json::Value::Object(run_config(&args)),
            })
            .await?;

        let run_id = record.name;
        let run = SweepRun::new(run_id.clone(), worker_id, args);
        if ctx.launch_run(run).await? {
            debug!(run_id = %run_id, trial = handle.0, "trial launched");
            self.trials.insert(
                run_id,
                TrialSlot {
                    handle,
                    num_metrics: 0,
                },
            );
        } else {
            self.study_mut()?.tell_failed(handle)?;
        }
        Ok(())
    }
}

/// Download and parse a user-supplied optimizer configuration. Any failure
/// is fatal.
async fn load_custom(
    ctx: &SchedulerContext,
    work_dir: &Path,
    artifact: &str,
) -> SweepResult<CustomOptimizer> {
    let dest = work_dir.join("custom");
    let config = ctx.config();
    let loaded = match ctx
        .backend()
        .download_artifact(&config.entity, &config.project, artifact, &dest)
        .await
    {
        Ok(dir) => CustomOptimizer::load(&dir),
        Err(e) => Err(e.into()),
    };
    loaded.map_err(|e| {
        SchedulerError::CustomStudyLoad {
            artifact: artifact.to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

/// Fetch the checkpointed study file, if the backend has one.
async fn restore_storage(ctx: &SchedulerContext, work_dir: &Path) -> SweepResult<Option<PathBuf>> {
    let config = ctx.config();
    let name = format!("{STORAGE_ARTIFACT}:latest");
    match ctx
        .backend()
        .download_artifact(&config.entity, &config.project, &name, work_dir)
        .await
    {
        Ok(dir) => {
            let path = dir.join(STORAGE_FILE);
            Ok(path.exists().then_some(path))
        }
        Err(BackendError::NotFound(what)) => {
            warn!(artifact = %what, "no study checkpoint to resume from, starting fresh");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn storage_dir(path: &Path) -> SweepResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[async_trait]
impl SweepStrategy for StudyStrategy {
    fn name(&self) -> &str {
        "optuna"
    }

    async fn load_state(&mut self, ctx: &mut SchedulerContext) -> SweepResult<()> {
        let sweep_config = ctx.sweep_config().clone();
        let optimizer = sweep_config.optimizer.clone().unwrap_or_default();

        let custom = match optimizer.artifact.as_deref() {
            Some(artifact) => Some(load_custom(ctx, &self.work_dir, artifact).await?),
            None => None,
        };

        let existing = if ctx.config().resumed {
            restore_storage(ctx, &self.work_dir).await?
        } else {
            None
        };

        let pruner: Box<dyn Pruner> = match (custom.as_ref().and_then(|c| c.pruner.as_ref()), &optimizer.pruner) {
            (Some(custom_args), config_args) => {
                if config_args.is_some() {
                    warn!("pruner from custom artifact supersedes the sweep config's pruner");
                }
                pruner_from_args(custom_args)?
            }
            (None, Some(args)) => pruner_from_args(args)?,
            (None, None) => {
                info!("no pruner configured, using defaults");
                default_pruner()
            }
        };

        let sampler: Box<dyn Sampler> = match (custom.as_ref().and_then(|c| c.sampler.as_ref()), &optimizer.sampler) {
            (Some(custom_args), config_args) => {
                if config_args.is_some() {
                    warn!("sampler from custom artifact supersedes the sweep config's sampler");
                }
                sampler_from_args(custom_args)?
            }
            (None, Some(args)) => sampler_from_args(args)?,
            (None, None) => {
                info!("no sampler configured, using defaults");
                default_sampler()
            }
        };

        let goal = custom
            .as_ref()
            .and_then(|c| c.direction.clone())
            .or_else(|| sweep_config.metric.as_ref().and_then(|m| m.goal.clone()));
        let direction = ObjectiveDirection::from_goal(goal.as_deref());

        let path = existing.unwrap_or_else(|| self.work_dir.join(STORAGE_FILE));
        storage_dir(&path)?;

        let space = SearchSpace::from_sweep_parameters(&sweep_config.parameters);
        let name = Self::study_name(&ctx.config().sweep_id);
        let study = LocalStudy::open(&path, name, direction, space, sampler, pruner)?;

        info!(
            study = %study.name(),
            storage = %path.display(),
            direction = study.direction().as_str(),
            pruner = study.pruner_name(),
            sampler = study.sampler_name(),
            "{} study",
            if ctx.config().resumed { "loaded" } else { "created" }
        );
        if !study.trials().is_empty() {
            info!("prior trials:\n{}", format_trials(study.trials(), study.direction()));
        }

        self.study = Some(study);
        Ok(())
    }

    async fn start(&mut self, ctx: &mut SchedulerContext) -> SweepResult<()> {
        ctx.sweep_config().metric_name()?;
        ctx.register_agents(&host_label()).await
    }

    async fn run(&mut self, ctx: &mut SchedulerContext) -> SweepResult<()> {
        let metric = ctx.sweep_config().metric_name()?.to_string();

        let run_ids: Vec<String> = self.trials.keys().cloned().collect();
        for run_id in run_ids {
            match self.poll_trial(ctx, &run_id, &metric).await? {
                TrialOutcome::Running => {}
                TrialOutcome::Pruned => {
                    self.trials.remove(&run_id);
                    ctx.stop_run(&run_id).await;
                }
                TrialOutcome::Finished => {
                    self.trials.remove(&run_id);
                    debug!(run_id = %run_id, "trial finished");
                }
            }
        }

        for worker_id in ctx.available_workers() {
            if !ctx.is_alive() || ctx.at_run_cap() {
                break;
            }
            self.launch_trial(ctx, worker_id).await?;
        }
        Ok(())
    }

    async fn save_state(&mut self, ctx: &mut SchedulerContext) -> SweepResult<()> {
        let (path, summary) = {
            let Some(study) = self.study.as_ref() else {
                return Ok(());
            };
            let Some(path) = study.storage_path() else {
                return Ok(());
            };
            (path, format_trials(study.trials(), study.direction()))
        };

        let config = ctx.config();
        ctx.backend()
            .log_artifact(
                &config.entity,
                &config.project,
                ArtifactSpec {
                    name: STORAGE_ARTIFACT.to_string(),
                    kind: STORAGE_ARTIFACT_TYPE.to_string(),
                    path,
                },
            )
            .await?;
        info!("saved study with trials:\n{summary}");
        Ok(())
    }
}
