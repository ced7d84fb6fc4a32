//! Translating a sweep run into a launch-queue submission.

use sl_backend::{LaunchOverrides, LaunchRequest};
use sl_types::{SchedulerConfig, SweepRun};
use std::fmt;

use crate::command::{run_config, CommandConvention};

/// What every trial of the sweep runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Executable {
    /// A job reference, alias included.
    Job(String),
    /// A container image.
    Image(String),
}

impl fmt::Display for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Job(job) => write!(f, "job {job}"),
            Self::Image(image) => write!(f, "image {image}"),
        }
    }
}

/// Build the submission for `run`.
///
/// With a command template the rendered command becomes the entry point.
/// Without one, a run that names its program gets `python <program>` plus
/// flags; otherwise the executable's own entry point is kept. The flags are
/// always attached as override args.
pub fn build_launch_request(
    config: &SchedulerConfig,
    executable: &Executable,
    convention: &CommandConvention,
    template: &[String],
    run: &SweepRun,
) -> LaunchRequest {
    let program = run.program.as_deref();
    let entry_point = if !template.is_empty() {
        Some(convention.render(template, &run.args, program))
    } else {
        program.map(|program| {
            convention.render(&["python".to_string(), program.to_string()], &run.args, None)
        })
    };

    let (job, image_uri) = match executable {
        Executable::Job(job) => (Some(job.clone()), None),
        Executable::Image(image) => (None, Some(image.clone())),
    };

    LaunchRequest {
        run_id: run.id.clone(),
        entity: config.entity.clone(),
        project: config.project.clone(),
        project_queue: config.queue_project().to_string(),
        queue: config.queue.clone(),
        job,
        image_uri,
        entry_point,
        overrides: LaunchOverrides {
            run_config: run_config(&run.args),
            args: convention.render(&[], &run.args, None),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sl_types::{ArgValue, RunArgs};

    fn run(program: Option<&str>) -> SweepRun {
        let mut args = RunArgs::new();
        args.insert("lr".into(), ArgValue::new(0.1));
        SweepRun::new("run-1", 0, args).with_program(program.map(str::to_string))
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig::new("sweep", "entity", "project")
            .with_queue("gpu")
            .with_project_queue("queues")
    }

    #[test]
    fn job_submission_targets_project_queue() {
        let request = build_launch_request(
            &config(),
            &Executable::Job("trainer:latest".into()),
            &CommandConvention::default(),
            &[],
            &run(None),
        );

        assert_eq!(request.run_id, "run-1");
        assert_eq!(request.project, "project");
        assert_eq!(request.project_queue, "queues");
        assert_eq!(request.queue, "gpu");
        assert_eq!(request.job.as_deref(), Some("trainer:latest"));
        assert!(request.image_uri.is_none());
        assert!(request.entry_point.is_none());
        assert_eq!(request.overrides.args, vec!["--lr=0.1".to_string()]);
        assert_eq!(request.overrides.run_config["lr"], json!({"value": 0.1}));
    }

    #[test]
    fn template_becomes_entry_point() {
        let template = vec!["${env}".to_string(), "python".into(), "train.py".into(), "${args}".into()];
        let request = build_launch_request(
            &config(),
            &Executable::Image("trainer-image".into()),
            &CommandConvention::default(),
            &template,
            &run(None),
        );

        assert_eq!(request.image_uri.as_deref(), Some("trainer-image"));
        assert_eq!(
            request.entry_point.unwrap(),
            vec!["/usr/bin/env", "python", "train.py", "--lr=0.1"]
        );
    }

    #[test]
    fn program_without_template() {
        let request = build_launch_request(
            &config(),
            &Executable::Job("trainer:latest".into()),
            &CommandConvention::default(),
            &[],
            &run(Some("train.py")),
        );
        assert_eq!(
            request.entry_point.unwrap(),
            vec!["python", "train.py", "--lr=0.1"]
        );
    }
}
