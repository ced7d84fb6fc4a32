//! Command line used to launch the scheduler itself as a queued job.

use sl_types::SweepConfig;

pub const PROGRAM: &str = "sweepline";

/// Stands in for the sweep id; the launch agent substitutes it when the
/// scheduler job starts.
pub const SWEEP_ID_PLACEHOLDER: &str = "WANDB_SWEEP_ID";

/// Build the scheduler's own argv. `None` when the sweep names neither a
/// job nor an image.
pub fn construct_scheduler_entrypoint(
    sweep_config: &SweepConfig,
    queue: &str,
    project: &str,
    num_workers: usize,
) -> Option<Vec<String>> {
    let executable = match (&sweep_config.job, &sweep_config.image_uri) {
        (Some(job), _) => vec!["--job".to_string(), with_alias(job)],
        (None, Some(image)) => vec!["--image_uri".to_string(), image.clone()],
        (None, None) => return None,
    };

    let mut argv = vec![
        PROGRAM.to_string(),
        "scheduler".to_string(),
        SWEEP_ID_PLACEHOLDER.to_string(),
        "--queue".to_string(),
        queue.to_string(),
        "--project".to_string(),
        project.to_string(),
        "--num_workers".to_string(),
        num_workers.to_string(),
    ];
    argv.extend(executable);
    Some(argv)
}

/// Job references without an alias resolve to `:latest`.
pub fn with_alias(job: &str) -> String {
    if job.contains(':') {
        job.to_string()
    } else {
        format!("{job}:latest")
    }
}
