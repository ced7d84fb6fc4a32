use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sl_backend::{BackendSettings, GraphqlClient};
use sl_types::{SchedulerConfig, SweepConfig};
use sweepline::{construct_scheduler_entrypoint, Scheduler};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sweepline", version, about = "Hyperparameter sweep scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler for a sweep until it finishes
    Scheduler(SchedulerArgs),

    /// Print the command that launches a scheduler for a sweep config
    Entrypoint(EntrypointArgs),
}

#[derive(Args)]
struct SchedulerArgs {
    /// Sweep to schedule
    sweep_id: String,

    /// Launch queue trials are pushed to
    #[arg(long, default_value = "default")]
    queue: String,

    /// Project the sweep lives in
    #[arg(long)]
    project: String,

    /// Entity owning the project; falls back to SWEEPLINE_ENTITY
    #[arg(long)]
    entity: Option<String>,

    /// Project owning the launch queue, when it differs from --project
    #[arg(long = "project_queue")]
    project_queue: Option<String>,

    /// Number of concurrent trials
    #[arg(long = "num_workers", default_value_t = 8)]
    num_workers: usize,

    /// Job to launch for every trial
    #[arg(long, conflicts_with = "image_uri")]
    job: Option<String>,

    /// Container image to launch for every trial
    #[arg(long = "image_uri")]
    image_uri: Option<String>,

    /// Seconds between iterations while trials are running
    #[arg(long = "polling_sleep", default_value_t = 1.0)]
    polling_sleep: f64,

    /// Seconds between iterations while no trials are tracked
    #[arg(long = "queue_sleep", default_value_t = 5.0)]
    queue_sleep: f64,

    /// Strategy to run (sweep, optuna); defaults to the sweep's method
    #[arg(long)]
    strategy: Option<String>,

    /// Resume the study state of an earlier scheduler
    #[arg(long)]
    resumed: bool,

    /// Override the sweep's run cap
    #[arg(long = "run_cap")]
    run_cap: Option<usize>,
}

#[derive(Args)]
struct EntrypointArgs {
    /// Sweep config YAML file
    config: std::path::PathBuf,

    #[arg(long, default_value = "default")]
    queue: String,

    #[arg(long)]
    project: String,

    #[arg(long = "num_workers", default_value_t = 8)]
    num_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sweepline=debug")),
        )
        .with_target(true)
        .init();

    match Cli::parse().command {
        Command::Scheduler(args) => run_scheduler(args).await,
        Command::Entrypoint(args) => print_entrypoint(args),
    }
}

async fn run_scheduler(args: SchedulerArgs) -> anyhow::Result<ExitCode> {
    let entity = match args.entity {
        Some(entity) => entity,
        None => std::env::var("SWEEPLINE_ENTITY")
            .context("no --entity given and SWEEPLINE_ENTITY is not set")?,
    };

    let mut config = SchedulerConfig::new(&args.sweep_id, &entity, &args.project)
        .with_queue(&args.queue)
        .with_num_workers(args.num_workers)
        .with_resumed(args.resumed);
    config = config
        .with_polling_sleep(Duration::from_secs_f64(args.polling_sleep.max(0.0)))
        .with_queue_sleep(Duration::from_secs_f64(args.queue_sleep.max(0.0)));
    if let Some(strategy) = &args.strategy {
        config = config.with_strategy(strategy);
    }
    if let Some(project_queue) = &args.project_queue {
        config = config.with_project_queue(project_queue);
    }
    if let Some(job) = &args.job {
        config = config.with_job(job);
    }
    if let Some(image_uri) = &args.image_uri {
        config = config.with_image_uri(image_uri);
    }
    if let Some(run_cap) = args.run_cap {
        config = config.with_run_cap(run_cap);
    }

    let settings = BackendSettings::from_env();
    info!(base_url = %settings.base_url, "connecting to backend");
    let client = Arc::new(GraphqlClient::new(settings)?);

    let mut scheduler = Scheduler::new(client.clone(), client, config).await?;

    let token = scheduler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping scheduler");
            token.cancel();
        }
    });

    if let Err(e) = scheduler.start().await {
        error!(error = %e, "scheduler exited with error");
    }

    let state = scheduler.state();
    info!(%state, "scheduler finished");
    Ok(ExitCode::from(state.exit_code() as u8))
}

fn print_entrypoint(args: EntrypointArgs) -> anyhow::Result<ExitCode> {
    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    let sweep_config = SweepConfig::from_yaml(&raw)?;

    match construct_scheduler_entrypoint(&sweep_config, &args.queue, &args.project, args.num_workers)
    {
        Some(argv) => {
            println!("{}", serde_json::to_string(&argv)?);
            Ok(ExitCode::SUCCESS)
        }
        None => {
            error!("sweep config names neither a job nor an image_uri");
            Ok(ExitCode::FAILURE)
        }
    }
}
