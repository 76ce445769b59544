mod cli;

use std::fs::{self, OpenOptions};
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use cli::{Cli, Commands, PlanArgs, RunArgs};
use filtersmith_rs::coordinator::{Backend, Collaborators, JobCoordinator, JobOutcome, JobPlan};
use filtersmith_rs::external::ExternalOptimizer;
use filtersmith_rs::progress::format_int;
use filtersmith_rs::service::JobService;
use filtersmith_rs::storage::{ConfigRepository, FileCatalog, NO_TRADES_MESSAGE};
use filtersmith_rs::{JobError, ScoredResult};
use tracing::info;
use tracing_appender::non_blocking;
use tracing_subscriber::{EnvFilter, prelude::*};

/// Environment variable overriding the default log filter.
const LOG_ENV: &str = "FILTERSMITH_LOG";
/// Name of the log file written into the data directory.
const LOG_FILE: &str = "filtersmith.log";

/// Engine and CLI events at info, dependencies at warn. `--quiet` keeps
/// only the CLI summary lines and warnings.
fn default_filter(quiet: bool) -> &'static str {
    if quiet {
        "warn,filtersmith_cli=info"
    } else {
        "warn,filtersmith_rs=info,filtersmith_cli=info"
    }
}

fn init_tracing(log_file: Option<PathBuf>, quiet: bool) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_filter(quiet)));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stdout);

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create log directory {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let (writer, guard) = non_blocking(file);
            // The writer flushes on a background thread owned by the guard.
            let _guard = Box::leak(Box::new(guard));
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_thread_names(true)
                    .with_writer(writer),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!("failed to initialize tracing: {err}"))
}

fn log_invocation(log_file: Option<&PathBuf>) {
    let cwd = std::env::current_dir().ok();
    let argv: Vec<String> = std::env::args_os()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    info!("==================== new filtersmith run ====================");
    info!(
        version = env!("CARGO_PKG_VERSION"),
        cwd = ?cwd,
        log_file = ?log_file,
        argv = ?argv,
        "filtersmith_cli invoked"
    );
}

fn run_plan(args: PlanArgs) -> Result<()> {
    let catalog = FileCatalog::new(&args.common.data_dir);
    let configuration = catalog
        .get(args.common.config_id)?
        .ok_or(JobError::ConfigurationNotFound(args.common.config_id))?;
    let plan = JobPlan::build(&configuration.settings)?;

    info!(
        configuration = configuration.id,
        name = %configuration.name,
        groups = ?configuration.settings.combinations_to_test,
        "Loaded configuration"
    );
    for criterion in &plan.criteria {
        info!(
            column = %criterion.column_header,
            options = criterion.option_count(),
            "Criterion"
        );
    }
    let labels: Vec<String> = plan.windows.windows.iter().map(|w| w.label()).collect();
    info!(
        prefilters = plan.windows.prefilters.len(),
        windows = ?labels,
        "Time window shards"
    );
    info!(
        per_shard = %format_int(plan.per_shard),
        total = %format_int(plan.total()),
        fingerprint = %plan.fingerprint,
        "Plan summary"
    );
    Ok(())
}

fn log_top(results: &[ScoredResult]) {
    for (rank, result) in results.iter().take(10).enumerate() {
        info!(
            rank = rank + 1,
            score = result.overall_score,
            trades = result.overall_trade_count,
            window = %result.time_window,
            combination = %result.combination,
            "Top result"
        );
    }
}

fn run_job(args: RunArgs) -> Result<()> {
    let engine = args.into_engine_config()?;
    let collaborators = Collaborators::file_backed(&args.common.data_dir)?;
    let backend = match &args.external {
        Some(program) => Backend::External(ExternalOptimizer::new(program)),
        None => Backend::InProcess,
    };
    let coordinator = JobCoordinator::new(collaborators, engine)?.with_backend(backend);
    let service = JobService::start(coordinator)?;

    let job_id = match &args.job_id {
        Some(job_id) => {
            service.submit_as(job_id, args.common.config_id, &args.instrument, args.high_priority)?;
            job_id.clone()
        }
        None => service.submit(args.common.config_id, &args.instrument, args.high_priority)?,
    };
    let report = service
        .wait(&job_id)?
        .ok_or_else(|| anyhow!("job {job_id} vanished from the service"))?;
    service.shutdown();

    let outcome = report.outcome?;
    let payload = match &outcome {
        JobOutcome::Completed { results } => {
            info!(job_id = %job_id, results = results.len(), attempts = report.attempts, "Job completed");
            log_top(results);
            serde_json::to_value(results)?
        }
        JobOutcome::Delegated { results } => {
            info!(job_id = %job_id, results = results.len(), "External optimizer completed");
            serde_json::Value::Array(results.clone())
        }
        JobOutcome::NoTradesMatched => {
            info!(job_id = %job_id, "{NO_TRADES_MESSAGE}");
            serde_json::json!({ "message": NO_TRADES_MESSAGE })
        }
    };

    if let Some(path) = &args.output {
        let raw = serde_json::to_string_pretty(&payload)?;
        fs::write(path, raw).with_context(|| format!("Unable to write {}", path.display()))?;
        info!(path = %path.display(), "Results written");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let common = cli.command.common();
    let log_file = if common.no_file_log {
        None
    } else {
        Some(common.data_dir.join(LOG_FILE))
    };

    init_tracing(log_file.clone(), common.quiet)?;
    log_invocation(log_file.as_ref());

    match cli.command {
        Commands::Plan(args) => run_plan(args),
        Commands::Run(args) => run_job(args),
    }
}
