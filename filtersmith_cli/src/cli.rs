use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use filtersmith_rs::config::{EngineConfig, RetryConfig, default_worker_count};

#[derive(Parser, Debug)]
#[command(
    name = "filtersmith",
    about = "Brute-force search over trade filter combinations"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the search plan of a configuration without running it
    #[command(name = "plan")]
    Plan(PlanArgs),
    /// Run one optimization job end to end
    #[command(name = "run")]
    Run(RunArgs),
}

impl Commands {
    pub fn common(&self) -> &CommonArgs {
        match self {
            Commands::Plan(args) => &args.common,
            Commands::Run(args) => &args.common,
        }
    }
}

#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Data directory holding configs/<id>.json and trades/<instrument>.json
    #[arg(long = "data-dir", value_hint = clap::ValueHint::DirPath)]
    pub data_dir: PathBuf,

    /// Configuration id to load
    #[arg(long = "config", alias = "config-id")]
    pub config_id: u64,

    /// Disable writing filtersmith.log into the data directory. When set,
    /// logs are only emitted to stdout.
    #[arg(long = "no-file-log", default_value_t = false)]
    pub no_file_log: bool,

    /// Reduce log noise (suppresses per-poll progress)
    #[arg(long = "quiet", default_value_t = false)]
    pub quiet: bool,
}

#[derive(Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Instrument whose trades are searched
    #[arg(long = "instrument")]
    pub instrument: String,

    /// Job id to run or resume (defaults to a fresh id)
    #[arg(long = "job-id")]
    pub job_id: Option<String>,

    /// Submit to the high-priority lane
    #[arg(long = "high-priority", default_value_t = false)]
    pub high_priority: bool,

    /// Number of worker threads (omit to use all cores but two)
    #[arg(long = "workers", alias = "n-jobs")]
    pub workers: Option<usize>,

    /// Work items pushed per queue call
    #[arg(long = "batch-size", default_value_t = 500)]
    pub batch_size: usize,

    /// Interval between queue drain polls, in milliseconds
    #[arg(long = "poll-ms", default_value_t = 5_000)]
    pub poll_ms: u64,

    /// Scored results kept per time window shard
    #[arg(long = "shard-top-k", default_value_t = 100)]
    pub shard_top_k: usize,

    /// Results kept in the final ranking
    #[arg(long = "top-n", default_value_t = 100)]
    pub top_n: usize,

    /// Total attempts for jobs failing on transport or persistence errors
    #[arg(long = "attempts", default_value_t = 2)]
    pub attempts: u32,

    /// Delegate the search to an external optimizer executable, invoked as
    /// `<program> <config id> <job id>`
    #[arg(long = "external", value_hint = clap::ValueHint::FilePath)]
    pub external: Option<PathBuf>,

    /// Write the final results as JSON to this file
    #[arg(long = "output", value_hint = clap::ValueHint::FilePath)]
    pub output: Option<PathBuf>,
}

impl RunArgs {
    pub fn into_engine_config(&self) -> Result<EngineConfig> {
        if self.batch_size == 0 {
            bail!("--batch-size must be at least 1");
        }
        if self.attempts == 0 {
            bail!("--attempts must be at least 1");
        }
        let defaults = EngineConfig::default();
        Ok(EngineConfig {
            n_workers: self.workers.unwrap_or_else(default_worker_count).max(1),
            producer_batch_size: self.batch_size,
            drain_poll_ms: self.poll_ms,
            shard_top_k: self.shard_top_k,
            final_top_n: self.top_n,
            retry: RetryConfig {
                attempts: self.attempts,
                ..RetryConfig::default()
            },
            quiet: self.common.quiet,
            ..defaults
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_args_map_onto_engine_config() {
        let cli = Cli::parse_from([
            "filtersmith",
            "run",
            "--data-dir",
            "/tmp/data",
            "--config",
            "3",
            "--instrument",
            "EURUSD",
            "--workers",
            "2",
            "--poll-ms",
            "10",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        let engine = args.into_engine_config().unwrap();
        assert_eq!(engine.n_workers, 2);
        assert_eq!(engine.drain_poll_ms, 10);
        assert_eq!(engine.producer_batch_size, 500);
        assert_eq!(engine.retry.attempts, 2);
        assert_eq!(args.common.config_id, 3);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let cli = Cli::parse_from([
            "filtersmith",
            "run",
            "--data-dir",
            "d",
            "--config",
            "1",
            "--instrument",
            "X",
            "--batch-size",
            "0",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert!(args.into_engine_config().is_err());
    }
}
