use std::path::Path;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::combinator::CombinationSpace;
use crate::config::{Configuration, EngineConfig, Settings};
use crate::criteria::{Criterion, build_enabled_criteria};
use crate::error::JobError;
use crate::external::ExternalOptimizer;
use crate::filter::PredefinedFilterSet;
use crate::producer::Producer;
use crate::progress::{ProgressTracker, format_duration, format_int};
use crate::scoring::{ScoredResult, StrategyBook, rank_final};
use crate::storage::{
    ConfigRepository, DuckStore, FileCatalog, JobStateStore, ResultPayload, ResultRepository,
    TradeRepository, TransientResultRepository,
};
use crate::trade::TradeRecord;
use crate::transport::{MemoryTransport, Transport, keys};
use crate::window::{WindowPlan, plan_windows};
use crate::worker::{ShardContext, ShardSignals, WorkerPool};

/// File name of the DuckDB store inside a data directory.
pub const STORE_FILE: &str = "filtersmith.duckdb";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Initializing,
    Expanding,
    Dispatching,
    AwaitingWorkers,
    Aggregating,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped
        )
    }
}

/// Durable checkpoint of a job, written after every completed shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    pub job_id: String,
    pub configuration_id: u64,
    pub total_combinations: u64,
    pub processed_count: u64,
    pub completed_shard_ids: Vec<String>,
    pub aggregated_top_results: Vec<ScoredResult>,
    pub status: JobStatus,
    /// SHA-256 of the planned search; a checkpoint is only resumed when
    /// it matches.
    pub fingerprint: String,
}

impl JobState {
    fn fresh(job_id: &str, configuration_id: u64, total: u64, fingerprint: String) -> Self {
        Self {
            job_id: job_id.to_string(),
            configuration_id,
            total_combinations: total,
            processed_count: 0,
            completed_shard_ids: Vec::new(),
            aggregated_top_results: Vec::new(),
            status: JobStatus::Initializing,
            fingerprint,
        }
    }

    pub fn is_shard_complete(&self, shard_id: &str) -> bool {
        self.completed_shard_ids.iter().any(|id| id == shard_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: String,
    pub configuration_id: u64,
    pub instrument: String,
}

impl JobRequest {
    pub fn new(job_id: impl Into<String>, configuration_id: u64, instrument: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            configuration_id,
            instrument: instrument.into(),
        }
    }
}

/// Successful end of a job. A job whose predefined filters leave no
/// trades still completes.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { results: Vec<ScoredResult> },
    Delegated { results: Vec<Value> },
    NoTradesMatched,
}

/// Where the combinatorial search runs.
#[derive(Debug, Clone, Default)]
pub enum Backend {
    #[default]
    InProcess,
    External(ExternalOptimizer),
}

/// Handles to every collaborator a job touches.
#[derive(Clone)]
pub struct Collaborators {
    pub configs: Arc<dyn ConfigRepository>,
    pub trades: Arc<dyn TradeRepository>,
    pub results: Arc<dyn ResultRepository>,
    pub transient: Arc<dyn TransientResultRepository>,
    pub states: Arc<dyn JobStateStore>,
    pub transport: Arc<dyn Transport>,
}

impl Collaborators {
    /// Catalog files under `data_dir`, a DuckDB store next to them and an
    /// in-process transport.
    pub fn file_backed(data_dir: &Path) -> Result<Self> {
        let catalog = Arc::new(FileCatalog::new(data_dir));
        let store = Arc::new(DuckStore::open(&data_dir.join(STORE_FILE))?);
        Ok(Self::from_parts(catalog, store, Arc::new(MemoryTransport::new())))
    }

    pub fn from_parts<C, S>(catalog: Arc<C>, store: Arc<S>, transport: Arc<dyn Transport>) -> Self
    where
        C: ConfigRepository + TradeRepository + 'static,
        S: ResultRepository + TransientResultRepository + JobStateStore + 'static,
    {
        Self {
            configs: catalog.clone(),
            trades: catalog,
            results: store.clone(),
            transient: store.clone(),
            states: store,
            transport,
        }
    }
}

/// The searched space of one job.
#[derive(Debug, Clone)]
pub struct JobPlan {
    pub criteria: Vec<Criterion>,
    pub space: CombinationSpace,
    pub windows: WindowPlan,
    /// Base combinations enumerated per shard.
    pub per_shard: u128,
    pub fingerprint: String,
}

impl JobPlan {
    pub fn build(settings: &Settings) -> Result<Self> {
        let criteria = build_enabled_criteria(&settings.combinations_to_test);
        let space = CombinationSpace::new(&criteria);
        let windows = plan_windows(settings)?;
        let per_shard = match settings.max_combinations_to_test {
            Some(limit) => space.total().min(u128::from(limit)),
            None => space.total(),
        };
        let fingerprint = fingerprint(&criteria, &windows, settings)?;
        Ok(Self {
            criteria,
            space,
            windows,
            per_shard,
            fingerprint,
        })
    }

    /// Work items across every shard.
    pub fn total(&self) -> u128 {
        self.per_shard
            .saturating_mul(self.windows.windows.len() as u128)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScoringFingerprint<'a> {
    prefilters: &'a [crate::config::PredefinedFilter],
    min_sl_to_tp_ratio: f64,
    max_tp_to_sl_ratio: f64,
    min_win_rate: f64,
    min_profit_factor: f64,
    min_trade_count: usize,
    ranking_weights: crate::config::RankingWeights,
    s2_setup_only: bool,
    max_combinations_to_test: Option<u64>,
}

/// Hex SHA-256 over the criteria (in order), window labels and the
/// settings that change scores.
pub fn fingerprint(criteria: &[Criterion], plan: &WindowPlan, settings: &Settings) -> Result<String> {
    let mut parts = Vec::with_capacity(criteria.len() + plan.windows.len() + 1);
    for criterion in criteria {
        let options: Vec<String> = criterion
            .options()
            .iter()
            .map(|option| match option {
                Some(condition) => condition.to_string(),
                None => "*".to_string(),
            })
            .collect();
        parts.push(format!("C|{}|{}", criterion.column_header, options.join(",")));
    }
    for window in &plan.windows {
        parts.push(format!("W|{}", window.label()));
    }
    let scoring = ScoringFingerprint {
        prefilters: &plan.prefilters,
        min_sl_to_tp_ratio: settings.min_sl_to_tp_ratio,
        max_tp_to_sl_ratio: settings.max_tp_to_sl_ratio,
        min_win_rate: settings.min_win_rate,
        min_profit_factor: settings.min_profit_factor,
        min_trade_count: settings.min_trade_count,
        ranking_weights: settings.ranking_weights,
        s2_setup_only: settings.s2_setup_only,
        max_combinations_to_test: settings.max_combinations_to_test,
    };
    parts.push(format!(
        "S|{}",
        serde_json::to_string(&scoring).context("failed to encode scoring settings")?
    ));
    let joined = parts.join("\n");
    Ok(hex::encode(Sha256::digest(joined.as_bytes())))
}

fn saturating_u64(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

/// Drives one job through its states. At most one coordinator owns a job
/// id at a time.
pub struct JobCoordinator {
    collaborators: Collaborators,
    engine: EngineConfig,
    backend: Backend,
    pool: Arc<WorkerPool>,
    book: StrategyBook,
}

impl JobCoordinator {
    pub fn new(collaborators: Collaborators, engine: EngineConfig) -> Result<Self> {
        let pool = Arc::new(WorkerPool::new(&engine)?);
        Ok(Self {
            collaborators,
            engine,
            backend: Backend::InProcess,
            pool,
            book: StrategyBook::new()?,
        })
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    /// Run `request` to a terminal state. Every failure or stop path
    /// removes the job's queue, transient rows and stop flag; the
    /// checkpoint is kept so a later run can resume.
    pub fn run(&self, request: &JobRequest) -> Result<JobOutcome, JobError> {
        let transport = &*self.collaborators.transport;
        let lease_key = keys::lease(&request.job_id);
        let owner = format!("{}:{}", std::process::id(), Utc::now().timestamp_millis());
        if !transport.set_if_absent(&lease_key, &owner, Some(self.engine.lease()))? {
            warn!(job_id = %request.job_id, "Job is already owned by another coordinator");
            return Err(JobError::AlreadyRunning(request.job_id.clone()));
        }

        let started = Utc::now();
        let outcome = match &self.backend {
            Backend::InProcess => self.run_in_process(request, started),
            Backend::External(optimizer) => self.run_external(request, optimizer, started),
        };

        if let Err(error) = &outcome {
            let status = if error.is_stop() {
                JobStatus::Stopped
            } else {
                JobStatus::Failed
            };
            warn!(job_id = %request.job_id, ?status, error = %error, "Job ended without a result");
            if let Err(cleanup_error) = self.cleanup(&request.job_id) {
                warn!(job_id = %request.job_id, error = %format!("{cleanup_error:#}"), "Cleanup after failure did not complete");
            }
            if let Err(state_error) = self.mark_terminal(&request.job_id, status) {
                warn!(job_id = %request.job_id, error = %format!("{state_error:#}"), "Failed to record terminal job status");
            }
        }

        if let Err(error) = transport.delete(&lease_key) {
            warn!(job_id = %request.job_id, error = %format!("{error:#}"), "Failed to release job lease");
        }
        outcome
    }

    /// Remove the queue, transient rows and stop flag of a job. Safe to
    /// repeat.
    pub fn cleanup(&self, job_id: &str) -> Result<()> {
        let transport = &*self.collaborators.transport;
        transport.delete(&keys::queue(job_id))?;
        transport.delete(&keys::stop_flag(job_id))?;
        self.collaborators.transient.delete_all(job_id)?;
        debug!(job_id, "Cleaned up job transient state");
        Ok(())
    }

    fn mark_terminal(&self, job_id: &str, status: JobStatus) -> Result<()> {
        if let Some(mut state) = self.collaborators.states.load(job_id)? {
            state.status = status;
            self.collaborators.states.save(&state)?;
        }
        Ok(())
    }

    fn load_configuration(&self, id: u64) -> Result<Configuration, JobError> {
        self.collaborators
            .configs
            .get(id)?
            .ok_or(JobError::ConfigurationNotFound(id))
    }

    fn run_external(
        &self,
        request: &JobRequest,
        optimizer: &ExternalOptimizer,
        started: DateTime<Utc>,
    ) -> Result<JobOutcome, JobError> {
        let configuration = self.load_configuration(request.configuration_id)?;
        let results = optimizer.run(
            request.configuration_id,
            &request.job_id,
            &*self.collaborators.transport,
        )?;
        self.collaborators.results.save(
            &configuration,
            &ResultPayload::Raw(results.clone()),
            started,
        )?;
        self.cleanup(&request.job_id)?;
        Ok(JobOutcome::Delegated { results })
    }

    /// Checkpoint for this job if it matches the freshly planned search.
    fn resume_state(&self, request: &JobRequest, plan: &JobPlan) -> Result<Option<JobState>> {
        let Some(state) = self.collaborators.states.load(&request.job_id)? else {
            return Ok(None);
        };
        if state.fingerprint != plan.fingerprint {
            warn!(
                job_id = %request.job_id,
                stored = %state.fingerprint,
                planned = %plan.fingerprint,
                "Discarding checkpoint planned for a different search"
            );
            self.collaborators.states.delete(&request.job_id)?;
            return Ok(None);
        }
        if state.status == JobStatus::Completed {
            return Ok(None);
        }
        Ok(Some(state))
    }

    fn save_state(&self, state: &mut JobState, status: JobStatus) -> Result<()> {
        state.status = status;
        self.collaborators.states.save(state)
    }

    fn run_in_process(&self, request: &JobRequest, started: DateTime<Utc>) -> Result<JobOutcome, JobError> {
        let job_id = request.job_id.as_str();
        let transport = &*self.collaborators.transport;

        // Initializing
        let configuration = self.load_configuration(request.configuration_id)?;
        let settings = &configuration.settings;

        // Expanding
        let plan = JobPlan::build(settings).map_err(JobError::invalid_plan)?;
        let total = saturating_u64(plan.total());
        let resumed = self.resume_state(request, &plan)?;
        let resuming = resumed.is_some();
        let mut state = resumed.unwrap_or_else(|| {
            JobState::fresh(job_id, configuration.id, total, plan.fingerprint.clone())
        });
        state.total_combinations = total;
        transport.set(&keys::total(job_id), &total.to_string(), None)?;
        transport.set(&keys::progress(job_id), &state.processed_count.to_string(), None)?;
        self.save_state(&mut state, JobStatus::Expanding)?;

        info!(
            job_id,
            configuration = configuration.id,
            criteria = plan.criteria.len(),
            per_shard = %format_int(plan.per_shard),
            shards = plan.windows.windows.len(),
            total = %format_int(total),
            resuming,
            completed_shards = state.completed_shard_ids.len(),
            "Planned optimization job"
        );

        let trades = self.collaborators.trades.find_all(&request.instrument)?;
        let prefilters =
            PredefinedFilterSet::compile(&plan.windows.prefilters).map_err(JobError::invalid_plan)?;
        let prefiltered: Vec<&TradeRecord> = prefilters.apply(trades.iter());
        if prefiltered.is_empty() {
            info!(
                job_id,
                loaded = trades.len(),
                "No trades matched the predefined filters; recording empty result"
            );
            self.collaborators
                .results
                .save(&configuration, &ResultPayload::NoTradesMatched, started)?;
            self.cleanup(job_id)?;
            self.collaborators.states.delete(job_id)?;
            return Ok(JobOutcome::NoTradesMatched);
        }

        if resuming {
            // Items and rows of the interrupted shard are regenerated.
            self.cleanup(job_id)?;
        }

        let mut tracker = ProgressTracker::new(plan.total(), u128::from(state.processed_count));
        for window in &plan.windows.windows {
            let shard_id = window.label();
            if state.is_shard_complete(&shard_id) {
                info!(job_id, shard = %shard_id, "Skipping shard completed before resume");
                continue;
            }
            self.save_state(&mut state, JobStatus::Dispatching)?;
            tracker.begin_shard(plan.per_shard);

            let ctx = ShardContext {
                job_id,
                trades: &prefiltered,
                settings,
                book: &self.book,
                transport,
                results: &*self.collaborators.transient,
                progress: &tracker,
            };
            let (produced, stats) = self.pool.run_shard(&ctx, |signals| {
                let produced = Producer::new(transport, &self.engine).produce_shard(
                    job_id,
                    &plan.space,
                    *window,
                    settings.max_combinations_to_test,
                    signals,
                )?;
                self.wait_for_drain(job_id, signals, &tracker)?;
                Ok(produced)
            })?;

            let top = self
                .collaborators
                .transient
                .top_n_by_score(job_id, self.engine.shard_top_k)?;
            let mut shard_results = Vec::with_capacity(top.len());
            for payload in &top {
                let result: ScoredResult = serde_json::from_str(payload)
                    .context("stored transient result is not a scored result")?;
                shard_results.push(result);
            }
            info!(
                job_id,
                shard = %shard_id,
                produced = %format_int(produced),
                stored = %format_int(stats.stored),
                kept = shard_results.len(),
                "Shard drained"
            );

            state.aggregated_top_results.extend(shard_results);
            state.completed_shard_ids.push(shard_id);
            state.processed_count = state
                .processed_count
                .saturating_add(saturating_u64(plan.per_shard));
            tracker.finish_shard();
            transport.set(&keys::progress(job_id), &state.processed_count.to_string(), None)?;
            self.save_state(&mut state, JobStatus::AwaitingWorkers)?;
            self.collaborators.transient.delete_all(job_id)?;
        }

        // Aggregating
        self.save_state(&mut state, JobStatus::Aggregating)?;
        let aggregated = std::mem::take(&mut state.aggregated_top_results);
        let results = rank_final(aggregated, self.engine.final_top_n);
        self.collaborators.results.save(
            &configuration,
            &ResultPayload::Ranked(results.clone()),
            started,
        )?;
        self.cleanup(job_id)?;
        self.collaborators.states.delete(job_id)?;
        info!(
            job_id,
            results = results.len(),
            elapsed = %format_duration(tracker.elapsed()),
            "Job completed"
        );
        Ok(JobOutcome::Completed { results })
    }

    /// Poll until the job queue is empty, checking the stop flag and
    /// renewing the lease on every poll.
    fn wait_for_drain(
        &self,
        job_id: &str,
        signals: &ShardSignals,
        tracker: &ProgressTracker,
    ) -> Result<(), JobError> {
        let transport = &*self.collaborators.transport;
        let queue = keys::queue(job_id);
        let stop = keys::stop_flag(job_id);
        let lease_key = keys::lease(job_id);
        loop {
            if transport.exists(&stop)? {
                info!(job_id, "Stop flag observed while waiting for workers");
                return Err(JobError::StoppedByUser(job_id.to_string()));
            }
            if signals.is_shutdown() {
                // A worker failed; its error is reported by the pool.
                return Ok(());
            }
            let remaining = transport.queue_len(&queue)?;
            if remaining == 0 {
                return Ok(());
            }
            transport.expire(&lease_key, self.engine.lease())?;
            let processed = tracker.processed(remaining as u128);
            if !self.engine.quiet {
                debug!(
                    job_id,
                    remaining = %format_int(remaining as u64),
                    processed = %format_int(processed),
                    eta = %tracker.eta(remaining as u128).map(format_duration).unwrap_or_else(|| "-".into()),
                    "Waiting for workers to drain queue"
                );
            }
            thread::sleep(self.engine.drain_poll());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RankingWeights;
    use crate::window::TimeWindow;

    fn settings() -> Settings {
        Settings {
            combinations_to_test: vec!["Gaussian".into()],
            ranking_weights: RankingWeights {
                profit_factor: 1.0,
                win_rate: 1.0,
                ..Default::default()
            },
            ..Settings::default()
        }
    }

    #[test]
    fn plan_counts_items_across_shards() {
        let plan = JobPlan::build(&settings()).unwrap();
        assert_eq!(plan.criteria.len(), 7);
        assert_eq!(plan.per_shard, 128);
        assert_eq!(plan.windows.windows, vec![TimeWindow::Any]);
        assert_eq!(plan.total(), 128);

        let capped = Settings {
            max_combinations_to_test: Some(10),
            ..settings()
        };
        assert_eq!(JobPlan::build(&capped).unwrap().per_shard, 10);
    }

    #[test]
    fn fingerprint_tracks_scoring_settings() {
        let a = JobPlan::build(&settings()).unwrap();
        let b = JobPlan::build(&settings()).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.fingerprint.len(), 64);

        let mut changed = settings();
        changed.min_trade_count = 9;
        assert_ne!(JobPlan::build(&changed).unwrap().fingerprint, a.fingerprint);
    }

    #[test]
    fn job_state_round_trips_as_camel_case() {
        let state = JobState::fresh("j", 3, 10, "abc".into());
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["jobId"], "j");
        assert_eq!(json["completedShardIds"], serde_json::json!([]));
        assert_eq!(json["status"], "Initializing");
        let back: JobState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
        assert!(!back.status.is_terminal());
    }
}
