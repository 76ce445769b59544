use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info, warn};

use crate::combinator::WorkItem;
use crate::config::{EngineConfig, Settings};
use crate::error::JobError;
use crate::filter::{CompiledCombination, PredefinedFilterSet};
use crate::progress::{ProgressTracker, format_int};
use crate::scoring::{ScoredResult, StrategyBook, score_combination};
use crate::storage::TransientResultRepository;
use crate::trade::TradeRecord;
use crate::transport::{Transport, keys};
use crate::window::TimeWindow;

/// Everything a worker needs to evaluate the items of one shard.
pub struct ShardContext<'a> {
    pub job_id: &'a str,
    /// Trades that already passed the job's predefined filters. Shared
    /// read-only by every worker.
    pub trades: &'a [&'a TradeRecord],
    pub settings: &'a Settings,
    pub book: &'a StrategyBook,
    pub transport: &'a dyn Transport,
    pub results: &'a dyn TransientResultRepository,
    pub progress: &'a ProgressTracker,
}

/// Flags shared between the shard driver and its worker loops.
#[derive(Debug, Default)]
pub struct ShardSignals {
    production_done: AtomicBool,
    shutdown: AtomicBool,
}

impl ShardSignals {
    /// Ask every loop to exit without draining the queue.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn finish_production(&self) {
        self.production_done.store(true, Ordering::SeqCst);
    }

    fn production_finished(&self) -> bool {
        self.production_done.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub popped: u64,
    pub stored: u64,
    pub discarded: u64,
    pub malformed: u64,
}

impl WorkerStats {
    fn merge(&mut self, other: WorkerStats) {
        self.popped += other.popped;
        self.stored += other.stored;
        self.discarded += other.discarded;
        self.malformed += other.malformed;
    }
}

/// Fixed-size pool of consumer loops shared by every job.
pub struct WorkerPool {
    pool: ThreadPool,
    n_workers: usize,
    engine: EngineConfig,
}

impl WorkerPool {
    pub fn new(engine: &EngineConfig) -> Result<Self> {
        let n_workers = engine.n_workers.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(n_workers)
            .thread_name(|index| format!("filtersmith-worker-{index}"))
            .build()
            .context("Failed to build worker pool")?;
        Ok(Self {
            pool,
            n_workers,
            engine: engine.clone(),
        })
    }

    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    /// Run the worker loops for one shard while `drive` executes on the
    /// calling thread. `drive` produces the shard and waits for the queue to
    /// drain; once it returns the loops finish their current item and are
    /// joined. A worker failure takes precedence over the driver's result.
    pub fn run_shard<R, F>(&self, ctx: &ShardContext<'_>, drive: F) -> Result<(R, WorkerStats), JobError>
    where
        F: FnOnce(&ShardSignals) -> Result<R, JobError>,
    {
        let signals = ShardSignals::default();
        let (tx, rx) = mpsc::channel::<Result<WorkerStats, JobError>>();

        let driven = self.pool.in_place_scope(|scope| {
            for worker_id in 0..self.n_workers {
                let tx = tx.clone();
                let signals = &signals;
                let engine = &self.engine;
                scope.spawn(move |_| {
                    let outcome = worker_loop(worker_id, ctx, signals, engine);
                    if outcome.is_err() {
                        signals.shutdown();
                    }
                    // The receiver outlives the scope.
                    let _ = tx.send(outcome);
                });
            }
            let driven = drive(&signals);
            match &driven {
                Ok(_) => signals.finish_production(),
                Err(_) => signals.shutdown(),
            }
            driven
        });
        drop(tx);

        let mut stats = WorkerStats::default();
        let mut worker_error = None;
        for outcome in rx {
            match outcome {
                Ok(worker_stats) => stats.merge(worker_stats),
                Err(error) => {
                    if worker_error.is_none() {
                        worker_error = Some(error);
                    }
                }
            }
        }
        if let Some(error) = worker_error {
            return Err(error);
        }
        let value = driven?;
        info!(
            job_id = ctx.job_id,
            popped = %format_int(stats.popped),
            stored = %format_int(stats.stored),
            discarded = %format_int(stats.discarded),
            malformed = stats.malformed,
            "Shard workers finished"
        );
        Ok((value, stats))
    }
}

struct WindowCache<'a> {
    entries: Vec<(TimeWindow, Vec<&'a TradeRecord>)>,
}

impl<'a> WindowCache<'a> {
    fn trades_for(&mut self, window: TimeWindow, all: &'a [&'a TradeRecord]) -> &[&'a TradeRecord] {
        if window.is_any() {
            return all;
        }
        let position = match self.entries.iter().position(|(cached, _)| *cached == window) {
            Some(position) => position,
            None => {
                let narrowed = PredefinedFilterSet::for_window(window).apply(all.iter().copied());
                self.entries.push((window, narrowed));
                self.entries.len() - 1
            }
        };
        &self.entries[position].1
    }
}

fn worker_loop(
    worker_id: usize,
    ctx: &ShardContext<'_>,
    signals: &ShardSignals,
    engine: &EngineConfig,
) -> Result<WorkerStats, JobError> {
    let queue = keys::queue(ctx.job_id);
    let stop = keys::stop_flag(ctx.job_id);
    let progress_every = engine.progress_every.max(1) as u64;
    let mut stats = WorkerStats::default();
    let mut windows = WindowCache {
        entries: Vec::new(),
    };

    loop {
        if signals.is_shutdown() {
            break;
        }
        let Some(raw) = ctx.transport.pop_front(&queue)? else {
            // Production may have pushed between the pop and the flag read.
            if signals.production_finished() && ctx.transport.queue_len(&queue)? == 0 {
                break;
            }
            thread::sleep(engine.idle_poll());
            continue;
        };
        stats.popped += 1;

        if stats.popped % progress_every == 0 {
            if ctx.transport.exists(&stop)? {
                debug!(job_id = ctx.job_id, worker_id, "Worker observed stop flag");
                return Err(JobError::StoppedByUser(ctx.job_id.to_string()));
            }
            let remaining = ctx.transport.queue_len(&queue)? as u128;
            let processed = ctx.progress.processed(remaining);
            ctx.transport
                .set(&keys::progress(ctx.job_id), &processed.to_string(), None)?;
        }

        let item = match WorkItem::decode(&raw) {
            Ok(item) => item,
            Err(error) => {
                warn!(job_id = ctx.job_id, worker_id, error = %format!("{error:#}"), "Skipping malformed work item");
                stats.malformed += 1;
                continue;
            }
        };
        let compiled = match CompiledCombination::compile(&item.combination) {
            Ok(compiled) => compiled,
            Err(error) => {
                warn!(job_id = ctx.job_id, worker_id, error = %format!("{error:#}"), "Skipping work item with unknown column");
                stats.malformed += 1;
                continue;
            }
        };

        let candidates = windows.trades_for(item.time_window, ctx.trades);
        let filtered = compiled.apply(candidates);
        if filtered.len() < ctx.settings.min_trade_count {
            stats.discarded += 1;
            continue;
        }
        let Some(score) = score_combination(&filtered, compiled.lta_flag(), ctx.settings, ctx.book)
        else {
            stats.discarded += 1;
            continue;
        };
        if !score.overall_score.is_finite() {
            stats.discarded += 1;
            continue;
        }

        let overall = score.overall_score;
        let result = ScoredResult::new(item, filtered.len(), score);
        let payload = serde_json::to_string(&result).context("failed to encode scored result")?;
        ctx.results.save(ctx.job_id, overall, &payload)?;
        stats.stored += 1;
    }

    Ok(stats)
}
