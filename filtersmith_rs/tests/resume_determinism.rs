mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use common::{INSTRUMENT, configuration, engine, fixture, session_trades, time_filter, weights};
use filtersmith_rs::config::Settings;
use filtersmith_rs::coordinator::{Collaborators, JobCoordinator, JobOutcome, JobRequest, JobStatus};
use filtersmith_rs::error::JobError;
use filtersmith_rs::scoring::ScoredResult;
use filtersmith_rs::storage::{DuckStore, JobStateStore, MemoryCatalog, TransientResultRepository};
use filtersmith_rs::transport::{Transport, keys};

/// Fails the `fail_on`-th top-N pull, as if the store went away right
/// after a shard drained.
struct FlakyTransient {
    inner: Arc<DuckStore>,
    fail_on: usize,
    calls: AtomicUsize,
}

impl TransientResultRepository for FlakyTransient {
    fn save(&self, job_id: &str, score: f64, payload: &str) -> Result<()> {
        TransientResultRepository::save(&*self.inner, job_id, score, payload)
    }

    fn top_n_by_score(&self, job_id: &str, n: usize) -> Result<Vec<String>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(anyhow!("simulated store outage"));
        }
        self.inner.top_n_by_score(job_id, n)
    }

    fn delete_all(&self, job_id: &str) -> Result<()> {
        self.inner.delete_all(job_id)
    }

    fn count(&self, job_id: &str) -> Result<usize> {
        self.inner.count(job_id)
    }
}

fn shifted_settings() -> Settings {
    Settings {
        combinations_to_test: vec!["Gaussian".into()],
        predefined_filters: vec![time_filter("08:00", "10:00")],
        enable_time_shift: true,
        time_window_min_shift_hours: -1.0,
        time_window_max_shift_hours: 1.0,
        time_window_shift_step_minutes: 60,
        min_trade_count: 2,
        ranking_weights: weights(),
        ..Settings::default()
    }
}

fn catalog() -> MemoryCatalog {
    MemoryCatalog::new()
        .with_configuration(configuration(5, shifted_settings()))
        .with_trades(INSTRUMENT, session_trades(60))
}

fn identities(results: &[ScoredResult]) -> Vec<(String, f64)> {
    results
        .iter()
        .map(|result| (result.identity_key(), result.overall_score))
        .collect()
}

fn completed(outcome: JobOutcome) -> Vec<ScoredResult> {
    match outcome {
        JobOutcome::Completed { results } => results,
        other => panic!("expected ranked results, got {other:?}"),
    }
}

#[test]
fn resumed_job_matches_uninterrupted_run() -> Result<()> {
    let baseline_fx = fixture(catalog());
    let baseline = completed(
        JobCoordinator::new(baseline_fx.collaborators.clone(), engine())?
            .run(&JobRequest::new("straight", 5, INSTRUMENT))?,
    );
    assert!(!baseline.is_empty());

    let fx = fixture(catalog());
    let flaky = Collaborators {
        transient: Arc::new(FlakyTransient {
            inner: Arc::clone(&fx.store),
            fail_on: 2,
            calls: AtomicUsize::new(0),
        }),
        ..fx.collaborators.clone()
    };
    let err = JobCoordinator::new(flaky, engine())?
        .run(&JobRequest::new("resumed", 5, INSTRUMENT))
        .unwrap_err();
    assert!(matches!(err, JobError::Transport(_)));
    assert!(err.is_retryable());

    let checkpoint = fx.store.load("resumed")?.expect("checkpoint after first shard");
    assert_eq!(checkpoint.status, JobStatus::Failed);
    assert_eq!(checkpoint.completed_shard_ids.len(), 1);
    assert!(checkpoint.total_combinations > checkpoint.processed_count);
    assert_eq!(fx.transport.queue_len(&keys::queue("resumed"))?, 0);

    let resumed = completed(
        JobCoordinator::new(fx.collaborators.clone(), engine())?
            .run(&JobRequest::new("resumed", 5, INSTRUMENT))?,
    );
    assert_eq!(identities(&resumed), identities(&baseline));
    assert!(fx.store.load("resumed")?.is_none());
    Ok(())
}

#[test]
fn checkpoint_for_a_different_plan_is_discarded() -> Result<()> {
    let fx = fixture(catalog());
    let flaky = Collaborators {
        transient: Arc::new(FlakyTransient {
            inner: Arc::clone(&fx.store),
            fail_on: 2,
            calls: AtomicUsize::new(0),
        }),
        ..fx.collaborators.clone()
    };
    assert!(
        JobCoordinator::new(flaky, engine())?
            .run(&JobRequest::new("stale", 5, INSTRUMENT))
            .is_err()
    );
    let mut checkpoint = fx.store.load("stale")?.expect("checkpoint");
    checkpoint.fingerprint = "0".repeat(64);
    checkpoint.aggregated_top_results.clear();
    JobStateStore::save(&*fx.store, &checkpoint)?;

    let baseline_fx = fixture(catalog());
    let baseline = completed(
        JobCoordinator::new(baseline_fx.collaborators.clone(), engine())?
            .run(&JobRequest::new("fresh", 5, INSTRUMENT))?,
    );
    let rerun = completed(
        JobCoordinator::new(fx.collaborators.clone(), engine())?
            .run(&JobRequest::new("stale", 5, INSTRUMENT))?,
    );
    assert_eq!(identities(&rerun), identities(&baseline));
    Ok(())
}

#[test]
fn progress_counters_reach_the_total() -> Result<()> {
    let fx = fixture(catalog());
    completed(
        JobCoordinator::new(fx.collaborators.clone(), engine())?
            .run(&JobRequest::new("counted", 5, INSTRUMENT))?,
    );
    let total = fx.transport.get(&keys::total("counted"))?.expect("total");
    let progress = fx.transport.get(&keys::progress("counted"))?.expect("progress");
    assert_eq!(total, progress);
    assert!(total.parse::<u64>()? > 128);
    Ok(())
}
