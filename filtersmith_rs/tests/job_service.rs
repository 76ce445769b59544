mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use common::{
    INSTRUMENT, configuration, engine, example_trades, fixture, session_trades, time_filter,
    weights,
};
use filtersmith_rs::config::Settings;
use filtersmith_rs::coordinator::{Collaborators, JobCoordinator, JobOutcome};
use filtersmith_rs::service::JobService;
use filtersmith_rs::storage::{DuckStore, MemoryCatalog, TransientResultRepository};
use filtersmith_rs::transport::{Transport, keys};

fn example_settings() -> Settings {
    Settings {
        combinations_to_test: vec!["Closed In LTA".into()],
        predefined_filters: vec![time_filter("09:00", "09:30")],
        min_trade_count: 1,
        ranking_weights: weights(),
        ..Settings::default()
    }
}

fn large_settings() -> Settings {
    Settings {
        combinations_to_test: vec![
            "Gaussian".into(),
            "Candle Closed".into(),
            "Candle Open".into(),
        ],
        min_trade_count: 1,
        ranking_weights: weights(),
        ..Settings::default()
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn submitted_job_runs_to_completion() -> Result<()> {
    let catalog = MemoryCatalog::new()
        .with_configuration(configuration(1, example_settings()))
        .with_trades(INSTRUMENT, example_trades());
    let fx = fixture(catalog);
    let service = JobService::start(JobCoordinator::new(fx.collaborators.clone(), engine())?)?;

    let job_id = service.submit(1, INSTRUMENT, false)?;
    assert!(job_id.starts_with("job-"));
    let report = service.wait(&job_id)?.expect("report for submitted job");
    assert_eq!(report.attempts, 1);
    match report.outcome? {
        JobOutcome::Completed { results } => assert_eq!(results.len(), 1),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(service.query_active()?.is_empty());
    assert!(service.wait("never-submitted")?.is_none());
    service.shutdown();
    Ok(())
}

#[test]
fn stop_reaches_running_and_queued_jobs() -> Result<()> {
    let catalog = MemoryCatalog::new()
        .with_configuration(configuration(3, large_settings()))
        .with_trades(INSTRUMENT, session_trades(40));
    let fx = fixture(catalog);
    let service = JobService::start(JobCoordinator::new(fx.collaborators.clone(), engine())?)?;

    let running = service.submit(3, INSTRUMENT, false)?;
    let queued = service.submit(3, INSTRUMENT, false)?;
    let transport = Arc::clone(&fx.transport);
    let total_key = keys::total(&running);
    wait_until(|| transport.exists(&total_key).unwrap_or(false));

    let active = service.query_active()?;
    assert_eq!(active.len(), 2);
    assert_eq!(active[0].job_id, running);
    assert_eq!(active[0].total_combinations, 128 * 64 * 64);
    assert!((0.0..=1.0).contains(&active[0].progress));
    assert_eq!(active[1].job_id, queued);

    service.request_stop(&queued)?;
    let report = service.wait(&queued)?.expect("queued report");
    assert_eq!(report.attempts, 0);
    assert!(report.outcome.unwrap_err().is_stop());

    service.request_stop(&running)?;
    let report = service.wait(&running)?.expect("running report");
    assert_eq!(report.attempts, 1);
    assert!(report.outcome.unwrap_err().is_stop());

    assert_eq!(fx.transport.queue_len(&keys::queue(&running))?, 0);
    assert!(!fx.transport.exists(&keys::stop_flag(&running))?);
    assert!(!fx.transport.exists(&keys::lease(&running))?);
    assert_eq!(fx.store.count(&running)?, 0);
    service.shutdown();
    Ok(())
}

struct FailingOnce {
    inner: Arc<DuckStore>,
    calls: AtomicUsize,
}

impl TransientResultRepository for FailingOnce {
    fn save(&self, job_id: &str, score: f64, payload: &str) -> Result<()> {
        TransientResultRepository::save(&*self.inner, job_id, score, payload)
    }

    fn top_n_by_score(&self, job_id: &str, n: usize) -> Result<Vec<String>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(anyhow!("connection reset by peer"));
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

#[test]
fn transient_failures_are_retried() -> Result<()> {
    let catalog = MemoryCatalog::new()
        .with_configuration(configuration(1, example_settings()))
        .with_trades(INSTRUMENT, example_trades());
    let fx = fixture(catalog);
    let collaborators = Collaborators {
        transient: Arc::new(FailingOnce {
            inner: Arc::clone(&fx.store),
            calls: AtomicUsize::new(0),
        }),
        ..fx.collaborators.clone()
    };
    let service = JobService::start(JobCoordinator::new(collaborators, engine())?)?;

    let job_id = service.submit(1, INSTRUMENT, true)?;
    let report = service.wait(&job_id)?.expect("report");
    assert_eq!(report.attempts, 2);
    assert!(matches!(report.outcome?, JobOutcome::Completed { .. }));
    Ok(())
}

#[test]
fn missing_configuration_is_not_retried() -> Result<()> {
    let fx = fixture(MemoryCatalog::new());
    let service = JobService::start(JobCoordinator::new(fx.collaborators.clone(), engine())?)?;
    let job_id = service.submit(404, INSTRUMENT, false)?;
    let report = service.wait(&job_id)?.expect("report");
    assert_eq!(report.attempts, 1);
    assert!(report.outcome.is_err());
    Ok(())
}

#[test]
fn stopping_a_finished_job_leaves_reruns_alone() -> Result<()> {
    let catalog = MemoryCatalog::new()
        .with_configuration(configuration(1, example_settings()))
        .with_trades(INSTRUMENT, example_trades());
    let fx = fixture(catalog);
    let service = JobService::start(JobCoordinator::new(fx.collaborators.clone(), engine())?)?;

    service.submit_as("again", 1, INSTRUMENT, false)?;
    let first = service.wait("again")?.expect("first report");
    assert!(first.outcome.is_ok());

    service.request_stop("again")?;
    service.request_stop("never-submitted")?;
    assert!(!fx.transport.exists(&keys::stop_flag("again"))?);
    assert!(!fx.transport.exists(&keys::stop_flag("never-submitted"))?);

    service.submit_as("again", 1, INSTRUMENT, false)?;
    let second = service.wait("again")?.expect("second report");
    assert!(matches!(second.outcome?, JobOutcome::Completed { .. }));
    Ok(())
}
