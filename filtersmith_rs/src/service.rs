use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::coordinator::{JobCoordinator, JobOutcome, JobRequest};
use crate::error::JobError;
use crate::external;
use crate::progress::fraction;
use crate::transport::keys;

/// Status row returned by [`JobService::query_active`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveJob {
    pub job_id: String,
    pub progress: f64,
    pub total_combinations: u64,
}

/// Final report of a dispatched job.
#[derive(Debug)]
pub struct JobReport {
    pub job_id: String,
    pub attempts: u32,
    pub outcome: Result<JobOutcome, JobError>,
}

#[derive(Default)]
struct Lanes {
    high: VecDeque<JobRequest>,
    normal: VecDeque<JobRequest>,
    running: Option<String>,
    finished: HashMap<String, JobReport>,
    shutdown: bool,
}

impl Lanes {
    fn next(&mut self) -> Option<JobRequest> {
        self.high.pop_front().or_else(|| self.normal.pop_front())
    }

    fn is_known(&self, job_id: &str) -> bool {
        self.running.as_deref() == Some(job_id)
            || self.finished.contains_key(job_id)
            || self.queued().any(|request| request.job_id == job_id)
    }

    fn queued(&self) -> impl Iterator<Item = &JobRequest> {
        self.high.iter().chain(self.normal.iter())
    }

    fn remove_queued(&mut self, job_id: &str) -> Option<JobRequest> {
        for lane in [&mut self.high, &mut self.normal] {
            if let Some(position) = lane.iter().position(|request| request.job_id == job_id) {
                return lane.remove(position);
            }
        }
        None
    }
}

struct Shared {
    coordinator: JobCoordinator,
    lanes: Mutex<Lanes>,
    /// Signalled when a job is queued or the service shuts down.
    work: Condvar,
    /// Signalled when a job report is recorded.
    done: Condvar,
    sequence: AtomicU64,
}

impl Shared {
    fn lanes(&self) -> Result<MutexGuard<'_, Lanes>> {
        self.lanes
            .lock()
            .map_err(|_| anyhow!("job service lanes poisoned"))
    }
}

/// Accepts jobs and runs them one at a time on a dispatcher thread,
/// draining the high-priority lane first.
pub struct JobService {
    shared: Arc<Shared>,
    dispatcher: Option<JoinHandle<()>>,
}

impl JobService {
    pub fn start(coordinator: JobCoordinator) -> Result<Self> {
        let shared = Arc::new(Shared {
            coordinator,
            lanes: Mutex::new(Lanes::default()),
            work: Condvar::new(),
            done: Condvar::new(),
            sequence: AtomicU64::new(0),
        });
        let dispatcher = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("filtersmith-dispatcher".into())
                .spawn(move || dispatch_loop(&shared))
                .context("failed to spawn job dispatcher thread")?
        };
        Ok(Self {
            shared,
            dispatcher: Some(dispatcher),
        })
    }

    /// Queue a job under a fresh id.
    pub fn submit(&self, configuration_id: u64, instrument: &str, high_priority: bool) -> Result<String> {
        let sequence = self.shared.sequence.fetch_add(1, Ordering::SeqCst);
        let job_id = format!("job-{}-{sequence}", Utc::now().timestamp_millis());
        self.submit_as(&job_id, configuration_id, instrument, high_priority)?;
        Ok(job_id)
    }

    /// Queue a job under a caller-chosen id, resuming its checkpoint if one
    /// exists.
    pub fn submit_as(
        &self,
        job_id: &str,
        configuration_id: u64,
        instrument: &str,
        high_priority: bool,
    ) -> Result<()> {
        let mut lanes = self.shared.lanes()?;
        if lanes.shutdown {
            return Err(anyhow!("job service is shutting down"));
        }
        if lanes.running.as_deref() == Some(job_id) || lanes.queued().any(|r| r.job_id == job_id) {
            return Err(anyhow!("job {job_id} is already queued or running"));
        }
        lanes.finished.remove(job_id);
        let request = JobRequest::new(job_id, configuration_id, instrument);
        if high_priority {
            lanes.high.push_back(request);
        } else {
            lanes.normal.push_back(request);
        }
        drop(lanes);
        self.shared.work.notify_all();
        info!(job_id, configuration_id, instrument, high_priority, "Job submitted");
        Ok(())
    }

    /// Ask a job to stop. A queued job is dropped immediately; a running one
    /// sees the stop flag on its next check, and an external optimizer
    /// process is sent SIGTERM. Finished and unknown ids are left alone.
    pub fn request_stop(&self, job_id: &str) -> Result<()> {
        let transport = &*self.shared.coordinator.collaborators().transport;
        let mut lanes = self.shared.lanes()?;
        if lanes.remove_queued(job_id).is_some() {
            lanes.finished.insert(
                job_id.to_string(),
                JobReport {
                    job_id: job_id.to_string(),
                    attempts: 0,
                    outcome: Err(JobError::StoppedByUser(job_id.to_string())),
                },
            );
            drop(lanes);
            self.shared.done.notify_all();
            info!(job_id, "Queued job cancelled");
            return Ok(());
        }
        if lanes.running.as_deref() != Some(job_id) {
            info!(job_id, "Stop requested for a job that is not running; ignoring");
            return Ok(());
        }
        // Set under the lanes lock: the dispatcher clears the flag under the
        // same lock when the run ends.
        let ttl = self.shared.coordinator.engine().stop_flag_ttl();
        transport.set(&keys::stop_flag(job_id), "1", Some(ttl))?;
        drop(lanes);
        info!(job_id, "Stop requested");

        if let Some(raw) = transport.get(&keys::pid(job_id))? {
            let pid: u32 = raw
                .parse()
                .with_context(|| format!("invalid optimizer pid '{raw}'"))?;
            info!(job_id, pid, "Terminating external optimizer");
            external::terminate(pid)?;
        }
        Ok(())
    }

    /// Running and queued jobs with their progress fraction.
    pub fn query_active(&self) -> Result<Vec<ActiveJob>> {
        let ids: Vec<String> = {
            let lanes = self.shared.lanes()?;
            lanes
                .running
                .iter()
                .cloned()
                .chain(lanes.queued().map(|request| request.job_id.clone()))
                .collect()
        };
        let transport = &*self.shared.coordinator.collaborators().transport;
        ids.into_iter()
            .map(|job_id| {
                let total = read_counter(transport.get(&keys::total(&job_id))?);
                let processed = read_counter(transport.get(&keys::progress(&job_id))?);
                Ok(ActiveJob {
                    progress: if total == 0 {
                        0.0
                    } else {
                        fraction(u128::from(processed), u128::from(total))
                    },
                    total_combinations: total,
                    job_id,
                })
            })
            .collect()
    }

    /// Block until `job_id` has a final report and take it. Returns `None`
    /// for ids this service never saw.
    pub fn wait(&self, job_id: &str) -> Result<Option<JobReport>> {
        let mut lanes = self.shared.lanes()?;
        loop {
            if let Some(report) = lanes.finished.remove(job_id) {
                return Ok(Some(report));
            }
            if !lanes.is_known(job_id) {
                return Ok(None);
            }
            lanes = self
                .shared
                .done
                .wait(lanes)
                .map_err(|_| anyhow!("job service lanes poisoned"))?;
        }
    }

    /// Finish the running job, drop queued ones and join the dispatcher.
    pub fn shutdown(mut self) {
        self.stop_dispatcher();
    }

    fn stop_dispatcher(&mut self) {
        if let Ok(mut lanes) = self.shared.lanes() {
            lanes.shutdown = true;
        }
        self.shared.work.notify_all();
        if let Some(handle) = self.dispatcher.take() {
            if handle.join().is_err() {
                warn!("Job dispatcher thread panicked");
            }
        }
    }
}

impl Drop for JobService {
    fn drop(&mut self) {
        self.stop_dispatcher();
    }
}

fn read_counter(raw: Option<String>) -> u64 {
    raw.and_then(|value| value.parse().ok()).unwrap_or(0)
}

fn dispatch_loop(shared: &Shared) {
    loop {
        let request = {
            let Ok(mut lanes) = shared.lanes() else {
                warn!("Job dispatcher stopping: lanes poisoned");
                return;
            };
            loop {
                if lanes.shutdown {
                    return;
                }
                if let Some(request) = lanes.next() {
                    lanes.running = Some(request.job_id.clone());
                    break request;
                }
                lanes = match shared.work.wait(lanes) {
                    Ok(lanes) => lanes,
                    Err(_) => return,
                };
            }
        };

        let report = run_with_retry(&shared.coordinator, &request);
        match &report.outcome {
            Ok(_) => info!(job_id = %report.job_id, attempts = report.attempts, "Job finished"),
            Err(error) => warn!(job_id = %report.job_id, attempts = report.attempts, error = %error, "Job failed"),
        }

        let Ok(mut lanes) = shared.lanes() else {
            return;
        };
        let stop_key = keys::stop_flag(&report.job_id);
        if let Err(error) = shared.coordinator.collaborators().transport.delete(&stop_key) {
            warn!(job_id = %report.job_id, error = %format!("{error:#}"), "Failed to clear stop flag");
        }
        lanes.running = None;
        lanes.finished.insert(report.job_id.clone(), report);
        drop(lanes);
        shared.done.notify_all();
    }
}

fn run_with_retry(coordinator: &JobCoordinator, request: &JobRequest) -> JobReport {
    let retry = coordinator.engine().retry;
    let mut attempt = 1;
    loop {
        let outcome = coordinator.run(request);
        match outcome {
            Err(error) if error.is_retryable() && attempt < retry.attempts => {
                let delay = retry.delay_for(attempt);
                warn!(
                    job_id = %request.job_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying job after transient failure"
                );
                thread::sleep(delay);
                attempt += 1;
            }
            outcome => {
                return JobReport {
                    job_id: request.job_id.clone(),
                    attempts: attempt,
                    outcome,
                };
            }
        }
    }
}
