use std::thread;

use anyhow::anyhow;
use tracing::{debug, info, warn};

use crate::combinator::{CombinationBatcher, CombinationSpace, WorkItem};
use crate::config::EngineConfig;
use crate::error::JobError;
use crate::progress::format_int;
use crate::transport::{Transport, keys};
use crate::window::TimeWindow;
use crate::worker::ShardSignals;

/// Expands a combination space into serialized work items on a job queue.
pub struct Producer<'a> {
    transport: &'a dyn Transport,
    engine: &'a EngineConfig,
}

impl<'a> Producer<'a> {
    pub fn new(transport: &'a dyn Transport, engine: &'a EngineConfig) -> Self {
        Self { transport, engine }
    }

    /// Enqueue one item per base combination and window, windows varying
    /// fastest. `limit` caps the number of base combinations. Returns the
    /// number of items enqueued.
    ///
    /// The job lease is renewed before every push and while waiting for
    /// queue capacity. Production aborts once the stop flag is set or the
    /// worker loops have shut down.
    pub fn produce(
        &self,
        job_id: &str,
        space: &CombinationSpace,
        windows: &[TimeWindow],
        limit: Option<u64>,
        signals: &ShardSignals,
    ) -> Result<u64, JobError> {
        let job_keys = ProducerKeys::new(job_id);
        let batch_size = self.engine.producer_batch_size.max(1);
        // Keep each push near the configured batch size regardless of the
        // window count.
        let combos_per_batch = (batch_size / windows.len().max(1)).max(1);

        let mut batcher = CombinationBatcher::new(space, 0).with_limit(limit);
        let mut enqueued: u64 = 0;
        let mut buffer: Vec<String> = Vec::with_capacity(batch_size);

        while let Some(batch) = batcher.next_batch(combos_per_batch) {
            self.check_running(job_id, &job_keys, signals)?;
            self.wait_for_capacity(job_id, &job_keys, signals)?;

            buffer.clear();
            for combination in batch {
                for window in windows {
                    buffer.push(WorkItem::new(combination.clone(), *window).encode()?);
                }
            }
            self.transport.push_batch(&job_keys.queue, &buffer)?;
            self.transport.expire(&job_keys.queue, self.engine.queue_ttl())?;
            enqueued += buffer.len() as u64;
            debug!(job_id, batch = buffer.len(), enqueued, "Pushed work item batch");
        }

        info!(
            job_id,
            items = %format_int(enqueued),
            windows = windows.len(),
            "Producer finished enqueuing work items"
        );
        Ok(enqueued)
    }

    /// Enqueue the items of a single time window shard.
    pub fn produce_shard(
        &self,
        job_id: &str,
        space: &CombinationSpace,
        window: TimeWindow,
        limit: Option<u64>,
        signals: &ShardSignals,
    ) -> Result<u64, JobError> {
        self.produce(job_id, space, &[window], limit, signals)
    }

    /// Fail fast on a stop request or dead consumers, and keep the lease
    /// alive while production is still going.
    fn check_running(
        &self,
        job_id: &str,
        job_keys: &ProducerKeys,
        signals: &ShardSignals,
    ) -> Result<(), JobError> {
        if self.transport.exists(&job_keys.stop)? {
            return Err(JobError::StoppedByUser(job_id.to_string()));
        }
        if signals.is_shutdown() {
            warn!(job_id, "Workers shut down before production finished");
            return Err(JobError::Transport(anyhow!(
                "workers of job {job_id} shut down before production finished"
            )));
        }
        self.transport.expire(&job_keys.lease, self.engine.lease())?;
        Ok(())
    }

    fn wait_for_capacity(
        &self,
        job_id: &str,
        job_keys: &ProducerKeys,
        signals: &ShardSignals,
    ) -> Result<(), JobError> {
        while self.transport.queue_len(&job_keys.queue)? > self.engine.max_pending {
            self.check_running(job_id, job_keys, signals)?;
            thread::sleep(self.engine.idle_poll());
        }
        Ok(())
    }
}

struct ProducerKeys {
    queue: String,
    stop: String,
    lease: String,
}

impl ProducerKeys {
    fn new(job_id: &str) -> Self {
        Self {
            queue: keys::queue(job_id),
            stop: keys::stop_flag(job_id),
            lease: keys::lease(job_id),
        }
    }
}
