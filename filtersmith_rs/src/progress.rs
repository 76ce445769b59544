use std::time::{Duration, Instant};

/// Job-wide progress accounting across shards.
///
/// `processed_before` counts items of shards finished before the current
/// one (restored from the checkpoint on resume); the current shard's share
/// is derived from how much of its queue has drained.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total: u128,
    processed_before: u128,
    shard_total: u128,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(total: u128, processed_before: u128) -> Self {
        Self {
            total,
            processed_before,
            shard_total: 0,
            started: Instant::now(),
        }
    }

    pub fn total(&self) -> u128 {
        self.total
    }

    pub fn processed_before(&self) -> u128 {
        self.processed_before
    }

    pub fn begin_shard(&mut self, shard_total: u128) {
        self.shard_total = shard_total;
    }

    pub fn finish_shard(&mut self) {
        self.processed_before = self.processed_before.saturating_add(self.shard_total);
        self.shard_total = 0;
    }

    /// Items processed so far given the current shard's remaining queue length.
    pub fn processed(&self, remaining_in_shard: u128) -> u128 {
        self.processed_before
            .saturating_add(self.shard_total.saturating_sub(remaining_in_shard))
    }

    /// `(total - remaining) / total`, clamped to `[0, 1]`.
    pub fn fraction(&self, remaining_in_shard: u128) -> f64 {
        fraction(self.processed(remaining_in_shard), self.total)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Linear estimate of the time left, if anything has been processed.
    pub fn eta(&self, remaining_in_shard: u128) -> Option<Duration> {
        let done = self.processed(remaining_in_shard);
        if done == 0 || done >= self.total {
            return None;
        }
        let per_item = self.elapsed().as_secs_f64() / done as f64;
        let left = (self.total - done) as f64 * per_item;
        Some(Duration::from_secs_f64(left))
    }
}

pub fn fraction(processed: u128, total: u128) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (processed as f64 / total as f64).clamp(0.0, 1.0)
}

pub fn format_int<T: Into<u128>>(value: T) -> String {
    let s = value.into().to_string();
    let len = s.len();
    if len <= 3 {
        return s;
    }
    let mut out = String::with_capacity(len + len / 3);
    let mut count = 0usize;
    for ch in s.chars().rev() {
        if count == 3 {
            out.push(',');
            count = 0;
        }
        out.push(ch);
        count += 1;
    }
    out.chars().rev().collect()
}

pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs_f64().round() as u64;
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let secs = total % 60;

    if days > 0 {
        format!("{days}d {hours:02}h {minutes:02}m")
    } else if hours > 0 {
        format!("{hours}h {minutes:02}m")
    } else if minutes > 0 {
        format!("{minutes}m {secs:02}s")
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_tracks_drained_queue_across_shards() {
        let mut tracker = ProgressTracker::new(200, 0);
        tracker.begin_shard(100);
        assert_eq!(tracker.fraction(100), 0.0);
        assert_eq!(tracker.fraction(50), 0.25);
        tracker.finish_shard();
        tracker.begin_shard(100);
        assert_eq!(tracker.processed(100), 100);
        assert_eq!(tracker.fraction(0), 1.0);
    }

    #[test]
    fn resumed_tracker_starts_from_checkpoint() {
        let tracker = ProgressTracker::new(10, 4);
        assert_eq!(tracker.processed(0), 4);
        assert_eq!(fraction(0, 0), 1.0);
    }

    #[test]
    fn formats_thousands_and_durations() {
        assert_eq!(format_int(999u32), "999");
        assert_eq!(format_int(1_234_567u64), "1,234,567");
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "1h 02m");
        assert_eq!(format_duration(Duration::from_secs(90_061)), "1d 01h 01m");
    }
}
