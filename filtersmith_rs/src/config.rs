use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::criteria::{ConditionValue, NumericBound};

/// A stored optimization configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    pub settings: Settings,
}

/// `{minMinutes, maxMinutes}` clock bounds ("HH:MM" or "HH:MM:SS").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeRangeCondition {
    #[serde(rename = "minMinutes", default, skip_serializing_if = "Option::is_none")]
    pub min: Option<String>,
    #[serde(rename = "maxMinutes", default, skip_serializing_if = "Option::is_none")]
    pub max: Option<String>,
}

/// A fixed filter applied once before the combinatorial search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PredefinedFilter {
    Exact {
        #[serde(rename = "columnHeader")]
        column_header: String,
        condition: ConditionValue,
    },
    TimeRange {
        #[serde(rename = "columnHeader", default = "default_time_column")]
        column_header: String,
        condition: TimeRangeCondition,
    },
    NumericRange {
        #[serde(rename = "columnHeader")]
        column_header: String,
        condition: NumericBound,
    },
}

impl PredefinedFilter {
    pub fn column_header(&self) -> &str {
        match self {
            PredefinedFilter::Exact { column_header, .. }
            | PredefinedFilter::TimeRange { column_header, .. }
            | PredefinedFilter::NumericRange { column_header, .. } => column_header,
        }
    }
}

fn default_time_column() -> String {
    "Time".to_string()
}

/// Weights applied to the composite strategy score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RankingWeights {
    pub profit_factor: f64,
    pub win_rate: f64,
    pub trade_count: f64,
    pub net_profit_pips: f64,
}

/// Per-configuration search settings, stored as camelCase JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Catalog group names to search.
    #[serde(default)]
    pub combinations_to_test: Vec<String>,
    #[serde(default)]
    pub predefined_filters: Vec<PredefinedFilter>,

    /// Expand the base time window into hour-shifted variants.
    #[serde(default)]
    pub enable_time_shift: bool,
    #[serde(default = "default_min_shift_hours")]
    pub time_window_min_shift_hours: f64,
    #[serde(default = "default_max_shift_hours")]
    pub time_window_max_shift_hours: f64,
    #[serde(default = "default_shift_step_minutes")]
    pub time_window_shift_step_minutes: u32,

    /// Minimum TP/SL ratio a trade needs to count. 0 disables the check.
    #[serde(rename = "minSLToTPRatio", default)]
    pub min_sl_to_tp_ratio: f64,
    /// Maximum TP/SL ratio a trade may have to count. 0 disables the check.
    #[serde(rename = "maxTPToSLRatio", default)]
    pub max_tp_to_sl_ratio: f64,
    /// Percent, compared against `winRate * 100`.
    #[serde(default)]
    pub min_win_rate: f64,
    #[serde(default)]
    pub min_profit_factor: f64,
    /// Combinations whose filtered trade set is smaller than this are not stored.
    #[serde(default = "default_min_trade_count")]
    pub min_trade_count: usize,
    #[serde(default)]
    pub ranking_weights: RankingWeights,

    /// Only S2-context strategies are scored when set.
    #[serde(default)]
    pub s2_setup_only: bool,

    /// Optional cap on base combinations enumerated per shard.
    #[serde(default)]
    pub max_combinations_to_test: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            combinations_to_test: Vec::new(),
            predefined_filters: Vec::new(),
            enable_time_shift: false,
            time_window_min_shift_hours: default_min_shift_hours(),
            time_window_max_shift_hours: default_max_shift_hours(),
            time_window_shift_step_minutes: default_shift_step_minutes(),
            min_sl_to_tp_ratio: 0.0,
            max_tp_to_sl_ratio: 0.0,
            min_win_rate: 0.0,
            min_profit_factor: 0.0,
            min_trade_count: default_min_trade_count(),
            ranking_weights: RankingWeights::default(),
            s2_setup_only: false,
            max_combinations_to_test: None,
        }
    }
}

const fn default_min_shift_hours() -> f64 {
    -2.0
}

const fn default_max_shift_hours() -> f64 {
    2.0
}

const fn default_shift_step_minutes() -> u32 {
    60
}

const fn default_min_trade_count() -> usize {
    5
}

/// Job-level retry policy with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 2,
            base_delay_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let millis = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

/// Runtime knobs for the producer, worker pool and coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub n_workers: usize,
    /// Work items pushed per queue call.
    pub producer_batch_size: usize,
    pub queue_ttl_secs: u64,
    pub stop_flag_ttl_secs: u64,
    pub drain_poll_ms: u64,
    /// Workers check the stop flag and report progress every N pops.
    pub progress_every: usize,
    /// Producer pauses while the queue holds more than this many items.
    pub max_pending: usize,
    /// Idle sleep for a worker that found the queue empty.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    pub shard_top_k: usize,
    pub final_top_n: usize,
    pub lease_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub quiet: bool,
}

const fn default_idle_poll_ms() -> u64 {
    10
}

pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_sub(2)
        .max(1)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            n_workers: default_worker_count(),
            producer_batch_size: 500,
            queue_ttl_secs: 43_200,
            stop_flag_ttl_secs: 43_200,
            drain_poll_ms: 5_000,
            progress_every: 100,
            max_pending: 100_000,
            idle_poll_ms: default_idle_poll_ms(),
            shard_top_k: 100,
            final_top_n: 100,
            lease_ms: 300_000,
            retry: RetryConfig::default(),
            quiet: false,
        }
    }
}

impl EngineConfig {
    pub fn queue_ttl(&self) -> Duration {
        Duration::from_secs(self.queue_ttl_secs)
    }

    pub fn stop_flag_ttl(&self) -> Duration {
        Duration::from_secs(self.stop_flag_ttl_secs)
    }

    pub fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}
