#![allow(dead_code)]

use std::sync::Arc;

use filtersmith_rs::config::{
    Configuration, EngineConfig, PredefinedFilter, RankingWeights, RetryConfig, Settings,
    TimeRangeCondition,
};
use filtersmith_rs::coordinator::Collaborators;
use filtersmith_rs::storage::{DuckStore, MemoryCatalog};
use filtersmith_rs::trade::TradeRecord;
use filtersmith_rs::transport::MemoryTransport;

pub const INSTRUMENT: &str = "EURUSD";

pub fn time_filter(min: &str, max: &str) -> PredefinedFilter {
    PredefinedFilter::TimeRange {
        column_header: "Time".into(),
        condition: TimeRangeCondition {
            min: Some(min.into()),
            max: Some(max.into()),
        },
    }
}

pub fn weights() -> RankingWeights {
    RankingWeights {
        profit_factor: 1.0,
        win_rate: 1.0,
        trade_count: 0.0,
        net_profit_pips: 0.0,
    }
}

pub fn configuration(id: u64, settings: Settings) -> Configuration {
    Configuration {
        id,
        name: format!("config-{id}"),
        settings,
    }
}

/// The two-trade example: one 1RR PW win and one loss inside 09:00-09:30.
pub fn example_trades() -> Vec<TradeRecord> {
    vec![
        TradeRecord {
            time: "09:00".into(),
            entered: true,
            tp_1rr_pw_win: true,
            tp_1rr_pw_pips: 10.0,
            sl_pw_pips: 5.0,
            ..TradeRecord::default()
        },
        TradeRecord {
            time: "09:10".into(),
            entered: true,
            tp_1rr_pw_win: false,
            tp_1rr_pw_pips: 8.0,
            sl_pw_pips: 5.0,
            ..TradeRecord::default()
        },
    ]
}

/// Deterministic spread of trades across the morning session.
pub fn session_trades(n: usize) -> Vec<TradeRecord> {
    (0..n)
        .map(|i| {
            let minutes = 7 * 60 + (i * 11) % 300;
            TradeRecord {
                time: format!("{:02}:{:02}", minutes / 60, minutes % 60),
                entered: true,
                direction: if i % 2 == 0 { "BUY" } else { "SELL" }.into(),
                tp_1rr_pw_win: i % 3 != 0,
                tp_1rr_pw_pips: 6.0 + (i % 5) as f64,
                sl_pw_pips: 5.0,
                gaussian_trend_1: i % 2 == 0,
                gaussian_trend_2: i % 3 == 0,
                gaussian_trend_3: i % 4 != 0,
                gaussian_trend_4: i % 5 < 3,
                gaussian_trend_5: i % 7 < 4,
                gaussian_trend_6: i % 2 == 1,
                gaussian_trend_7: true,
                ..TradeRecord::default()
            }
        })
        .collect()
}

pub fn engine() -> EngineConfig {
    EngineConfig {
        n_workers: 3,
        producer_batch_size: 64,
        drain_poll_ms: 5,
        idle_poll_ms: 1,
        progress_every: 10,
        retry: RetryConfig {
            attempts: 2,
            base_delay_ms: 1,
            backoff_multiplier: 2.0,
        },
        ..EngineConfig::default()
    }
}

pub struct Fixture {
    pub store: Arc<DuckStore>,
    pub transport: Arc<MemoryTransport>,
    pub collaborators: Collaborators,
}

pub fn fixture(catalog: MemoryCatalog) -> Fixture {
    let store = Arc::new(DuckStore::in_memory().expect("in-memory duckdb"));
    let transport = Arc::new(MemoryTransport::new());
    let collaborators =
        Collaborators::from_parts(Arc::new(catalog), Arc::clone(&store), transport.clone());
    Fixture {
        store,
        transport,
        collaborators,
    }
}
