use std::cmp::Ordering;
use std::collections::BTreeMap;

use ahash::AHashSet;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize, Serializer};

use crate::combinator::{Combination, WorkItem};
use crate::config::{RankingWeights, Settings};
use crate::trade::{FieldAccessor, FieldValue, TradeRecord, field_accessor};
use crate::window::TimeWindow;

/// Dollars risked per trade in the fixed money model.
pub const RISK_PER_TRADE: f64 = 100.0;
/// Profit factor cap inside the composite score.
pub const PROFIT_FACTOR_CAP: f64 = 10.0;
/// JSON stand-in for an infinite profit factor.
pub const INFINITE_PROFIT_FACTOR: f64 = 9999.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyDefinition {
    pub name: &'static str,
    pub win_flag: &'static str,
    pub take_profit_pips: &'static str,
    pub stop_loss_pips: &'static str,
    pub range_breakout: Option<&'static str>,
    pub requires_lta_context: bool,
    pub requires_s2_context: bool,
}

const fn strategy(
    name: &'static str,
    win_flag: &'static str,
    take_profit_pips: &'static str,
    stop_loss_pips: &'static str,
    range_breakout: Option<&'static str>,
    requires_lta_context: bool,
    requires_s2_context: bool,
) -> StrategyDefinition {
    StrategyDefinition {
        name,
        win_flag,
        take_profit_pips,
        stop_loss_pips,
        range_breakout,
        requires_lta_context,
        requires_s2_context,
    }
}

pub static STRATEGIES: [StrategyDefinition; 10] = [
    strategy("1RR PW", "TP_1RR_PW_WIN", "TP_1RR_PW_PIPS", "SL_PW_PIPS", None, false, false),
    strategy("1RR STR", "TP_1RR_STR_WIN", "TP_1RR_STR_PIPS", "SL_STR_PIPS", None, false, false),
    strategy(
        "SR LTA SL PW",
        "TP_SR_LTA_SL_PW_WIN",
        "TP_SR_LTA_PIPS",
        "SL_PW_PIPS",
        Some("LTA_Range_Breakout"),
        true,
        false,
    ),
    strategy(
        "SR LTA SL STR",
        "TP_SR_LTA_SL_STR_WIN",
        "TP_SR_LTA_PIPS",
        "SL_STR_PIPS",
        Some("LTA_Range_Breakout"),
        true,
        false,
    ),
    strategy(
        "SR NEAR SL PW",
        "TP_SR_NEAREST_SL_PW_WIN",
        "TP_SR_NEAREST_PIPS",
        "SL_PW_PIPS",
        Some("Nearest_Range_Breakout"),
        false,
        false,
    ),
    strategy(
        "SR NEAR SL STR",
        "TP_SR_NEAREST_SL_STR_WIN",
        "TP_SR_NEAREST_PIPS",
        "SL_STR_PIPS",
        Some("Nearest_Range_Breakout"),
        false,
        false,
    ),
    strategy(
        "SR STATIC SL PW",
        "TP_SR_STATIC_SL_PW_WIN",
        "TP_SR_STATIC_PIPS",
        "SL_PW_PIPS",
        Some("Static_Range_Breakout"),
        false,
        false,
    ),
    strategy(
        "SR STATIC SL STR",
        "TP_SR_STATIC_SL_STR_WIN",
        "TP_SR_STATIC_PIPS",
        "SL_STR_PIPS",
        Some("Static_Range_Breakout"),
        false,
        false,
    ),
    strategy(
        "SR CURR SL PW",
        "TP_SR_CURRENT_PW_WIN",
        "TP_SR_CURRENT_PIPS",
        "SL_PW_PIPS",
        Some("Current_Range_Breakout"),
        false,
        true,
    ),
    strategy(
        "SR CURR SL STR",
        "TP_SR_CURRENT_STR_WIN",
        "TP_SR_CURRENT_PIPS",
        "SL_STR_PIPS",
        Some("Current_Range_Breakout"),
        false,
        true,
    ),
];

#[derive(Debug, Clone, Copy)]
struct CompiledStrategy {
    definition: &'static StrategyDefinition,
    win: FieldAccessor,
    take_profit: FieldAccessor,
    stop_loss: FieldAccessor,
    breakout: Option<FieldAccessor>,
}

fn resolve(column: &str, strategy: &str) -> Result<FieldAccessor> {
    field_accessor(column)
        .ok_or_else(|| anyhow!("strategy '{strategy}' references unknown column '{column}'"))
}

/// The fixed strategy set with its columns resolved once.
#[derive(Debug, Clone)]
pub struct StrategyBook {
    strategies: Vec<CompiledStrategy>,
}

impl StrategyBook {
    pub fn new() -> Result<Self> {
        let strategies = STRATEGIES
            .iter()
            .map(|definition| {
                Ok(CompiledStrategy {
                    definition,
                    win: resolve(definition.win_flag, definition.name)?,
                    take_profit: resolve(definition.take_profit_pips, definition.name)?,
                    stop_loss: resolve(definition.stop_loss_pips, definition.name)?,
                    breakout: definition
                        .range_breakout
                        .map(|column| resolve(column, definition.name))
                        .transpose()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { strategies })
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "MetricsWire", from = "MetricsWire")]
pub struct StrategyMetrics {
    pub trade_count: usize,
    pub won_count: usize,
    pub lost_count: usize,
    pub win_rate: f64,
    /// Finite, `+inf` (profit without loss) or 0.
    pub profit_factor: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub net_profit: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct MetricsWire {
    win_rate: f64,
    profit_factor: f64,
    total_trades_this_strategy: usize,
    net_profit: f64,
    won_trades: usize,
    lost_trades: usize,
    gross_profit: f64,
    gross_loss: f64,
}

impl From<StrategyMetrics> for MetricsWire {
    fn from(metrics: StrategyMetrics) -> Self {
        let profit_factor = if metrics.profit_factor.is_infinite() {
            INFINITE_PROFIT_FACTOR
        } else {
            metrics.profit_factor
        };
        Self {
            win_rate: metrics.win_rate,
            profit_factor,
            total_trades_this_strategy: metrics.trade_count,
            net_profit: metrics.net_profit,
            won_trades: metrics.won_count,
            lost_trades: metrics.lost_count,
            gross_profit: metrics.gross_profit,
            gross_loss: metrics.gross_loss,
        }
    }
}

impl From<MetricsWire> for StrategyMetrics {
    fn from(wire: MetricsWire) -> Self {
        let profit_factor = if wire.profit_factor == INFINITE_PROFIT_FACTOR {
            f64::INFINITY
        } else {
            wire.profit_factor
        };
        Self {
            trade_count: wire.total_trades_this_strategy,
            won_count: wire.won_trades,
            lost_count: wire.lost_trades,
            win_rate: wire.win_rate,
            profit_factor,
            gross_profit: wire.gross_profit,
            gross_loss: wire.gross_loss,
            net_profit: wire.net_profit,
        }
    }
}

impl StrategyMetrics {
    fn from_totals(won: usize, lost: usize, gross_profit: f64, gross_loss: f64) -> Self {
        let trade_count = won + lost;
        let win_rate = if trade_count > 0 {
            won as f64 / trade_count as f64
        } else {
            0.0
        };
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };
        Self {
            trade_count,
            won_count: won,
            lost_count: lost,
            win_rate,
            profit_factor,
            gross_profit,
            gross_loss,
            net_profit: gross_profit - gross_loss,
        }
    }

    /// The profit factor must strictly exceed the minimum, so a strategy
    /// without trades (profit factor 0) never passes.
    fn passes_gate(&self, settings: &Settings) -> bool {
        let profit_factor_ok = self.profit_factor == f64::INFINITY
            || (self.profit_factor.is_finite() && self.profit_factor > settings.min_profit_factor);
        profit_factor_ok && self.win_rate * 100.0 >= settings.min_win_rate
    }
}

fn number(value: FieldValue<'_>) -> f64 {
    value.as_number().unwrap_or(0.0)
}

fn flag(value: FieldValue<'_>) -> bool {
    value.as_bool().unwrap_or(false)
}

fn evaluate_strategy(
    strategy: &CompiledStrategy,
    trades: &[&TradeRecord],
    settings: &Settings,
) -> StrategyMetrics {
    let mut won = 0usize;
    let mut lost = 0usize;
    let mut gross_profit = 0.0;
    let mut gross_loss = 0.0;

    for trade in trades {
        let mut take_profit = number(strategy.take_profit.read(trade));
        let stop_loss = number(strategy.stop_loss.read(trade));

        if let Some(breakout) = &strategy.breakout {
            if !flag(breakout.read(trade)) && take_profit == 0.0 {
                continue;
            }
        }
        if stop_loss <= 0.0 {
            continue;
        }
        if take_profit == 0.0 {
            take_profit = stop_loss;
        }

        let ratio = take_profit / stop_loss;
        if settings.min_sl_to_tp_ratio != 0.0 && ratio < settings.min_sl_to_tp_ratio {
            continue;
        }
        if settings.max_tp_to_sl_ratio != 0.0 && ratio > settings.max_tp_to_sl_ratio {
            continue;
        }
        if take_profit < 1.0 {
            continue;
        }

        let money_per_pip = RISK_PER_TRADE / stop_loss;
        if flag(strategy.win.read(trade)) {
            won += 1;
            gross_profit += take_profit * money_per_pip;
        } else {
            lost += 1;
            gross_loss += RISK_PER_TRADE;
        }
    }

    StrategyMetrics::from_totals(won, lost, gross_profit, gross_loss)
}

/// Per-strategy metrics for `trades`, or `None` when every strategy fails
/// the configured minimum win rate / profit factor.
pub fn calculate_metrics(
    trades: &[&TradeRecord],
    lta_flag: bool,
    settings: &Settings,
    book: &StrategyBook,
) -> Option<BTreeMap<String, StrategyMetrics>> {
    let mut results = BTreeMap::new();
    let mut any_passed = false;

    for strategy in &book.strategies {
        let definition = strategy.definition;
        let in_context = lta_flag == definition.requires_lta_context;
        let gated_out = settings.s2_setup_only && !definition.requires_s2_context;
        let metrics = if in_context && !gated_out {
            evaluate_strategy(strategy, trades, settings)
        } else {
            StrategyMetrics::default()
        };
        if metrics.passes_gate(settings) {
            any_passed = true;
        }
        results.insert(definition.name.to_string(), metrics);
    }

    any_passed.then_some(results)
}

/// Weighted blend of profit factor, win rate, trade count and per-trade
/// net profit. Strategies without trades or with a net loss are unranked
/// (`-inf`).
pub fn composite_score(metrics: &StrategyMetrics, weights: &RankingWeights) -> f64 {
    if metrics.trade_count == 0 || metrics.net_profit < 0.0 {
        return f64::NEG_INFINITY;
    }
    let profit_factor = if metrics.profit_factor == f64::INFINITY {
        PROFIT_FACTOR_CAP
    } else {
        metrics.profit_factor.min(PROFIT_FACTOR_CAP)
    };
    let trades = metrics.trade_count as f64;
    let score = profit_factor * weights.profit_factor
        + metrics.win_rate * weights.win_rate
        + trades.ln_1p() * weights.trade_count
        + (metrics.net_profit / trades) * weights.net_profit_pips;
    if score.is_nan() {
        f64::NEG_INFINITY
    } else {
        score
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CombinationScore {
    pub metrics: BTreeMap<String, StrategyMetrics>,
    pub scores: BTreeMap<String, f64>,
    pub overall_score: f64,
}

/// Score a filtered trade set. `None` means the combination is discarded:
/// either every strategy failed its gate or no strategy scored finitely.
pub fn score_combination(
    trades: &[&TradeRecord],
    lta_flag: bool,
    settings: &Settings,
    book: &StrategyBook,
) -> Option<CombinationScore> {
    let metrics = calculate_metrics(trades, lta_flag, settings, book)?;
    let scores: BTreeMap<String, f64> = metrics
        .iter()
        .map(|(name, m)| (name.clone(), composite_score(m, &settings.ranking_weights)))
        .collect();

    let finite: Vec<f64> = scores.values().copied().filter(|s| s.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    let overall_score = finite.iter().sum::<f64>() / finite.len() as f64;
    Some(CombinationScore {
        metrics,
        scores,
        overall_score,
    })
}

// =============================================================================
// Scored results and final ranking
// =============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "ScoredResultWire")]
pub struct ScoredResult {
    pub combination: Combination,
    pub time_window: TimeWindow,
    pub overall_score: f64,
    pub overall_trade_count: usize,
    pub metrics: BTreeMap<String, StrategyMetrics>,
    pub strategy_scores: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScoredResultWire {
    combination: serde_json::Value,
    overall_score: f64,
    overall_trade_count: usize,
    #[serde(default)]
    metrics: BTreeMap<String, StrategyMetrics>,
    #[serde(default)]
    strategy_scores: BTreeMap<String, Option<f64>>,
}

impl TryFrom<&ScoredResult> for ScoredResultWire {
    type Error = anyhow::Error;

    fn try_from(result: &ScoredResult) -> Result<Self> {
        let combination = WorkItem::new(result.combination.clone(), result.time_window).to_value()?;
        let overall_score = if result.overall_score.is_finite() {
            result.overall_score
        } else {
            0.0
        };
        Ok(Self {
            combination,
            overall_score,
            overall_trade_count: result.overall_trade_count,
            metrics: result.metrics.clone(),
            strategy_scores: result
                .strategy_scores
                .iter()
                .map(|(name, score)| (name.clone(), score.is_finite().then_some(*score)))
                .collect(),
        })
    }
}

impl Serialize for ScoredResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        ScoredResultWire::try_from(self)
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl TryFrom<ScoredResultWire> for ScoredResult {
    type Error = anyhow::Error;

    fn try_from(wire: ScoredResultWire) -> Result<Self> {
        let item = WorkItem::from_value(wire.combination)?;
        Ok(Self {
            combination: item.combination,
            time_window: item.time_window,
            overall_score: wire.overall_score,
            overall_trade_count: wire.overall_trade_count,
            metrics: wire.metrics,
            strategy_scores: wire
                .strategy_scores
                .into_iter()
                .map(|(name, score)| (name, score.unwrap_or(f64::NEG_INFINITY)))
                .collect(),
        })
    }
}

impl ScoredResult {
    pub fn new(item: WorkItem, trade_count: usize, score: CombinationScore) -> Self {
        Self {
            combination: item.combination,
            time_window: item.time_window,
            overall_score: score.overall_score,
            overall_trade_count: trade_count,
            metrics: score.metrics,
            strategy_scores: score.scores,
        }
    }

    /// Combination plus window; two results with the same key are the
    /// same candidate.
    pub fn identity_key(&self) -> String {
        format!(
            "{}@{}",
            self.combination.canonical_key(),
            self.time_window.label()
        )
    }
}

/// Columns whose larger `max` bound wins a score tie, in priority order.
pub const TIE_BREAK_COLUMNS: [&str; 4] = [
    "Breakout_Distance",
    "Entry_Distance",
    "Candle_Size",
    "Breakout_Candle_Count",
];

/// Total order for the final ranking: score descending, then the larger
/// upper bound on the tie-break columns (no bound counts as unbounded),
/// then identity key ascending.
pub fn compare_ranked(a: &ScoredResult, b: &ScoredResult) -> Ordering {
    b.overall_score
        .total_cmp(&a.overall_score)
        .then_with(|| {
            for column in TIE_BREAK_COLUMNS {
                let left = a.combination.max_bound(column).unwrap_or(f64::INFINITY);
                let right = b.combination.max_bound(column).unwrap_or(f64::INFINITY);
                let ordering = right.total_cmp(&left);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        })
        .then_with(|| a.identity_key().cmp(&b.identity_key()))
}

/// De-duplicate by identity, order with [`compare_ranked`], keep `top_n`.
pub fn rank_final(mut results: Vec<ScoredResult>, top_n: usize) -> Vec<ScoredResult> {
    results.sort_by(compare_ranked);
    let mut seen: AHashSet<String> = AHashSet::with_capacity(results.len());
    results.retain(|result| seen.insert(result.identity_key()));
    results.truncate(top_n);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::{Condition, NumericBound};

    fn book() -> StrategyBook {
        StrategyBook::new().expect("strategy columns resolve")
    }

    fn pw_trade(win: bool, tp: f64, sl: f64) -> TradeRecord {
        TradeRecord {
            entered: true,
            time: "09:00".into(),
            tp_1rr_pw_win: win,
            tp_1rr_pw_pips: tp,
            sl_pw_pips: sl,
            ..TradeRecord::default()
        }
    }

    fn pw_metrics(trades: &[&TradeRecord], settings: &Settings) -> StrategyMetrics {
        let book = book();
        let strategy = book
            .strategies
            .iter()
            .find(|strategy| strategy.definition.name == "1RR PW")
            .expect("1RR PW strategy");
        evaluate_strategy(strategy, trades, settings)
    }

    fn weights(pf: f64, wr: f64) -> Settings {
        Settings {
            ranking_weights: RankingWeights {
                profit_factor: pf,
                win_rate: wr,
                trade_count: 0.0,
                net_profit_pips: 0.0,
            },
            ..Settings::default()
        }
    }

    #[test]
    fn every_strategy_column_resolves() {
        assert_eq!(book().len(), STRATEGIES.len());
    }

    #[test]
    fn one_win_one_loss_scores_two_and_a_half() {
        let trades = [pw_trade(true, 10.0, 5.0), pw_trade(false, 8.0, 5.0)];
        let refs: Vec<&TradeRecord> = trades.iter().collect();
        let settings = weights(1.0, 1.0);
        let score = score_combination(&refs, false, &settings, &book()).expect("scored");

        let pw = score.metrics["1RR PW"];
        assert_eq!(pw.won_count, 1);
        assert_eq!(pw.trade_count, 2);
        assert_eq!(pw.win_rate, 0.5);
        assert_eq!(pw.gross_profit, 200.0);
        assert_eq!(pw.gross_loss, 100.0);
        assert_eq!(pw.profit_factor, 2.0);
        assert_eq!(pw.net_profit, 100.0);
        assert_eq!(score.scores["1RR PW"], 2.5);
        assert_eq!(score.overall_score, 2.5);
    }

    #[test]
    fn zero_take_profit_falls_back_to_stop_loss() {
        let trades = [pw_trade(true, 0.0, 4.0)];
        let refs: Vec<&TradeRecord> = trades.iter().collect();
        let metrics = calculate_metrics(&refs, false, &Settings::default(), &book()).unwrap();
        let pw = metrics["1RR PW"];
        assert_eq!(pw.trade_count, 1);
        assert_eq!(pw.gross_profit, 100.0);
        assert_eq!(pw.profit_factor, f64::INFINITY);
    }

    #[test]
    fn non_positive_stop_loss_and_tiny_targets_are_skipped() {
        let trades = [
            pw_trade(true, 10.0, 0.0),
            pw_trade(true, 10.0, -2.0),
            pw_trade(true, 0.5, 5.0),
        ];
        let refs: Vec<&TradeRecord> = trades.iter().collect();
        assert_eq!(pw_metrics(&refs, &Settings::default()).trade_count, 0);
    }

    #[test]
    fn ratio_limits_exclude_trades() {
        let trades = [pw_trade(true, 10.0, 5.0), pw_trade(true, 20.0, 5.0)];
        let refs: Vec<&TradeRecord> = trades.iter().collect();
        let settings = Settings {
            min_sl_to_tp_ratio: 1.5,
            max_tp_to_sl_ratio: 3.0,
            ..Settings::default()
        };
        let metrics = calculate_metrics(&refs, false, &settings, &book()).unwrap();
        assert_eq!(metrics["1RR PW"].trade_count, 1);
    }

    #[test]
    fn breakout_strategies_skip_non_breakouts_without_target() {
        let mut trade = pw_trade(true, 10.0, 5.0);
        trade.tp_sr_nearest_pips = 0.0;
        trade.tp_sr_nearest_sl_pw_win = true;
        let trades = [trade.clone()];
        let refs: Vec<&TradeRecord> = trades.iter().collect();
        let metrics = calculate_metrics(&refs, false, &Settings::default(), &book()).unwrap();
        assert_eq!(metrics["SR NEAR SL PW"].trade_count, 0);

        let mut breakout = trade;
        breakout.nearest_range_breakout = true;
        let trades = [breakout];
        let refs: Vec<&TradeRecord> = trades.iter().collect();
        let metrics = calculate_metrics(&refs, false, &Settings::default(), &book()).unwrap();
        assert_eq!(metrics["SR NEAR SL PW"].trade_count, 1);
    }

    #[test]
    fn lta_flag_selects_lta_strategies_only() {
        let mut trade = pw_trade(true, 10.0, 5.0);
        trade.tp_sr_lta_pips = 10.0;
        trade.tp_sr_lta_sl_pw_win = true;
        trade.lta_range_breakout = true;
        let trades = [trade];
        let refs: Vec<&TradeRecord> = trades.iter().collect();
        let metrics = calculate_metrics(&refs, true, &Settings::default(), &book()).unwrap();
        assert_eq!(metrics["SR LTA SL PW"].trade_count, 1);
        assert_eq!(metrics["1RR PW"].trade_count, 0);
    }

    #[test]
    fn s2_gate_zeroes_non_s2_strategies() {
        let mut trade = pw_trade(true, 10.0, 5.0);
        trade.tp_sr_current_pips = 10.0;
        trade.tp_sr_current_pw_win = true;
        trade.current_range_breakout = true;
        let trades = [trade];
        let refs: Vec<&TradeRecord> = trades.iter().collect();
        let settings = Settings {
            s2_setup_only: true,
            ..weights(1.0, 1.0)
        };
        let metrics = calculate_metrics(&refs, false, &settings, &book()).unwrap();
        assert_eq!(metrics["1RR PW"], StrategyMetrics::default());
        assert_eq!(metrics["SR CURR SL PW"].trade_count, 1);

        let score = score_combination(&refs, false, &settings, &book()).expect("scored");
        assert_eq!(score.scores["1RR PW"], f64::NEG_INFINITY);
        assert_eq!(score.overall_score, score.scores["SR CURR SL PW"]);

        let only_pw = [pw_trade(true, 10.0, 5.0)];
        let refs: Vec<&TradeRecord> = only_pw.iter().collect();
        assert!(score_combination(&refs, false, &settings, &book()).is_none());
    }

    #[test]
    fn no_trades_fail_every_strategy_gate() {
        assert!(calculate_metrics(&[], false, &Settings::default(), &book()).is_none());
        assert!(score_combination(&[], false, &weights(1.0, 1.0), &book()).is_none());
    }

    #[test]
    fn profit_factor_equal_to_minimum_is_rejected() {
        // Three wins of 1R and two losses: profit factor exactly 1.5.
        let trades = [
            pw_trade(true, 5.0, 5.0),
            pw_trade(true, 5.0, 5.0),
            pw_trade(true, 5.0, 5.0),
            pw_trade(false, 5.0, 5.0),
            pw_trade(false, 5.0, 5.0),
        ];
        let refs: Vec<&TradeRecord> = trades.iter().collect();
        assert_eq!(pw_metrics(&refs, &Settings::default()).profit_factor, 1.5);

        let at_minimum = Settings {
            min_profit_factor: 1.5,
            ..weights(1.0, 1.0)
        };
        assert!(calculate_metrics(&refs, false, &at_minimum, &book()).is_none());
        assert!(score_combination(&refs, false, &at_minimum, &book()).is_none());

        let below_minimum = Settings {
            min_profit_factor: 1.49,
            ..weights(1.0, 1.0)
        };
        assert!(calculate_metrics(&refs, false, &below_minimum, &book()).is_some());
    }

    #[test]
    fn all_setups_failing_discards_the_combination() {
        let trades = [pw_trade(true, 10.0, 5.0), pw_trade(false, 10.0, 5.0)];
        let refs: Vec<&TradeRecord> = trades.iter().collect();
        let settings = Settings {
            min_win_rate: 60.0,
            min_profit_factor: 1.0,
            ..Settings::default()
        };
        assert!(calculate_metrics(&refs, false, &settings, &book()).is_none());
    }

    #[test]
    fn losing_and_empty_strategies_are_unranked() {
        let w = RankingWeights {
            profit_factor: 1.0,
            ..RankingWeights::default()
        };
        assert_eq!(composite_score(&StrategyMetrics::default(), &w), f64::NEG_INFINITY);
        let losing = StrategyMetrics::from_totals(0, 3, 0.0, 300.0);
        assert_eq!(composite_score(&losing, &w), f64::NEG_INFINITY);
        let perfect = StrategyMetrics::from_totals(3, 0, 600.0, 0.0);
        assert_eq!(composite_score(&perfect, &w), 10.0);
    }

    #[test]
    fn better_profit_factor_and_win_rate_never_score_lower() {
        let w = RankingWeights {
            profit_factor: 0.7,
            win_rate: 1.3,
            trade_count: 0.2,
            net_profit_pips: 0.0,
        };
        let strong = StrategyMetrics::from_totals(6, 4, 900.0, 400.0);
        let weak = StrategyMetrics::from_totals(5, 5, 600.0, 500.0);
        assert!(composite_score(&strong, &w) >= composite_score(&weak, &w));
    }

    fn result(score: f64, breakout_max: Option<f64>) -> ScoredResult {
        let mut combination = Combination::new();
        if let Some(max) = breakout_max {
            combination.insert("Breakout_Distance", Condition::Range(NumericBound::at_most(max)));
        }
        ScoredResult {
            combination,
            time_window: TimeWindow::Any,
            overall_score: score,
            overall_trade_count: 10,
            metrics: BTreeMap::new(),
            strategy_scores: BTreeMap::new(),
        }
    }

    #[test]
    fn final_ranking_orders_dedups_and_truncates() {
        let ranked = rank_final(
            vec![
                result(1.0, Some(5.0)),
                result(3.0, Some(2.0)),
                result(1.0, Some(10.0)),
                result(3.0, Some(2.0)),
                result(2.0, None),
            ],
            3,
        );
        let scores: Vec<f64> = ranked.iter().map(|r| r.overall_score).collect();
        assert_eq!(scores, vec![3.0, 2.0, 1.0]);
        assert_eq!(ranked[2].combination.max_bound("Breakout_Distance"), Some(10.0));
    }

    #[test]
    fn scored_result_json_maps_non_finite_values() {
        let mut scores = BTreeMap::new();
        scores.insert("1RR PW".to_string(), 2.5);
        scores.insert("1RR STR".to_string(), f64::NEG_INFINITY);
        let mut metrics = BTreeMap::new();
        metrics.insert(
            "1RR PW".to_string(),
            StrategyMetrics::from_totals(2, 0, 400.0, 0.0),
        );
        let scored = ScoredResult {
            strategy_scores: scores,
            metrics,
            time_window: TimeWindow::Range { min: 540, max: 570 },
            ..result(2.5, Some(5.0))
        };

        let value = serde_json::to_value(&scored).expect("encode");
        assert_eq!(value["combination"]["TimeWindow"], "09:00-09:30");
        assert_eq!(value["strategyScores"]["1RR STR"], serde_json::Value::Null);
        assert_eq!(value["metrics"]["1RR PW"]["profitFactor"], 9999.0);
        assert_eq!(value["metrics"]["1RR PW"]["totalTradesThisStrategy"], 2);

        let back: ScoredResult = serde_json::from_value(value).expect("decode");
        assert_eq!(back, scored);
    }
}
