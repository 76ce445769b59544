use anyhow::{Context, Result};

use crate::combinator::{Combination, TIME_WINDOW_KEY};
use crate::config::{PredefinedFilter, TimeRangeCondition};
use crate::criteria::{Condition, ConditionValue, NumericBound};
use crate::trade::{FieldRef, TradeRecord};
use crate::window::TimeWindow;
pub use crate::window::time_to_minutes;

/// Column whose presence in a combination switches scoring to the
/// long-term-average-range strategies.
pub const LTA_MARKER: &str = "Closed_In_LTA";
/// Legacy time key some producers attach to combinations.
pub const TIME_FILTER_KEY: &str = "TimeFilter";

/// Predefined filter with its column resolved against the trade schema.
#[derive(Debug, Clone)]
enum CompiledFilter {
    Exact(FieldRef, ConditionValue),
    TimeRange { min: Option<u32>, max: Option<u32> },
    NumericRange(FieldRef, NumericBound),
}

impl CompiledFilter {
    fn compile(filter: &PredefinedFilter) -> Result<Self> {
        match filter {
            PredefinedFilter::Exact {
                column_header,
                condition,
            } => Ok(CompiledFilter::Exact(
                FieldRef::resolve(column_header)?,
                condition.clone(),
            )),
            PredefinedFilter::TimeRange { condition, .. } => compile_time_range(condition),
            PredefinedFilter::NumericRange {
                column_header,
                condition,
            } => Ok(CompiledFilter::NumericRange(
                FieldRef::resolve(column_header)?,
                *condition,
            )),
        }
    }

    fn passes(&self, trade: &TradeRecord) -> bool {
        match self {
            CompiledFilter::Exact(field, expected) => expected.matches(field.read(trade)),
            CompiledFilter::TimeRange { min, max } => match time_to_minutes(&trade.time) {
                Some(minutes) => {
                    min.is_none_or(|min| minutes >= min) && max.is_none_or(|max| minutes <= max)
                }
                None => false,
            },
            CompiledFilter::NumericRange(field, bound) => field
                .read(trade)
                .as_number()
                .is_some_and(|value| bound.contains(value)),
        }
    }
}

fn compile_time_range(condition: &TimeRangeCondition) -> Result<CompiledFilter> {
    let parse = |value: &Option<String>| -> Result<Option<u32>> {
        value
            .as_deref()
            .map(|raw| time_to_minutes(raw).with_context(|| format!("invalid clock value '{raw}'")))
            .transpose()
    };
    Ok(CompiledFilter::TimeRange {
        min: parse(&condition.min)?,
        max: parse(&condition.max)?,
    })
}

/// A predefined filter set resolved once and reused for every narrowing.
#[derive(Debug, Clone, Default)]
pub struct PredefinedFilterSet {
    filters: Vec<CompiledFilter>,
}

impl PredefinedFilterSet {
    pub fn compile(filters: &[PredefinedFilter]) -> Result<Self> {
        let filters = filters
            .iter()
            .map(CompiledFilter::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { filters })
    }

    /// Filter set narrowing to one time window shard (empty for `Any`).
    pub fn for_window(window: TimeWindow) -> Self {
        match window {
            TimeWindow::Any => Self::default(),
            TimeWindow::Range { min, max } => Self {
                filters: vec![CompiledFilter::TimeRange {
                    min: Some(min),
                    max: Some(max),
                }],
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Entered, not canceled, and passing every filter.
    pub fn passes(&self, trade: &TradeRecord) -> bool {
        trade.entered
            && trade.canceled_after_candles == 0
            && self.filters.iter().all(|filter| filter.passes(trade))
    }

    /// An empty set is a no-op: every input trade is returned.
    pub fn apply<'a, I>(&self, trades: I) -> Vec<&'a TradeRecord>
    where
        I: IntoIterator<Item = &'a TradeRecord>,
    {
        if self.filters.is_empty() {
            return trades.into_iter().collect();
        }
        trades
            .into_iter()
            .filter(|trade| self.passes(trade))
            .collect()
    }
}

/// Apply a predefined filter list to a trade collection.
pub fn apply_predefined_filters<'a, I>(
    trades: I,
    filters: &[PredefinedFilter],
) -> Result<Vec<&'a TradeRecord>>
where
    I: IntoIterator<Item = &'a TradeRecord>,
{
    Ok(PredefinedFilterSet::compile(filters)?.apply(trades))
}

// =============================================================================
// Combination filters
// =============================================================================

#[derive(Debug, Clone)]
enum CompiledCondition {
    Range(NumericBound),
    Scalar(ConditionValue),
}

/// A combination with every column resolved to an accessor.
#[derive(Debug, Clone)]
pub struct CompiledCombination {
    clauses: Vec<(FieldRef, CompiledCondition)>,
    lta: bool,
}

impl CompiledCombination {
    /// Resolve every key of `combination`. Time keys are shard tags and are
    /// skipped; an unknown column is an error.
    pub fn compile(combination: &Combination) -> Result<Self> {
        let mut clauses = Vec::with_capacity(combination.len());
        let mut lta = false;
        for (column, condition) in combination.iter() {
            if column == TIME_WINDOW_KEY || column == TIME_FILTER_KEY {
                continue;
            }
            if column == LTA_MARKER {
                lta = true;
            }
            let field = FieldRef::resolve(column)?;
            let compiled = match condition {
                Condition::Range(bound) => CompiledCondition::Range(*bound),
                Condition::Scalar(value) => CompiledCondition::Scalar(value.clone()),
            };
            clauses.push((field, compiled));
        }
        Ok(Self { clauses, lta })
    }

    pub fn lta_flag(&self) -> bool {
        self.lta
    }

    /// Range bounds are inclusive on both ends; a missing or non-numeric
    /// value fails a range clause.
    pub fn matches(&self, trade: &TradeRecord) -> bool {
        self.clauses.iter().all(|(field, condition)| {
            let value = field.read(trade);
            match condition {
                CompiledCondition::Range(bound) => {
                    value.as_number().is_some_and(|v| bound.contains(v))
                }
                CompiledCondition::Scalar(expected) => expected.matches(value),
            }
        })
    }

    pub fn apply<'a>(&self, trades: &[&'a TradeRecord]) -> Vec<&'a TradeRecord> {
        trades
            .iter()
            .copied()
            .filter(|trade| self.matches(trade))
            .collect()
    }
}

/// Filter `trades` by `combination`, also reporting whether the
/// combination carries the LTA marker.
pub fn apply_filters<'a>(
    trades: &[&'a TradeRecord],
    combination: &Combination,
) -> Result<(Vec<&'a TradeRecord>, bool)> {
    let compiled = CompiledCombination::compile(combination)?;
    Ok((compiled.apply(trades), compiled.lta_flag()))
}
