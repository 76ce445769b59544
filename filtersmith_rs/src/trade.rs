use std::sync::OnceLock;

use ahash::AHashMap;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Column value read through the field table. Text borrows from the
/// record so filtering never clones strings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Bool(bool),
    Number(f64),
    Text(&'a str),
    Missing,
}

impl<'a> FieldValue<'a> {
    /// Numeric view used by range filters. Booleans, text, NaN and missing
    /// cells are not numbers.
    pub fn as_number(&self) -> Option<f64> {
        match *self {
            FieldValue::Number(value) if !value.is_nan() => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            FieldValue::Bool(value) => Some(value),
            _ => None,
        }
    }
}

trait AsFieldValue {
    fn as_field_value(&self) -> FieldValue<'_>;
}

impl AsFieldValue for bool {
    fn as_field_value(&self) -> FieldValue<'_> {
        FieldValue::Bool(*self)
    }
}

impl AsFieldValue for f64 {
    fn as_field_value(&self) -> FieldValue<'_> {
        FieldValue::Number(*self)
    }
}

impl AsFieldValue for i64 {
    fn as_field_value(&self) -> FieldValue<'_> {
        FieldValue::Number(*self as f64)
    }
}

impl AsFieldValue for String {
    fn as_field_value(&self) -> FieldValue<'_> {
        FieldValue::Text(self.as_str())
    }
}

impl AsFieldValue for Option<f64> {
    fn as_field_value(&self) -> FieldValue<'_> {
        match self {
            Some(value) => FieldValue::Number(*value),
            None => FieldValue::Missing,
        }
    }
}

/// Typed accessor for one column of [`TradeRecord`].
#[derive(Clone, Copy)]
pub struct FieldAccessor {
    column: &'static str,
    read: fn(&TradeRecord) -> FieldValue<'_>,
}

impl FieldAccessor {
    pub fn column(&self) -> &'static str {
        self.column
    }

    pub fn read<'a>(&self, trade: &'a TradeRecord) -> FieldValue<'a> {
        (self.read)(trade)
    }
}

impl std::fmt::Debug for FieldAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FieldAccessor").field(&self.column).finish()
    }
}

impl PartialEq for FieldAccessor {
    fn eq(&self, other: &Self) -> bool {
        self.column == other.column
    }
}

// One declaration drives both the serde schema and the accessor table, so
// a column can never be deserializable but unreachable by name.
macro_rules! trade_schema {
    ($( $field:ident : $ty:ty => $column:literal ),* $(,)?) => {
        /// One historical trade row. Loaded once per job and never mutated.
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(default)]
        pub struct TradeRecord {
            $(
                #[serde(rename = $column)]
                pub $field: $ty,
            )*
        }

        const FIELD_TABLE: &[FieldAccessor] = &[
            $(
                FieldAccessor {
                    column: $column,
                    read: |trade: &TradeRecord| trade.$field.as_field_value(),
                },
            )*
        ];
    };
}

trade_schema! {
    timeframe: String => "timeframe",
    date: String => "Date",
    time: String => "Time",
    eu_offs: f64 => "EU_OFFS",
    setup: String => "Setup",
    direction: String => "Direction",
    entered: bool => "Entered",
    canceled_after_candles: i64 => "Canceled_After_Candles",
    entered_after_seconds: f64 => "Entered_After_Seconds",

    tp_1rr_pw_pips: f64 => "TP_1RR_PW_PIPS",
    tp_1rr_str_pips: f64 => "TP_1RR_STR_PIPS",
    tp_sr_nearest_pips: f64 => "TP_SR_NEAREST_PIPS",
    tp_sr_static_pips: f64 => "TP_SR_STATIC_PIPS",
    tp_sr_current_pips: f64 => "TP_SR_CURRENT_PIPS",
    tp_sr_lta_pips: f64 => "TP_SR_LTA_PIPS",

    tp_1rr_pw_win: bool => "TP_1RR_PW_WIN",
    tp_1rr_str_win: bool => "TP_1RR_STR_WIN",
    tp_sr_nearest_sl_pw_win: bool => "TP_SR_NEAREST_SL_PW_WIN",
    tp_sr_nearest_sl_str_win: bool => "TP_SR_NEAREST_SL_STR_WIN",
    tp_sr_static_sl_pw_win: bool => "TP_SR_STATIC_SL_PW_WIN",
    tp_sr_static_sl_str_win: bool => "TP_SR_STATIC_SL_STR_WIN",
    tp_sr_current_pw_win: bool => "TP_SR_CURRENT_PW_WIN",
    tp_sr_current_str_win: bool => "TP_SR_CURRENT_STR_WIN",
    tp_sr_lta_sl_pw_win: bool => "TP_SR_LTA_SL_PW_WIN",
    tp_sr_lta_sl_str_win: bool => "TP_SR_LTA_SL_STR_WIN",

    sl_pw_pips: f64 => "SL_PW_PIPS",
    sl_str_pips: f64 => "SL_STR_PIPS",

    candle_size: f64 => "Candle_Size",
    entry_candle_has_wick: bool => "Entry_Candle_Has_Wick",
    setup_candle_has_wick: bool => "Setup_Candle_Has_Wick",
    breakout_distance: f64 => "Breakout_Distance",
    entry_distance: f64 => "Entry_Distance",
    breakout_candle_count: i64 => "Breakout_Candle_Count",

    m5_candle: bool => "M5_Candle",
    m5_consecutive_candles: i64 => "M5_Consecutive_Candles",
    m10_candle: bool => "M10_Candle",
    m10_candle_open: bool => "M10_Candle_Open",
    m10_consecutive_candles: i64 => "M10_Consecutive_Candles",
    m15_candle: bool => "M15_Candle",
    m15_candle_open: bool => "M15_Candle_Open",
    m15_consecutive_candles: i64 => "M15_Consecutive_Candles",
    m30_candle: bool => "M30_Candle",
    m30_candle_open: bool => "M30_Candle_Open",
    m30_consecutive_candles: i64 => "M30_Consecutive_Candles",
    h1_candle: bool => "H1_Candle",
    h1_candle_open: bool => "H1_Candle_Open",
    h1_consecutive_candles: i64 => "H1_Consecutive_Candles",
    h4_candle: bool => "H4_Candle",
    h4_candle_open: bool => "H4_Candle_Open",
    d1_candle: bool => "D1_Candle",
    d1_candle_open: bool => "D1_Candle_Open",

    gaussian_trend_1: bool => "Gaussian_Trend_1",
    gaussian_trend_2: bool => "Gaussian_Trend_2",
    gaussian_trend_3: bool => "Gaussian_Trend_3",
    gaussian_trend_4: bool => "Gaussian_Trend_4",
    gaussian_trend_5: bool => "Gaussian_Trend_5",
    gaussian_trend_6: bool => "Gaussian_Trend_6",
    gaussian_trend_7: bool => "Gaussian_Trend_7",

    s2_previous_support_distance: Option<f64> => "S2_Previous_Support_Distance",
    s2_previous_resistance_distance: Option<f64> => "S2_Previous_Resistance_Distance",

    closed_in_lta: bool => "Closed_In_LTA",
    lta_range_breakout: bool => "LTA_Range_Breakout",
    current_range_breakout: bool => "Current_Range_Breakout",
    nearest_range_breakout: bool => "Nearest_Range_Breakout",
    static_range_breakout: bool => "Static_Range_Breakout",
}

/// Direction value that selects the first half of an `A|B` column header.
pub const BUY_DIRECTION: &str = "BUY";

fn field_index() -> &'static AHashMap<&'static str, FieldAccessor> {
    static INDEX: OnceLock<AHashMap<&'static str, FieldAccessor>> = OnceLock::new();
    INDEX.get_or_init(|| {
        FIELD_TABLE
            .iter()
            .map(|accessor| (accessor.column, *accessor))
            .collect()
    })
}

/// Every column name known to the trade schema, in declaration order.
pub fn known_columns() -> impl Iterator<Item = &'static str> {
    FIELD_TABLE.iter().map(|accessor| accessor.column)
}

/// Look up a single column. Spaces are accepted in place of underscores
/// so catalog labels like "S2 Previous Support Distance" resolve.
pub fn field_accessor(column: &str) -> Option<FieldAccessor> {
    let index = field_index();
    if let Some(found) = index.get(column) {
        return Some(*found);
    }
    let normalized = column.trim().replace(' ', "_");
    index.get(normalized.as_str()).copied()
}

/// A resolved column reference. `Directional` covers headers of the form
/// `A|B`, where BUY trades read `A` and every other direction reads `B`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldRef {
    Direct(FieldAccessor),
    Directional {
        buy: FieldAccessor,
        sell: FieldAccessor,
    },
}

impl FieldRef {
    pub fn resolve(header: &str) -> Result<Self> {
        if let Some((buy, sell)) = header.split_once('|') {
            let buy = field_accessor(buy)
                .ok_or_else(|| anyhow!("unknown trade column '{buy}' in header '{header}'"))?;
            let sell = field_accessor(sell)
                .ok_or_else(|| anyhow!("unknown trade column '{sell}' in header '{header}'"))?;
            return Ok(FieldRef::Directional { buy, sell });
        }
        field_accessor(header)
            .map(FieldRef::Direct)
            .ok_or_else(|| anyhow!("unknown trade column '{header}'"))
    }

    pub fn read<'a>(&self, trade: &'a TradeRecord) -> FieldValue<'a> {
        match self {
            FieldRef::Direct(accessor) => accessor.read(trade),
            FieldRef::Directional { buy, sell } => {
                if trade.direction == BUY_DIRECTION {
                    buy.read(trade)
                } else {
                    sell.read(trade)
                }
            }
        }
    }
}
