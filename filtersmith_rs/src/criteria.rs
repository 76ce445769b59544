use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::trade::FieldValue;

/// Inclusive numeric bound. A missing side is unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NumericBound {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl NumericBound {
    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }

    pub fn at_most(max: f64) -> Self {
        Self::new(None, Some(max))
    }

    pub fn at_least(min: f64) -> Self {
        Self::new(Some(min), None)
    }

    pub fn between(min: f64, max: f64) -> Self {
        Self::new(Some(min), Some(max))
    }

    /// Both ends are inclusive.
    pub fn contains(&self, value: f64) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }
}

/// Scalar condition value for exact-match criteria and filters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl ConditionValue {
    /// Type-matched equality: a boolean condition never equals a number.
    pub fn matches(&self, value: FieldValue<'_>) -> bool {
        match (self, value) {
            (ConditionValue::Bool(expected), FieldValue::Bool(actual)) => *expected == actual,
            (ConditionValue::Number(expected), FieldValue::Number(actual)) => *expected == actual,
            (ConditionValue::Text(expected), FieldValue::Text(actual)) => expected == actual,
            _ => false,
        }
    }
}

impl fmt::Display for ConditionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionValue::Bool(value) => write!(f, "{value}"),
            ConditionValue::Number(value) => write!(f, "{value}"),
            ConditionValue::Text(value) => write!(f, "{value}"),
        }
    }
}

/// Value assigned to one column inside a combination.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Range(NumericBound),
    Scalar(ConditionValue),
}

impl Condition {
    pub fn as_range(&self) -> Option<&NumericBound> {
        match self {
            Condition::Range(bound) => Some(bound),
            Condition::Scalar(_) => None,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Scalar(value) => write!(f, "{value}"),
            Condition::Range(bound) => match (bound.min, bound.max) {
                (Some(min), Some(max)) => write!(f, "{min}..={max}"),
                (Some(min), None) => write!(f, ">={min}"),
                (None, Some(max)) => write!(f, "<={max}"),
                (None, None) => write!(f, "any"),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CriterionKind {
    Exact,
    NumericRange,
}

/// How sorted thresholds become range options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RangeMode {
    /// Every ascending pair `(t[i], t[j])`.
    Permutation,
    /// One `{max: t}` per threshold.
    MaxBound,
    /// `{max: t0}`, adjacent pairs, then `{min: tn}`.
    #[default]
    Windowed,
}

impl From<String> for RangeMode {
    fn from(value: String) -> Self {
        match value.as_str() {
            "PERMUTATION" => RangeMode::Permutation,
            "MAX" => RangeMode::MaxBound,
            _ => RangeMode::Windowed,
        }
    }
}

impl From<RangeMode> for String {
    fn from(value: RangeMode) -> Self {
        match value {
            RangeMode::Permutation => "PERMUTATION".to_string(),
            RangeMode::MaxBound => "MAX".to_string(),
            RangeMode::Windowed => String::new(),
        }
    }
}

/// One axis of the search space.
///
/// `None` entries in `test_values` / `thresholds` are the wildcard: the
/// column is left out of the combination entirely.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Criterion {
    pub column_header: String,
    #[serde(rename = "type")]
    pub kind: CriterionKind,
    #[serde(default)]
    pub test_values: Vec<Option<ConditionValue>>,
    #[serde(default)]
    pub thresholds: Vec<Option<f64>>,
    #[serde(default)]
    pub mode: RangeMode,
}

impl Criterion {
    pub fn exact(column_header: impl Into<String>, test_values: Vec<Option<ConditionValue>>) -> Self {
        Self {
            column_header: column_header.into(),
            kind: CriterionKind::Exact,
            test_values,
            thresholds: Vec::new(),
            mode: RangeMode::Windowed,
        }
    }

    pub fn numeric(
        column_header: impl Into<String>,
        thresholds: Vec<Option<f64>>,
        mode: RangeMode,
    ) -> Self {
        Self {
            column_header: column_header.into(),
            kind: CriterionKind::NumericRange,
            test_values: Vec::new(),
            thresholds,
            mode,
        }
    }

    fn flag(column_header: &str) -> Self {
        Self::exact(column_header, vec![Some(ConditionValue::Bool(true)), None])
    }

    /// Ordered option set for this axis. `None` is the unconstrained option.
    pub fn options(&self) -> Vec<Option<Condition>> {
        let options = match self.kind {
            CriterionKind::Exact => self
                .test_values
                .iter()
                .map(|value| value.clone().map(Condition::Scalar))
                .collect(),
            CriterionKind::NumericRange => self.range_options(),
        };
        if options.is_empty() {
            vec![None]
        } else {
            options
        }
    }

    pub fn option_count(&self) -> usize {
        self.options().len()
    }

    fn range_options(&self) -> Vec<Option<Condition>> {
        let mut sorted: Vec<f64> = self
            .thresholds
            .iter()
            .flatten()
            .copied()
            .filter(|t| t.is_finite())
            .collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let mut options = Vec::new();
        if self.thresholds.iter().any(Option::is_none) {
            options.push(None);
        }
        if sorted.is_empty() {
            return options;
        }

        let range = |bound: NumericBound| Some(Condition::Range(bound));
        match self.mode {
            RangeMode::Permutation => {
                for i in 0..sorted.len() {
                    for j in (i + 1)..sorted.len() {
                        options.push(range(NumericBound::between(sorted[i], sorted[j])));
                    }
                }
            }
            RangeMode::MaxBound => {
                options.extend(sorted.iter().map(|&t| range(NumericBound::at_most(t))));
            }
            RangeMode::Windowed => {
                options.push(range(NumericBound::at_most(sorted[0])));
                for pair in sorted.windows(2) {
                    options.push(range(NumericBound::between(pair[0], pair[1])));
                }
                if let Some(&last) = sorted.last() {
                    options.push(range(NumericBound::at_least(last)));
                }
            }
        }
        options
    }
}

// =============================================================================
// Selectable catalog
// =============================================================================

/// A named group of criteria users toggle on through `combinationsToTest`.
#[derive(Clone, Debug)]
pub struct CatalogGroup {
    pub name: &'static str,
    pub criteria: Vec<Criterion>,
}

const DISTANCE_THRESHOLDS: [f64; 8] = [2.0, 5.0, 7.5, 10.0, 12.5, 15.0, 20.0, 25.0];

fn with_wildcard(values: &[f64]) -> Vec<Option<f64>> {
    values.iter().copied().map(Some).chain([None]).collect()
}

fn build_catalog() -> Vec<CatalogGroup> {
    let flags = |columns: &[&str]| -> Vec<Criterion> {
        columns.iter().map(|column| Criterion::flag(column)).collect()
    };
    vec![
        CatalogGroup {
            name: "Gaussian",
            criteria: flags(&[
                "Gaussian_Trend_1",
                "Gaussian_Trend_2",
                "Gaussian_Trend_3",
                "Gaussian_Trend_4",
                "Gaussian_Trend_5",
                "Gaussian_Trend_6",
                "Gaussian_Trend_7",
            ]),
        },
        CatalogGroup {
            name: "Candle Size Min Max",
            criteria: vec![Criterion::numeric(
                "Candle_Size",
                with_wildcard(&[2.0, 5.0, 8.0, 10.0, 15.0, 18.0, 25.0]),
                RangeMode::Permutation,
            )],
        },
        CatalogGroup {
            name: "Breakout Candle Count Max",
            criteria: vec![Criterion::numeric(
                "Breakout_Candle_Count",
                with_wildcard(&[1.0, 2.0, 3.0]),
                RangeMode::MaxBound,
            )],
        },
        CatalogGroup {
            name: "Entry Distance Max",
            criteria: vec![Criterion::numeric(
                "Entry_Distance",
                with_wildcard(&DISTANCE_THRESHOLDS),
                RangeMode::MaxBound,
            )],
        },
        CatalogGroup {
            name: "Breakout Distance Max",
            criteria: vec![Criterion::numeric(
                "Breakout_Distance",
                with_wildcard(&DISTANCE_THRESHOLDS),
                RangeMode::MaxBound,
            )],
        },
        CatalogGroup {
            name: "Closed In LTA",
            criteria: flags(&["Closed_In_LTA"]),
        },
        CatalogGroup {
            name: "Setup Candle Has Wick",
            criteria: flags(&["Setup_Candle_Has_Wick"]),
        },
        CatalogGroup {
            name: "Entry Candle Has Wick",
            criteria: flags(&["Entry_Candle_Has_Wick"]),
        },
        CatalogGroup {
            name: "Candle Closed",
            criteria: flags(&[
                "M10_Candle",
                "M15_Candle",
                "M30_Candle",
                "H1_Candle",
                "H4_Candle",
                "D1_Candle",
            ]),
        },
        CatalogGroup {
            name: "Candle Open",
            criteria: flags(&[
                "M10_Candle_Open",
                "M15_Candle_Open",
                "M30_Candle_Open",
                "H1_Candle_Open",
                "H4_Candle_Open",
                "D1_Candle_Open",
            ]),
        },
        CatalogGroup {
            name: "S2 Pullback Distance Max",
            criteria: vec![Criterion::numeric(
                "S2_Previous_Support_Distance|S2_Previous_Resistance_Distance",
                with_wildcard(&DISTANCE_THRESHOLDS),
                RangeMode::MaxBound,
            )],
        },
    ]
}

pub fn selectable_catalog() -> &'static [CatalogGroup] {
    static CATALOG: OnceLock<Vec<CatalogGroup>> = OnceLock::new();
    CATALOG.get_or_init(build_catalog)
}

/// Flatten the criteria of every enabled group, in catalog order.
pub fn build_enabled_criteria(enabled: &[String]) -> Vec<Criterion> {
    let catalog = selectable_catalog();
    for name in enabled {
        if !catalog.iter().any(|group| group.name == name) {
            warn!(group = %name, "Ignoring unknown combination group");
        }
    }
    catalog
        .iter()
        .filter(|group| enabled.iter().any(|name| name == group.name))
        .flat_map(|group| group.criteria.iter().cloned())
        .collect()
}
