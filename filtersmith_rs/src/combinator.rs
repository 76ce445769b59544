use std::borrow::Cow;
use std::fmt;

use anyhow::{Context, anyhow};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::criteria::{Condition, ConditionValue, Criterion};
use crate::window::TimeWindow;

/// Key under which a work item carries its time window label.
pub const TIME_WINDOW_KEY: &str = "TimeWindow";

/// One concrete assignment of conditions to columns. Entries keep the
/// criterion order they were generated in; a missing column is
/// unconstrained.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Combination {
    entries: Vec<(String, Condition)>,
}

impl Combination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, column: &str) -> Option<&Condition> {
        self.entries
            .iter()
            .find(|(key, _)| key == column)
            .map(|(_, condition)| condition)
    }

    pub fn contains_key(&self, column: &str) -> bool {
        self.get(column).is_some()
    }

    /// Replace an existing column in place, or append a new one.
    pub fn insert(&mut self, column: impl Into<String>, condition: Condition) {
        let column = column.into();
        match self.entries.iter_mut().find(|(key, _)| *key == column) {
            Some(entry) => entry.1 = condition,
            None => self.entries.push((column, condition)),
        }
    }

    pub fn remove(&mut self, column: &str) -> Option<Condition> {
        let position = self.entries.iter().position(|(key, _)| key == column)?;
        Some(self.entries.remove(position).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Condition)> {
        self.entries
            .iter()
            .map(|(key, condition)| (key.as_str(), condition))
    }

    /// Order-independent identity used for de-duplication and tie-breaks.
    pub fn canonical_key(&self) -> String {
        let mut parts: Vec<String> = self
            .entries
            .iter()
            .map(|(key, condition)| format!("{key}={condition}"))
            .collect();
        parts.sort();
        parts.join("&")
    }

    /// Upper bound of a range condition on `column`, if any.
    pub fn max_bound(&self, column: &str) -> Option<f64> {
        self.get(column)
            .and_then(Condition::as_range)
            .and_then(|bound| bound.max)
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return f.write_str("(unconstrained)");
        }
        for (index, (key, condition)) in self.entries.iter().enumerate() {
            if index > 0 {
                f.write_str(" && ")?;
            }
            write!(f, "{key}={condition}")?;
        }
        Ok(())
    }
}

impl Serialize for Combination {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, condition) in &self.entries {
            map.serialize_entry(key, condition)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Combination {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CombinationVisitor;

        impl<'de> Visitor<'de> for CombinationVisitor {
            type Value = Combination;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of column headers to conditions")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut combination = Combination::new();
                while let Some((key, condition)) = access.next_entry::<String, Condition>()? {
                    combination.insert(key, condition);
                }
                Ok(combination)
            }
        }

        deserializer.deserialize_map(CombinationVisitor)
    }
}

// =============================================================================
// Combination space (mixed-radix product over criteria options)
// =============================================================================

/// Per-criterion option lists for an ordered criteria set. Holds only the
/// option lists, never the product.
#[derive(Clone, Debug, PartialEq)]
pub struct CombinationSpace {
    headers: Vec<String>,
    options: Vec<Vec<Option<Condition>>>,
}

impl CombinationSpace {
    pub fn new(criteria: &[Criterion]) -> Self {
        Self {
            headers: criteria.iter().map(|c| c.column_header.clone()).collect(),
            options: criteria.iter().map(Criterion::options).collect(),
        }
    }

    pub fn depth(&self) -> usize {
        self.headers.len()
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Option count per criterion, in criterion order.
    pub fn radices(&self) -> Vec<usize> {
        self.options.iter().map(Vec::len).collect()
    }

    /// Product of option counts, saturating at `u128::MAX`. An empty
    /// criteria set has exactly one (empty) combination.
    pub fn total(&self) -> u128 {
        self.options
            .iter()
            .fold(1u128, |acc, options| acc.saturating_mul(options.len() as u128))
    }

    fn build(&self, cursor: &[usize]) -> Combination {
        let mut combination = Combination::new();
        for ((header, options), &choice) in self.headers.iter().zip(&self.options).zip(cursor) {
            if let Some(condition) = &options[choice] {
                combination.entries.push((header.clone(), condition.clone()));
            }
        }
        combination
    }

    /// Mixed-radix decode of `index`; the first criterion is the most
    /// significant digit.
    fn cursor_for(&self, index: u128) -> Option<Vec<usize>> {
        if index >= self.total() {
            return None;
        }
        let mut cursor = vec![0usize; self.options.len()];
        let mut remaining = index;
        for position in (0..self.options.len()).rev() {
            let radix = self.options[position].len() as u128;
            cursor[position] = (remaining % radix) as usize;
            remaining /= radix;
        }
        Some(cursor)
    }

    /// Combination at `index` in expansion order.
    pub fn unrank(&self, index: u128) -> Option<Combination> {
        self.cursor_for(index).map(|cursor| self.build(&cursor))
    }

    pub fn iter(&self) -> SeekableCombinationIterator<'_> {
        SeekableCombinationIterator::starting_at(self, 0)
    }

    pub fn iter_from(&self, start_index: u128) -> SeekableCombinationIterator<'_> {
        SeekableCombinationIterator::starting_at(self, start_index)
    }
}

/// Number of combinations `expand` yields, computed without generating any.
pub fn count(criteria: &[Criterion]) -> u128 {
    CombinationSpace::new(criteria).total()
}

/// Lazy, restartable expansion in criterion order.
pub fn expand(criteria: &[Criterion]) -> SeekableCombinationIterator<'static> {
    SeekableCombinationIterator::over(Cow::Owned(CombinationSpace::new(criteria)), 0)
}

// =============================================================================
// Seekable Iterator
// =============================================================================

/// Depth-first walk of the combination space driven by an explicit cursor
/// stack, one index per criterion. Memory is O(depth) for any space size.
pub struct SeekableCombinationIterator<'a> {
    space: Cow<'a, CombinationSpace>,
    cursor: Vec<usize>,
    position: u128,
    exhausted: bool,
}

impl<'a> SeekableCombinationIterator<'a> {
    /// Start at `start_index` (0-based) in O(depth).
    pub fn starting_at(space: &'a CombinationSpace, start_index: u128) -> Self {
        Self::over(Cow::Borrowed(space), start_index)
    }

    fn over(space: Cow<'a, CombinationSpace>, start_index: u128) -> Self {
        match space.cursor_for(start_index) {
            Some(cursor) => Self {
                space,
                cursor,
                position: start_index,
                exhausted: false,
            },
            None => Self {
                space,
                cursor: Vec::new(),
                position: start_index,
                exhausted: true,
            },
        }
    }

    /// Global index of the next combination to be yielded.
    pub fn current_index(&self) -> Option<u128> {
        (!self.exhausted).then_some(self.position)
    }

    fn advance(&mut self) {
        self.position += 1;
        for depth in (0..self.cursor.len()).rev() {
            self.cursor[depth] += 1;
            if self.cursor[depth] < self.space.options[depth].len() {
                return;
            }
            self.cursor[depth] = 0;
        }
        self.exhausted = true;
    }
}

impl<'a> Iterator for SeekableCombinationIterator<'a> {
    type Item = Combination;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let combination = self.space.build(&self.cursor);
        self.advance();
        Some(combination)
    }
}

// =============================================================================
// CombinationBatcher
// =============================================================================

pub struct CombinationBatcher<'a> {
    iter: SeekableCombinationIterator<'a>,
    remaining: Option<u128>,
}

impl<'a> CombinationBatcher<'a> {
    pub fn new(space: &'a CombinationSpace, start_offset: u128) -> Self {
        Self {
            iter: space.iter_from(start_offset),
            remaining: None,
        }
    }

    /// Stop after `limit` combinations have been handed out.
    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.remaining = limit.map(u128::from);
        self
    }

    pub fn next_batch(&mut self, batch_size: usize) -> Option<Vec<Combination>> {
        let mut take = batch_size;
        if let Some(remaining) = self.remaining {
            take = take.min(remaining.min(usize::MAX as u128) as usize);
        }
        let mut batch = Vec::with_capacity(take);
        while batch.len() < take {
            match self.iter.next() {
                Some(combo) => batch.push(combo),
                None => break,
            }
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= batch.len() as u128;
        }
        if batch.is_empty() { None } else { Some(batch) }
    }
}

// =============================================================================
// Work item codec
// =============================================================================

/// A combination tagged with the time window shard it belongs to.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkItem {
    pub combination: Combination,
    pub time_window: TimeWindow,
}

struct TaggedCombination<'a> {
    combination: &'a Combination,
    label: String,
}

impl Serialize for TaggedCombination<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.combination.len() + 1))?;
        for (key, condition) in self.combination.iter() {
            map.serialize_entry(key, condition)?;
        }
        map.serialize_entry(TIME_WINDOW_KEY, &self.label)?;
        map.end()
    }
}

impl WorkItem {
    pub fn new(combination: Combination, time_window: TimeWindow) -> Self {
        Self {
            combination,
            time_window,
        }
    }

    /// JSON object of the combination plus its `TimeWindow` label.
    pub fn to_value(&self) -> anyhow::Result<serde_json::Value> {
        serde_json::to_value(self.tagged()).context("failed to encode work item")
    }

    pub fn encode(&self) -> anyhow::Result<String> {
        serde_json::to_string(&self.tagged()).context("failed to encode work item")
    }

    fn tagged(&self) -> TaggedCombination<'_> {
        TaggedCombination {
            combination: &self.combination,
            label: self.time_window.label(),
        }
    }

    pub fn decode(raw: &str) -> anyhow::Result<Self> {
        let combination: Combination = serde_json::from_str(raw).context("malformed work item")?;
        Self::split_tag(combination)
    }

    pub fn from_value(value: serde_json::Value) -> anyhow::Result<Self> {
        let combination: Combination =
            serde_json::from_value(value).context("malformed combination object")?;
        Self::split_tag(combination)
    }

    fn split_tag(mut combination: Combination) -> anyhow::Result<Self> {
        let time_window = match combination.remove(TIME_WINDOW_KEY) {
            None => TimeWindow::Any,
            Some(Condition::Scalar(ConditionValue::Text(label))) => TimeWindow::from_label(&label)?,
            Some(other) => return Err(anyhow!("unexpected time window tag {other}")),
        };
        Ok(Self {
            combination,
            time_window,
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
