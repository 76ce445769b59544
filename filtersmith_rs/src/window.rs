use std::fmt;

use ahash::AHashSet;
use anyhow::{Result, anyhow};
use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config::{PredefinedFilter, Settings, TimeRangeCondition};

pub const MINUTES_PER_DAY: u32 = 24 * 60;
/// Shifted windows shorter than this are dropped.
pub const MIN_WINDOW_MINUTES: i64 = 15;

/// Parse a clock string ("HH:MM:SS" or "HH:MM") into minutes since
/// midnight. "24:00" is accepted as end of day.
pub fn time_to_minutes(value: &str) -> Option<u32> {
    let value = value.trim();
    if value == "24:00" || value == "24:00:00" {
        return Some(MINUTES_PER_DAY);
    }
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .ok()
        .map(|time| time.hour() * 60 + time.minute())
}

fn format_clock(minutes: u32) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Time-of-day interval in minutes since midnight, both ends inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimeWindow {
    Any,
    Range { min: u32, max: u32 },
}

impl TimeWindow {
    pub fn label(&self) -> String {
        match self {
            TimeWindow::Any => "Any".to_string(),
            TimeWindow::Range { min, max } => {
                format!("{}-{}", format_clock(*min), format_clock(*max))
            }
        }
    }

    pub fn from_label(label: &str) -> Result<Self> {
        let label = label.trim();
        if label.eq_ignore_ascii_case("any") {
            return Ok(TimeWindow::Any);
        }
        let (start, end) = label
            .split_once('-')
            .ok_or_else(|| anyhow!("malformed time window label '{label}'"))?;
        let min = time_to_minutes(start)
            .ok_or_else(|| anyhow!("malformed window start in '{label}'"))?;
        let max =
            time_to_minutes(end).ok_or_else(|| anyhow!("malformed window end in '{label}'"))?;
        Ok(TimeWindow::Range { min, max })
    }

    pub fn contains(&self, minutes: u32) -> bool {
        match self {
            TimeWindow::Any => true,
            TimeWindow::Range { min, max } => minutes >= *min && minutes <= *max,
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, TimeWindow::Any)
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl Serialize for TimeWindow {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

impl<'de> Deserialize<'de> for TimeWindow {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        TimeWindow::from_label(&label).map_err(serde::de::Error::custom)
    }
}

/// Base window first, then every `(start, end)` offset pair in offset
/// order. Duplicates, inverted, too-short and out-of-day windows are dropped.
pub fn generate_time_windows(
    base_min: u32,
    base_max: u32,
    min_shift_hours: f64,
    max_shift_hours: f64,
    step_minutes: u32,
) -> Vec<TimeWindow> {
    let base = TimeWindow::Range {
        min: base_min,
        max: base_max,
    };
    let mut windows = vec![base];
    let mut seen: AHashSet<TimeWindow> = AHashSet::new();
    seen.insert(base);

    if step_minutes == 0 {
        return windows;
    }

    let min_shift = (min_shift_hours * 60.0) as i64;
    let max_shift = (max_shift_hours * 60.0) as i64;
    let offsets: Vec<i64> = (min_shift..=max_shift)
        .step_by(step_minutes as usize)
        .collect();

    for &start_offset in &offsets {
        for &end_offset in &offsets {
            let min = i64::from(base_min) + start_offset;
            let max = i64::from(base_max) + end_offset;
            if min >= max || max - min < MIN_WINDOW_MINUTES {
                continue;
            }
            if min < 0 || max > i64::from(MINUTES_PER_DAY) {
                continue;
            }
            let window = TimeWindow::Range {
                min: min as u32,
                max: max as u32,
            };
            if seen.insert(window) {
                windows.push(window);
            }
        }
    }
    windows
}

/// Pre-filters plus the shard list derived from a configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowPlan {
    pub prefilters: Vec<PredefinedFilter>,
    pub windows: Vec<TimeWindow>,
}

fn fully_bounded(condition: &TimeRangeCondition) -> Option<(&str, &str)> {
    match (condition.min.as_deref(), condition.max.as_deref()) {
        (Some(min), Some(max)) => Some((min, max)),
        _ => None,
    }
}

/// Split the predefined filters into the pre-filter set and the shard
/// windows. The first fully bounded `timeRange` filter becomes the base
/// window and is removed from the pre-filters.
pub fn plan_windows(settings: &Settings) -> Result<WindowPlan> {
    let base = settings
        .predefined_filters
        .iter()
        .enumerate()
        .find_map(|(position, filter)| match filter {
            PredefinedFilter::TimeRange { condition, .. } => {
                fully_bounded(condition).map(|bounds| (position, bounds))
            }
            _ => None,
        });

    let Some((position, (start, end))) = base else {
        return Ok(WindowPlan {
            prefilters: settings.predefined_filters.clone(),
            windows: vec![TimeWindow::Any],
        });
    };

    let base_min =
        time_to_minutes(start).ok_or_else(|| anyhow!("invalid time window start '{start}'"))?;
    let base_max =
        time_to_minutes(end).ok_or_else(|| anyhow!("invalid time window end '{end}'"))?;
    let mut prefilters = settings.predefined_filters.clone();
    prefilters.remove(position);

    let windows = if settings.enable_time_shift {
        generate_time_windows(
            base_min,
            base_max,
            settings.time_window_min_shift_hours,
            settings.time_window_max_shift_hours,
            settings.time_window_shift_step_minutes,
        )
    } else {
        vec![TimeWindow::Range {
            min: base_min,
            max: base_max,
        }]
    };

    Ok(WindowPlan {
        prefilters,
        windows,
    })
}
