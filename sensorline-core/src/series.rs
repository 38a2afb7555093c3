//! Derived views over a stored series.
//!
//! Every function here is a pure function of its input slice: identical input
//! gives identical output and nothing is cached between calls. The views are:
//! - moving average over a trailing window of samples
//! - binned value distribution with fixed-width bins
//! - threshold exceedance against a per-sensor-type rule
//! - exact value histogram
//!
//! Readings are expected in timestamp order, as returned by
//! [`Store::query_range`](crate::storage::Store::query_range). When several
//! sensor ids are present, each id is treated as its own series.

use crate::reading::Reading;
use crate::storage::SeriesFilter;
use arrow_array::{ArrayRef, Float64Array, Int16Array, RecordBatch, TimestampMicrosecondArray, UInt64Array};
use arrow_schema::{ArrowError, Field, Schema};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Samples in the moving-average window.
pub const MOVING_AVERAGE_WINDOW: usize = 5;

/// Width of one distribution bin, in the sensor's unit.
pub const BIN_WIDTH: f64 = 0.25;

/// Which side of the threshold raises an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Alert when the value is strictly greater than the threshold
    Above,
    /// Alert when the value is strictly less than the threshold
    Below,
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Above => write!(f, "above"),
            Direction::Below => write!(f, "below"),
        }
    }
}

/// Alert bound for one sensor type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub threshold: f64,
    pub direction: Direction,
}

impl ThresholdRule {
    pub fn above(threshold: f64) -> Self {
        Self { threshold, direction: Direction::Above }
    }

    pub fn below(threshold: f64) -> Self {
        Self { threshold, direction: Direction::Below }
    }

    pub fn is_violated_by(&self, value: f64) -> bool {
        match self.direction {
            Direction::Above => value > self.threshold,
            Direction::Below => value < self.threshold,
        }
    }
}

/// One sample with its trailing mean.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AveragePoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    /// `None` until the window has filled.
    pub average: Option<f64>,
}

/// Moving average of a single sensor id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesAverage {
    pub sensor_id: Option<i16>,
    pub points: Vec<AveragePoint>,
}

/// One non-empty distribution bin, `[lower, upper)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bin {
    pub sensor_id: Option<i16>,
    pub lower: f64,
    pub upper: f64,
    pub count: u64,
}

/// Occurrences of one exact value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueCount {
    pub sensor_id: Option<i16>,
    pub value: f64,
    pub count: u64,
}

/// Trailing arithmetic mean of `values`.
///
/// Position `i` holds the mean of `values[i + 1 - window..=i]`. Positions before
/// the window fills are `None`. A zero window yields no averages at all.
pub fn rolling_mean(values: &[f64], window: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if window == 0 || values.len() < window {
        return out;
    }
    // Each window is summed afresh so results never depend on accumulated drift.
    for (offset, slice) in values.windows(window).enumerate() {
        out[offset + window - 1] = Some(slice.iter().sum::<f64>() / window as f64);
    }
    out
}

/// Moving average per sensor id, groups ordered by sensor id.
pub fn moving_average(readings: &[Reading], window: usize) -> Vec<SeriesAverage> {
    group_by_sensor(readings)
        .into_iter()
        .map(|(sensor_id, series)| {
            let values: Vec<f64> = series.iter().map(|r| r.value).collect();
            let points = series
                .iter()
                .zip(rolling_mean(&values, window))
                .map(|(reading, average)| AveragePoint {
                    timestamp: reading.timestamp,
                    value: reading.value,
                    average,
                })
                .collect();
            SeriesAverage { sensor_id, points }
        })
        .collect()
}

/// Rounding slack, in bin widths, when comparing a value against a bin edge.
const EDGE_TOLERANCE: f64 = 1e-9;

/// Number of bins of `width` needed to cover `[min, max]`, at least one.
fn bin_count(min: f64, max: f64, width: f64) -> usize {
    let span = (max - min) / width;
    // Tolerate rounding so an exact multiple does not open an extra bin.
    (span - EDGE_TOLERANCE).ceil().max(1.0) as usize
}

/// Lower edge of bin `index`, computed the same way the reported bounds are.
fn bin_edge(min: f64, index: usize, width: f64) -> f64 {
    min + index as f64 * width
}

/// Bin holding `value`, checked against the reported edges so a value sitting on
/// an interior edge lands in the bin that starts there.
fn bin_index(value: f64, min: f64, width: f64, bins: usize) -> usize {
    let slack = EDGE_TOLERANCE * width;
    let mut index = (((value - min) / width).floor().max(0.0) as usize).min(bins - 1);
    while index + 1 < bins && value >= bin_edge(min, index + 1, width) - slack {
        index += 1;
    }
    while index > 0 && value < bin_edge(min, index, width) - slack {
        index -= 1;
    }
    index
}

/// Histogram with fixed-width bins starting at the smallest value.
///
/// Bin edges are shared by every sensor id in the selection; counts are kept per
/// sensor id. Bins are half-open except the last, which also holds the maximum.
/// Empty bins are omitted. When all values are equal a single bin of `width` is
/// produced. `width` must be positive and finite; otherwise no bins are produced.
pub fn binned_distribution(readings: &[Reading], width: f64) -> Vec<Bin> {
    if readings.is_empty() || !(width > 0.0 && width.is_finite()) {
        return Vec::new();
    }

    let min = readings.iter().map(|r| r.value).fold(f64::INFINITY, f64::min);
    let max = readings.iter().map(|r| r.value).fold(f64::NEG_INFINITY, f64::max);
    let bins = bin_count(min, max, width);

    let mut counts: BTreeMap<(Option<i16>, usize), u64> = BTreeMap::new();
    for reading in readings {
        let index = bin_index(reading.value, min, width, bins);
        *counts.entry((reading.sensor_id, index)).or_default() += 1;
    }

    counts
        .into_iter()
        .map(|((sensor_id, index), count)| {
            let lower = bin_edge(min, index, width);
            Bin {
                sensor_id,
                lower,
                upper: lower + width,
                count,
            }
        })
        .collect()
}

/// Readings violating `rule`, in their original order.
///
/// A sensor type without a rule never raises alerts.
pub fn exceedances(readings: &[Reading], rule: Option<&ThresholdRule>) -> Vec<Reading> {
    match rule {
        Some(rule) => readings
            .iter()
            .filter(|r| rule.is_violated_by(r.value))
            .cloned()
            .collect(),
        None => Vec::new(),
    }
}

/// Count of each distinct value per sensor id, ordered by sensor id then value.
pub fn value_histogram(readings: &[Reading]) -> Vec<ValueCount> {
    let mut out: Vec<ValueCount> = Vec::new();
    for (sensor_id, series) in group_by_sensor(readings) {
        let mut values: Vec<f64> = series.iter().map(|r| r.value).collect();
        values.sort_by(f64::total_cmp);

        for value in values {
            if let Some(last) = out
                .last_mut()
                .filter(|last| last.sensor_id == sensor_id && last.value == value)
            {
                last.count += 1;
                continue;
            }
            out.push(ValueCount { sensor_id, value, count: 1 });
        }
    }
    out
}

fn group_by_sensor(readings: &[Reading]) -> BTreeMap<Option<i16>, Vec<&Reading>> {
    let mut groups: BTreeMap<Option<i16>, Vec<&Reading>> = BTreeMap::new();
    for reading in readings {
        groups.entry(reading.sensor_id).or_default().push(reading);
    }
    groups
}

/// Kind of derived view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewKind {
    MovingAverage,
    Distribution,
    Threshold,
    Histogram,
}

impl Display for ViewKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ViewKind::MovingAverage => write!(f, "moving average"),
            ViewKind::Distribution => write!(f, "distribution"),
            ViewKind::Threshold => write!(f, "threshold exceedance"),
            ViewKind::Histogram => write!(f, "value histogram"),
        }
    }
}

/// Result rows of a derived view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ViewRows {
    MovingAverage(Vec<SeriesAverage>),
    Distribution(Vec<Bin>),
    Threshold(Vec<Reading>),
    Histogram(Vec<ValueCount>),
}

/// A view computed on demand for one filter. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedView {
    pub filter: SeriesFilter,
    pub rows: ViewRows,
}

impl DerivedView {
    pub fn kind(&self) -> ViewKind {
        match self.rows {
            ViewRows::MovingAverage(_) => ViewKind::MovingAverage,
            ViewRows::Distribution(_) => ViewKind::Distribution,
            ViewRows::Threshold(_) => ViewKind::Threshold,
            ViewRows::Histogram(_) => ViewKind::Histogram,
        }
    }

    /// True when the view has nothing to show.
    pub fn is_empty(&self) -> bool {
        match &self.rows {
            ViewRows::MovingAverage(series) => series.iter().all(|s| s.points.is_empty()),
            ViewRows::Distribution(bins) => bins.is_empty(),
            ViewRows::Threshold(readings) => readings.is_empty(),
            ViewRows::Histogram(counts) => counts.is_empty(),
        }
    }

    /// Flattens the view into a single Arrow batch for tabular consumers.
    pub fn to_record_batch(&self) -> Result<RecordBatch, ArrowError> {
        match &self.rows {
            ViewRows::MovingAverage(series) => {
                let points = || series.iter().flat_map(|s| s.points.iter().map(move |p| (s.sensor_id, p)));
                build_batch(vec![
                    ("sensor_id", Arc::new(points().map(|(id, _)| id).collect::<Int16Array>()) as ArrayRef),
                    ("timestamp", timestamps(points().map(|(_, p)| p.timestamp))),
                    ("value", Arc::new(Float64Array::from_iter_values(points().map(|(_, p)| p.value))) as ArrayRef),
                    ("moving_average", Arc::new(points().map(|(_, p)| p.average).collect::<Float64Array>()) as ArrayRef),
                ])
            }
            ViewRows::Distribution(bins) => build_batch(vec![
                ("sensor_id", Arc::new(bins.iter().map(|b| b.sensor_id).collect::<Int16Array>()) as ArrayRef),
                ("lower", Arc::new(Float64Array::from_iter_values(bins.iter().map(|b| b.lower))) as ArrayRef),
                ("upper", Arc::new(Float64Array::from_iter_values(bins.iter().map(|b| b.upper))) as ArrayRef),
                ("count", Arc::new(UInt64Array::from_iter_values(bins.iter().map(|b| b.count))) as ArrayRef),
            ]),
            ViewRows::Threshold(readings) => crate::reading::create_record_batch(readings),
            ViewRows::Histogram(counts) => build_batch(vec![
                ("sensor_id", Arc::new(counts.iter().map(|c| c.sensor_id).collect::<Int16Array>()) as ArrayRef),
                ("value", Arc::new(Float64Array::from_iter_values(counts.iter().map(|c| c.value))) as ArrayRef),
                ("count", Arc::new(UInt64Array::from_iter_values(counts.iter().map(|c| c.count))) as ArrayRef),
            ]),
        }
    }
}

fn timestamps(values: impl Iterator<Item = DateTime<Utc>>) -> ArrayRef {
    Arc::new(TimestampMicrosecondArray::from_iter_values(values.map(|t| t.timestamp_micros())).with_timezone("UTC"))
}

const NULLABLE_COLUMNS: [&str; 2] = ["sensor_id", "moving_average"];

fn build_batch(columns: Vec<(&str, ArrayRef)>) -> Result<RecordBatch, ArrowError> {
    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, array)| Field::new(*name, array.data_type().clone(), NULLABLE_COLUMNS.contains(name)))
        .collect();
    let arrays = columns.into_iter().map(|(_, array)| array).collect();
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
}
