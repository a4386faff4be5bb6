// ============================================================================
// SERIES PROCESSING
// ============================================================================
// Data points returned by connectors and the functions applied to them on
// their way to the client:
// - normalization onto a common time grid (consolidation + interpolation)
// - group operators (average, sum)
// - scaling and summaries (min/max/avg/last + percentiles)
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::SeriesError;

/// Largest run of empty buckets filled by linear interpolation.
pub const MAX_INTERPOLATION_GAP: usize = 1;

// ----------------------------------------------------------------------------
// Core Types
// ----------------------------------------------------------------------------

/// A single sample. Missing values are NaN and serialize as `null`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub time: DateTime<Utc>,
    pub value: f64,
}

impl Point {
    pub fn new(time: DateTime<Utc>, value: f64) -> Self {
        Self { time, value }
    }

    /// Build a point from a UNIX timestamp in seconds.
    pub fn from_unix(secs: i64, value: f64) -> Option<Self> {
        Utc.timestamp_opt(secs, 0)
            .single()
            .map(|time| Self { time, value })
    }
}

impl Serialize for Point {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.time.timestamp())?;
        tuple.serialize_element(&finite(self.value))?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for Point {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PointVisitor;

        impl<'de> Visitor<'de> for PointVisitor {
            type Value = Point;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a [timestamp, value] pair")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Point, A::Error> {
                let secs: f64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let value: Option<f64> = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                Point::from_unix(secs as i64, value.unwrap_or(f64::NAN))
                    .ok_or_else(|| de::Error::custom("timestamp out of range"))
            }
        }

        deserializer.deserialize_tuple(2, PointVisitor)
    }
}

fn finite(value: f64) -> Option<f64> {
    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}

fn serialize_summary<S: Serializer>(
    summary: &BTreeMap<String, f64>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_map(summary.iter().map(|(k, v)| (k, finite(*v))))
}

fn deserialize_summary<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<String, f64>, D::Error> {
    let raw: BTreeMap<String, Option<f64>> = Deserialize::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(k, v)| (k, v.unwrap_or(f64::NAN)))
        .collect())
}

/// A named time series, optionally summarized.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Series {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub points: Vec<Point>,

    #[serde(
        default,
        serialize_with = "serialize_summary",
        deserialize_with = "deserialize_summary"
    )]
    pub summary: BTreeMap<String, f64>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

impl Series {
    pub fn new(name: impl Into<String>, points: Vec<Point>) -> Self {
        Self {
            name: name.into(),
            points,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Multiply every known value by `factor`.
    pub fn scale(&mut self, factor: f64) {
        for point in self.points.iter_mut().filter(|p| !p.value.is_nan()) {
            point.value *= factor;
        }
    }

    /// Replace missing values with zero.
    pub fn zero_nulls(&mut self) {
        for point in self.points.iter_mut().filter(|p| p.value.is_nan()) {
            point.value = 0.0;
        }
    }

    /// Compute `min`, `max`, `avg`, `last` and the requested percentiles.
    ///
    /// `last` is the value of the final point, so it is NaN when the series
    /// ends on a gap.
    pub fn summarize(&mut self, percentiles: &[f64]) {
        let mut set: Vec<f64> = self
            .points
            .iter()
            .map(|p| p.value)
            .filter(|v| !v.is_nan())
            .collect();

        let (min, max, avg) = if set.is_empty() {
            (f64::NAN, f64::NAN, f64::NAN)
        } else {
            let min = set.iter().copied().fold(f64::INFINITY, f64::min);
            let max = set.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            (min, max, set.iter().sum::<f64>() / set.len() as f64)
        };

        self.summary.insert("min".into(), min);
        self.summary.insert("max".into(), max);
        self.summary.insert("avg".into(), avg);
        self.summary.insert(
            "last".into(),
            self.points.last().map(|p| p.value).unwrap_or(f64::NAN),
        );

        if set.is_empty() {
            return;
        }

        set.sort_by(|a, b| a.total_cmp(b));
        for p in percentiles {
            self.summary.insert(percentile_key(*p), percentile(&set, *p));
        }
    }
}

/// Summary key of a percentile (`20th`, `99.9th`).
pub fn percentile_key(p: f64) -> String {
    format!("{}th", p)
}

/// Linear-interpolation rank percentile over a sorted, NaN-free set.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    let size = sorted.len();
    if size == 0 {
        return f64::NAN;
    }

    let rank = (p / 100.0) * (size as f64 + 1.0);
    if rank < 1.0 {
        return sorted[0];
    }
    if rank >= size as f64 {
        return sorted[size - 1];
    }

    let index = rank.trunc() as usize;
    let fraction = rank - rank.trunc();
    let (low, high) = (sorted[index - 1], sorted[index]);
    (low + fraction * (high - low)).clamp(low, high)
}

// ----------------------------------------------------------------------------
// Consolidation & Operators
// ----------------------------------------------------------------------------

/// Reduction used to collapse the points falling into one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consolidation {
    #[default]
    Average,
    First,
    Last,
    Max,
    Min,
    Sum,
}

impl Consolidation {
    /// Reduce the known values of a bucket; NaN when none is known.
    pub fn reduce(&self, values: &[f64]) -> f64 {
        let mut known = values.iter().copied().filter(|v| !v.is_nan()).peekable();
        if known.peek().is_none() {
            return f64::NAN;
        }

        match self {
            Consolidation::Average => {
                let (sum, count) = known.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
                sum / count as f64
            }
            Consolidation::Sum => known.sum(),
            Consolidation::First => known.next().unwrap_or(f64::NAN),
            Consolidation::Last => known.last().unwrap_or(f64::NAN),
            Consolidation::Max => known.fold(f64::NEG_INFINITY, f64::max),
            Consolidation::Min => known.fold(f64::INFINITY, f64::min),
        }
    }
}

/// Operation combining the series of a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    #[default]
    None,
    Average,
    Sum,
}

impl Operator {
    pub fn is_none(&self) -> bool {
        matches!(self, Operator::None)
    }

    /// Combine normalized series into one, or `None` for `Operator::None`.
    pub fn apply(&self, series: &[Series]) -> Result<Option<Series>, SeriesError> {
        match self {
            Operator::None => Ok(None),
            Operator::Average => average(series).map(Some),
            Operator::Sum => sum(series).map(Some),
        }
    }
}

/// Point-wise mean ignoring missing values.
pub fn average(series: &[Series]) -> Result<Series, SeriesError> {
    combine(series, true)
}

/// Point-wise sum ignoring missing values.
pub fn sum(series: &[Series]) -> Result<Series, SeriesError> {
    combine(series, false)
}

fn combine(series: &[Series], mean: bool) -> Result<Series, SeriesError> {
    let filled: Vec<&Series> = series.iter().filter(|s| !s.is_empty()).collect();
    let Some(first) = filled.first() else {
        return Ok(Series::default());
    };

    let count = first.points.len();
    if filled.iter().any(|s| s.points.len() != count) {
        return Err(SeriesError::UnnormalizedSeries);
    }

    let points = (0..count)
        .map(|i| {
            let (total, contributors) = filled
                .iter()
                .map(|s| s.points[i].value)
                .filter(|v| !v.is_nan())
                .fold((0.0, 0usize), |(t, c), v| (t + v, c + 1));

            let value = match contributors {
                0 => f64::NAN,
                n if mean => total / n as f64,
                _ => total,
            };
            Point::new(first.points[i].time, value)
        })
        .collect();

    Ok(Series::new(String::new(), points))
}

// ----------------------------------------------------------------------------
// Normalization
// ----------------------------------------------------------------------------

/// Resample every series onto `sample` buckets spanning `[start, end]`.
///
/// Output timestamps are bucket centers. Points outside the window are
/// dropped and each bucket is reduced with `consolidation`. With
/// `interpolate`, gaps of at most `MAX_INTERPOLATION_GAP` buckets between two
/// known values are filled linearly.
pub fn normalize(
    series: &[Series],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    sample: usize,
    consolidation: Consolidation,
    interpolate: bool,
) -> Result<Vec<Series>, SeriesError> {
    if sample == 0 {
        return Err(SeriesError::InvalidSample { sample });
    }

    let span = end
        .signed_duration_since(start)
        .num_nanoseconds()
        .ok_or(SeriesError::InvalidWindow)?;
    let step = span / sample as i64;
    if step <= 0 {
        return Err(SeriesError::InvalidWindow);
    }

    let times: Vec<DateTime<Utc>> = (0..sample as i64)
        .map(|i| start + Duration::nanoseconds(step * i + step / 2))
        .collect();

    let mut result = Vec::with_capacity(series.len());
    for input in series {
        let mut buckets: Vec<Vec<f64>> = vec![Vec::new(); sample];

        for point in &input.points {
            if point.time < start || point.time > end {
                continue;
            }
            let Some(offset) = point.time.signed_duration_since(start).num_nanoseconds() else {
                continue;
            };
            let index = (offset / step) as usize;
            if index >= sample {
                continue;
            }
            buckets[index].push(point.value);
        }

        let mut values: Vec<f64> = buckets.iter().map(|b| consolidation.reduce(b)).collect();
        if interpolate {
            fill_gaps(&mut values, MAX_INTERPOLATION_GAP);
        }

        result.push(Series {
            name: input.name.clone(),
            points: times
                .iter()
                .zip(values)
                .map(|(time, value)| Point::new(*time, value))
                .collect(),
            summary: BTreeMap::new(),
            options: input.options.clone(),
        });
    }

    Ok(result)
}

fn fill_gaps(values: &mut [f64], max_gap: usize) {
    let mut last_known: Option<usize> = None;

    for i in 0..values.len() {
        if values[i].is_nan() {
            continue;
        }

        if let Some(prev) = last_known {
            let gap = i - prev - 1;
            if gap > 0 && gap <= max_gap {
                let chunk = (values[i] - values[prev]) / (gap + 1) as f64;
                for j in 1..=gap {
                    values[prev + j] = values[prev] + chunk * j as f64;
                }
            }
        }
        last_known = Some(i);
    }
}
