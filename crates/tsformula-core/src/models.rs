//! Shared typed models used across the parser, interpreter and store layers.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Parse an ISO-8601-ish date or datetime (no offset) into a naive
/// timestamp. A bare date means midnight.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    for fmt in TIMESTAMP_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

// ---------------------------------------------------------------------------
// Window
// ---------------------------------------------------------------------------

/// Inclusive value-date bounds of a query. A missing bound is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub from: Option<NaiveDateTime>,
    pub to: Option<NaiveDateTime>,
}

impl Window {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(from: NaiveDateTime, to: NaiveDateTime) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        self.from.map_or(true, |f| ts >= f) && self.to.map_or(true, |t| ts <= t)
    }

    /// Narrow this window by another one (tightest bound wins).
    pub fn intersect(&self, other: &Window) -> Window {
        let from = match (self.from, other.from) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let to = match (self.to, other.to) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Window { from, to }
    }
}

// ---------------------------------------------------------------------------
// Series options (fill policy, limit, weight)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillMethod {
    Forward,
    Backward,
}

/// How a leaf substitutes its missing points once aligned with siblings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FillPolicy {
    Value(f64),
    Methods(Vec<FillMethod>),
}

impl FillPolicy {
    /// Parse the `#:fill` string form: `"ffill"`, `"bfill"`, a comma list of
    /// those, or a number.
    pub fn parse(text: &str) -> Option<FillPolicy> {
        if let Ok(v) = text.trim().parse::<f64>() {
            return Some(FillPolicy::Value(v));
        }
        let mut methods = Vec::new();
        for part in text.split(',') {
            match part.trim() {
                "ffill" | "pad" => methods.push(FillMethod::Forward),
                "bfill" | "backfill" => methods.push(FillMethod::Backward),
                _ => return None,
            }
        }
        if methods.is_empty() {
            None
        } else {
            Some(FillPolicy::Methods(methods))
        }
    }

    /// True when the policy only looks at the timestamp being filled.
    pub fn is_pointwise(&self) -> bool {
        matches!(self, FillPolicy::Value(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesOptions {
    pub fill: Option<FillPolicy>,
    pub limit: Option<usize>,
    pub weight: Option<f64>,
}

// ---------------------------------------------------------------------------
// Series
// ---------------------------------------------------------------------------

/// A time-indexed sequence of defined values.
///
/// Missing points are simply absent; NaN is never stored. The options travel
/// with the series through scalar operators and are consumed by combinators.
/// Equality compares the points only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Series {
    points: BTreeMap<NaiveDateTime, f64>,
    #[serde(skip)]
    options: SeriesOptions,
}

impl PartialEq for Series {
    fn eq(&self, other: &Self) -> bool {
        self.points == other.points
    }
}

impl Series {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_points<I>(points: I) -> Self
    where
        I: IntoIterator<Item = (NaiveDateTime, f64)>,
    {
        let mut series = Series::new();
        for (ts, value) in points {
            series.insert(ts, value);
        }
        series
    }

    /// Insert a point; NaN means "missing" and removes the timestamp.
    pub fn insert(&mut self, ts: NaiveDateTime, value: f64) {
        if value.is_nan() {
            self.points.remove(&ts);
        } else {
            self.points.insert(ts, value);
        }
    }

    pub fn get(&self, ts: &NaiveDateTime) -> Option<f64> {
        self.points.get(ts).copied()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NaiveDateTime, f64)> + '_ {
        self.points.iter().map(|(k, v)| (*k, *v))
    }

    pub fn index(&self) -> impl Iterator<Item = NaiveDateTime> + '_ {
        self.points.keys().copied()
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.values().copied().collect()
    }

    pub fn options(&self) -> &SeriesOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut SeriesOptions {
        &mut self.options
    }

    pub fn with_options(mut self, options: SeriesOptions) -> Self {
        self.options = options;
        self
    }

    /// Apply `f` to every defined value, keeping index and options. Points
    /// mapped to NaN disappear.
    pub fn map_values(&self, f: impl Fn(f64) -> f64) -> Series {
        let mut out = Series::from_points(self.iter().map(|(ts, v)| (ts, f(v))));
        out.options = self.options.clone();
        out
    }

    pub fn retain(&mut self, mut keep: impl FnMut(NaiveDateTime, f64) -> bool) {
        self.points.retain(|ts, v| keep(*ts, *v));
    }

    /// Keep only the points inside `window`.
    pub fn restrict(&mut self, window: &Window) {
        self.retain(|ts, _| window.contains(ts));
    }

    /// Drop the last `n` points.
    pub fn prune_last(&mut self, n: usize) {
        for _ in 0..n {
            if self.points.pop_last().is_none() {
                break;
            }
        }
    }

    pub fn first(&self) -> Option<(NaiveDateTime, f64)> {
        self.points.first_key_value().map(|(k, v)| (*k, *v))
    }

    pub fn last(&self) -> Option<(NaiveDateTime, f64)> {
        self.points.last_key_value().map(|(k, v)| (*k, *v))
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Result of evaluating any expression node.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Timestamp(NaiveDateTime),
    Series(Series),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Timestamp(_) => "timestamp",
            Value::Series(_) => "series",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_series(&self) -> Option<&Series> {
        match self {
            Value::Series(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_series(self) -> Option<Series> {
        match self {
            Value::Series(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", if *b { "#t" } else { "#f" }),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Timestamp(ts) => write!(f, "{ts}"),
            Value::Series(s) => write!(f, "<series of {} points>", s.len()),
        }
    }
}

// ---------------------------------------------------------------------------
// Series metadata
// ---------------------------------------------------------------------------

/// Metadata of a stored series, as reported by the primary store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesMeta {
    pub tzaware: bool,
    pub index_type: String,
    pub value_type: String,
}

impl Default for SeriesMeta {
    fn default() -> Self {
        Self {
            tzaware: false,
            index_type: "datetime64[ns]".to_string(),
            value_type: "float64".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// A row of the `formula` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaRecord {
    pub id: i64,
    pub name: String,
    pub text: String,
    pub metadata: serde_json::Value,
    pub content_hash: String,
}

/// A row of the `group_formula` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupFormulaRecord {
    pub id: i64,
    pub name: String,
    pub text: String,
    pub metadata: serde_json::Value,
}

/// A row of the `group_binding` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupBindingRecord {
    pub id: i64,
    pub groupname: String,
    pub seriesname: String,
    pub binding: serde_json::Value,
    pub metadata: serde_json::Value,
}
