use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// RecordKind identifies the variant of a [`TelemetryRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    CounterSample = 0,
    TaskEvent = 1,
    CounterDescription = 2,
    PlainLine = 3,
    RunBoundary = 4,
}

/// Number of RecordKind variants, used for array sizing.
pub const RECORD_KIND_CARDINALITY: usize = 5;

impl RecordKind {
    /// All kinds in discriminant order.
    pub const ALL: [RecordKind; RECORD_KIND_CARDINALITY] = [
        Self::CounterSample,
        Self::TaskEvent,
        Self::CounterDescription,
        Self::PlainLine,
        Self::RunBoundary,
    ];

    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CounterSample => "counter_sample",
            Self::TaskEvent => "task_event",
            Self::CounterDescription => "counter_description",
            Self::PlainLine => "plain_line",
            Self::RunBoundary => "run_boundary",
        }
    }

    /// Convert from a raw u8 value.
    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(usize::from(v)).copied()
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of a counter sample.
///
/// Most counters report a float. Some report composite values such as
/// `12:4:7` or non-numeric text, which are kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CounterValue {
    Number(f64),
    Text(String),
}

impl CounterValue {
    /// Parses a raw field, falling back to text when it is not a float.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<f64>() {
            Ok(v) if v.is_finite() => Self::Number(v),
            _ => Self::Text(trimmed.to_string()),
        }
    }

    /// Returns the numeric value, if any.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            Self::Text(_) => None,
        }
    }
}

impl fmt::Display for CounterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for CounterValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

/// A single performance counter reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterSample {
    /// `<object>/<counter-path>`, e.g. `threads/count/instantaneous/active`.
    pub counter_name: String,
    /// Contents of the `{...}` instance block, verbatim.
    pub instance: String,
    /// Counter parameters following `@`, if present.
    pub parameters: Option<String>,
    pub sequence_number: u64,
    pub timestamp: f64,
    pub timestamp_unit: String,
    pub value: CounterValue,
    pub value_unit: Option<String>,
}

impl CounterSample {
    /// Series name: the counter name with `@parameters` appended when present.
    pub fn series_name(&self) -> String {
        match &self.parameters {
            Some(p) if !p.is_empty() => format!("{}@{}", self.counter_name, p),
            _ => self.counter_name.clone(),
        }
    }
}

/// One executed task reported by a `task_data,...` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub locality: String,
    pub worker_id: String,
    pub task_name: String,
    pub start: f64,
    pub end: f64,
}

/// Help text, type and version printed for one counter by
/// `--hpx:list-counter-infos`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDescription {
    pub name: String,
    pub fields: BTreeMap<String, String>,
}

/// Counter descriptions keyed by counter full name.
pub type CounterInfos = BTreeMap<String, CounterDescription>;

/// Begin or end of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryKind {
    Begin,
    End,
}

/// Typed record produced by the line classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryRecord {
    CounterSample(CounterSample),
    TaskEvent(TaskEvent),
    CounterDescription(CounterDescription),
    PlainLine { text: String },
    RunBoundary { boundary: BoundaryKind, timestamp: f64 },
}

impl TelemetryRecord {
    /// Returns the kind of this record.
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::CounterSample(_) => RecordKind::CounterSample,
            Self::TaskEvent(_) => RecordKind::TaskEvent,
            Self::CounterDescription(_) => RecordKind::CounterDescription,
            Self::PlainLine { .. } => RecordKind::PlainLine,
            Self::RunBoundary { .. } => RecordKind::RunBoundary,
        }
    }

    /// Creates a plain line record.
    pub fn plain(text: impl Into<String>) -> Self {
        Self::PlainLine { text: text.into() }
    }
}
