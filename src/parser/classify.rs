//! Line classification for HPX program output.
//!
//! The monitored program interleaves its own stdout with performance counter
//! records (`--hpx:print-counter`), counter description blocks
//! (`--hpx:list-counter-infos`) and task timing lines. There is no formal
//! grammar for this mix, so [`LineClassifier`] is a small state machine fed
//! one line at a time, in stream order.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use super::record::{
    CounterDescription, CounterInfos, CounterSample, CounterValue, TaskEvent, TelemetryRecord,
};

/// Official delimiter of counter-info blocks.
pub const INFO_SEPARATOR: &str =
    "------------------------------------------------------------------------------";

/// Banner printed before the counter-info block.
pub const INFO_BANNER: &str = "Information about available counter instances";

/// Literal first field of task lines.
pub const TASK_PREFIX: &str = "task_data";

/// `"?/<object>{<full-instance>}/<counter-path>@<params>?"?`
const COUNTER_PATTERN: &str =
    r#""?/([a-zA-Z_][a-zA-Z_0-9\-]*)\{(.*)\}/([a-zA-Z_0-9\-/]+)@?([a-zA-Z_0-9\-]+)?"?"#;

static COUNTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{COUNTER_PATTERN}")).expect("counter record regex")
});

/// Reasons a line is not a well-formed telemetry record.
///
/// These never escape the classifier as errors: the line degrades to
/// [`TelemetryRecord::PlainLine`].
#[derive(Error, Debug, PartialEq)]
pub enum ParseMismatch {
    #[error("line does not match the counter record grammar")]
    NotCounterRecord,

    #[error("counter record has {count} trailing fields, expected 5 or 6")]
    FieldCount { count: usize },

    #[error("invalid sequence number {raw:?}")]
    InvalidSequence { raw: String },

    #[error("invalid timestamp {raw:?}")]
    InvalidTimestamp { raw: String },

    #[error("line is not a task record")]
    NotTaskRecord,

    #[error("invalid task time {raw:?}")]
    InvalidTaskTime { raw: String },
}

/// Result of classifying one line.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// Typed record for the line.
    pub record: TelemetryRecord,
    /// Whether the line belongs to HPX telemetry output (samples, counter
    /// listings, counter-info blocks, task lines) rather than program output.
    pub is_telemetry: bool,
    /// Counter descriptions collected by the info block that this line closed.
    /// Emitted once, at the first counter record after the block.
    pub flushed_infos: Option<CounterInfos>,
}

impl Classification {
    fn telemetry(record: TelemetryRecord) -> Self {
        Self {
            record,
            is_telemetry: true,
            flushed_infos: None,
        }
    }

    fn program_output(line: &str) -> Self {
        Self {
            record: TelemetryRecord::plain(line),
            is_telemetry: false,
            flushed_infos: None,
        }
    }
}

/// Shape of a recent line, as seen by the end-of-block heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineShape {
    Separator,
    Blank,
    Other,
}

impl LineShape {
    fn of(line: &str) -> Self {
        if line == INFO_SEPARATOR {
            Self::Separator
        } else if line.is_empty() {
            Self::Blank
        } else {
            Self::Other
        }
    }
}

/// Fixed-size window over the shapes of the last three lines.
#[derive(Debug, Clone, Copy)]
struct TrailingWindow {
    shapes: [Option<LineShape>; 3],
}

impl TrailingWindow {
    fn new() -> Self {
        Self { shapes: [None; 3] }
    }

    fn push(&mut self, shape: LineShape) {
        self.shapes.rotate_left(1);
        self.shapes[2] = Some(shape);
    }
}

/// Heuristic end of a counter-info block: separator, blank line, then
/// anything but another separator.
///
/// This is not part of any grammar; it matches how HPX happens to print the
/// block and may need adjusting if that output changes.
fn is_info_block_end(window: &TrailingWindow) -> bool {
    matches!(
        window.shapes,
        [
            Some(LineShape::Separator),
            Some(LineShape::Blank),
            Some(LineShape::Blank | LineShape::Other)
        ]
    )
}

/// Stateful classifier turning raw program output into typed records.
#[derive(Debug)]
pub struct LineClassifier {
    /// Inside a `--hpx:list-counter-infos` block.
    in_info_block: bool,
    /// Description currently being filled (between `fullname:` and `version:`).
    current: Option<CounterDescription>,
    descriptions: CounterInfos,
    window: TrailingWindow,
}

impl Default for LineClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl LineClassifier {
    /// Create a classifier with empty state.
    pub fn new() -> Self {
        Self {
            in_info_block: false,
            current: None,
            descriptions: CounterInfos::new(),
            window: TrailingWindow::new(),
        }
    }

    /// Whether a counter description is currently being collected.
    ///
    /// Becomes true at a `fullname:` line inside an info block and false at
    /// the `version:` line closing that description.
    pub fn collecting_counter_infos(&self) -> bool {
        self.current.is_some()
    }

    /// Whether the classifier is inside a counter-info block.
    pub fn in_counter_info_block(&self) -> bool {
        self.in_info_block
    }

    /// Descriptions collected so far and not yet flushed.
    pub fn pending_descriptions(&self) -> &CounterInfos {
        &self.descriptions
    }

    /// Drains descriptions that were never flushed by a counter record.
    pub fn take_descriptions(&mut self) -> Option<CounterInfos> {
        if self.descriptions.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.descriptions))
        }
    }

    /// Classify one line of program output.
    pub fn classify(&mut self, raw_line: &str) -> Classification {
        let line = raw_line.trim();
        self.window.push(LineShape::of(line));

        if let Some(end) = counter_match_end(line) {
            let record = match parse_counter_fields(line, end) {
                Ok(sample) => TelemetryRecord::CounterSample(sample),
                Err(e) => {
                    tracing::trace!(error = %e, "counter listing line");
                    TelemetryRecord::plain(line)
                }
            };

            // Counter-info printing ends at the first counter record.
            let mut classification = Classification::telemetry(record);
            if self.in_info_block || !self.descriptions.is_empty() {
                self.in_info_block = false;
                self.current = None;
                classification.flushed_infos = self.take_descriptions();
            }
            return classification;
        }

        if self.in_info_block && is_info_block_end(&self.window) {
            self.in_info_block = false;
            self.current = None;
        }

        if line == INFO_BANNER {
            self.in_info_block = true;
            return Classification::telemetry(TelemetryRecord::plain(line));
        }

        if self.in_info_block {
            if let Some(record) = self.collect_info_field(line) {
                return Classification::telemetry(record);
            }
            // Separators, blank lines and headers inside the block.
            return Classification::telemetry(TelemetryRecord::plain(line));
        }

        match parse_task_line(line) {
            Ok(task) => Classification::telemetry(TelemetryRecord::TaskEvent(task)),
            Err(ParseMismatch::NotTaskRecord) => Classification::program_output(line),
            Err(e) => {
                tracing::trace!(error = %e, "malformed task line");
                Classification::telemetry(TelemetryRecord::plain(line))
            }
        }
    }

    /// Handles a `key: value` line inside an info block.
    fn collect_info_field(&mut self, line: &str) -> Option<TelemetryRecord> {
        let (key, value) = line.split_once(':')?;
        let key = key.trim();
        let value = value.trim();

        if key == "fullname" {
            if !COUNTER_RE.is_match(value) {
                return None;
            }
            self.current = Some(CounterDescription {
                name: value.to_string(),
                fields: Default::default(),
            });
            return Some(TelemetryRecord::plain(line));
        }

        if !matches!(key, "helptext" | "type" | "version") {
            return None;
        }
        let current = self.current.as_mut()?;
        current.fields.insert(key.to_string(), value.to_string());

        if key != "version" {
            return Some(TelemetryRecord::plain(line));
        }

        let done = self.current.take()?;
        self.descriptions.insert(done.name.clone(), done.clone());
        Some(TelemetryRecord::CounterDescription(done))
    }
}

/// Returns the byte offset where the counter grammar match ends, if the
/// line starts with a counter name.
fn counter_match_end(line: &str) -> Option<usize> {
    COUNTER_RE.find(line).map(|m| m.end())
}

/// Parse a full counter record line.
pub fn parse_counter_line(line: &str) -> Result<CounterSample, ParseMismatch> {
    let line = line.trim();
    let end = counter_match_end(line).ok_or(ParseMismatch::NotCounterRecord)?;
    parse_counter_fields(line, end)
}

/// Parses the comma-separated fields that follow the counter name.
///
/// The instance block may itself contain commas, so only the text after the
/// grammar match is split.
fn parse_counter_fields(line: &str, match_end: usize) -> Result<CounterSample, ParseMismatch> {
    let caps = COUNTER_RE
        .captures(line)
        .ok_or(ParseMismatch::NotCounterRecord)?;

    let rest = line.get(match_end..).unwrap_or("");
    let fields: Vec<&str> = rest.split(',').collect();
    if fields.len() != 5 && fields.len() != 6 {
        return Err(ParseMismatch::FieldCount {
            count: fields.len(),
        });
    }

    let object = caps.get(1).map_or("", |m| m.as_str());
    let instance = caps.get(2).map_or("", |m| m.as_str());
    let counter_path = caps.get(3).map_or("", |m| m.as_str());
    let parameters = caps.get(4).map(|m| m.as_str().to_string());

    let seq_raw = fields[1].trim();
    let sequence_number = seq_raw
        .parse::<u64>()
        .map_err(|_| ParseMismatch::InvalidSequence {
            raw: seq_raw.to_string(),
        })?;

    let ts_raw = fields[2].trim();
    let timestamp = ts_raw
        .parse::<f64>()
        .ok()
        .filter(|ts| ts.is_finite())
        .ok_or_else(|| ParseMismatch::InvalidTimestamp {
            raw: ts_raw.to_string(),
        })?;

    let value_unit = fields
        .get(5)
        .map(|u| u.trim())
        .filter(|u| !u.is_empty())
        .map(str::to_string);

    Ok(CounterSample {
        counter_name: format!("{object}/{counter_path}"),
        instance: instance.to_string(),
        parameters,
        sequence_number,
        timestamp,
        timestamp_unit: fields[3].trim().to_string(),
        value: CounterValue::parse(fields[4]),
        value_unit,
    })
}

/// Parse a `task_data,<locality>,<worker>,<name>,<start>,<end>` line.
pub fn parse_task_line(line: &str) -> Result<TaskEvent, ParseMismatch> {
    let line = line.trim();
    if line.split(',').next().map(str::trim) != Some(TASK_PREFIX) {
        return Err(ParseMismatch::NotTaskRecord);
    }

    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() != 6 {
        return Err(ParseMismatch::NotTaskRecord);
    }

    // Non-finite times have no JSON encoding.
    let parse_time = |raw: &str| {
        raw.trim()
            .parse::<f64>()
            .ok()
            .filter(|t| t.is_finite())
            .ok_or_else(|| ParseMismatch::InvalidTaskTime {
                raw: raw.to_string(),
            })
    };

    Ok(TaskEvent {
        locality: fields[1].trim().to_string(),
        worker_id: fields[2].trim().to_string(),
        task_name: fields[3].trim().to_string(),
        start: parse_time(fields[4])?,
        end: parse_time(fields[5])?,
    })
}
