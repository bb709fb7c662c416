//! Ownership of all runs and the run lifecycle state machine.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use super::run::{Run, RunId, RunMetadata};
use crate::parser::record::{CounterInfos, TelemetryRecord};
use crate::transport::message::{DataRecord, Message};

/// Aggregator shared between the ingest task (sole writer) and readers.
pub type SharedAggregator = Arc<RwLock<RunAggregator>>;

/// Per-message ingestion failures. None of them are fatal.
#[derive(Error, Debug, PartialEq)]
pub enum IngestError {
    #[error("no active run, dropped {records} record(s)")]
    NoActiveRun { records: usize },

    #[error("transmission begin while run {live} is live")]
    DuplicateBegin { live: RunId },

    #[error("transmission end without a live run")]
    NoLiveRun,
}

/// Effect of an accepted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    RunStarted(RunId),
    RunFinalized(RunId),
    Records { stored: usize },
    CounterInfos { count: usize },
}

/// Holds every run of the process and routes records to the live one.
///
/// State per run: `NoRun -> Live -> Finalized`. At most one run is live.
pub struct RunAggregator {
    runs: Vec<Run>,
    live: Option<usize>,
    last: Option<usize>,
    next_id: RunId,
    dropped: u64,
}

impl IngestError {
    /// Short label for metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::NoActiveRun { .. } => "no_active_run",
            Self::DuplicateBegin { .. } => "duplicate_begin",
            Self::NoLiveRun => "no_live_run",
        }
    }
}

impl Default for RunAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl RunAggregator {
    pub fn new() -> Self {
        Self {
            runs: Vec::new(),
            live: None,
            last: None,
            next_id: 0,
            dropped: 0,
        }
    }

    /// Wrap for sharing with readers.
    pub fn into_shared(self) -> SharedAggregator {
        Arc::new(RwLock::new(self))
    }

    /// Append imported runs as finalized runs. New ids continue after the
    /// highest imported id.
    pub fn import(&mut self, runs: Vec<Run>) {
        for mut run in runs {
            if !run.is_finalized() {
                let start = run.start();
                run.finalize(start);
            }
            self.next_id = self.next_id.max(run.id() + 1);
            self.runs.push(run);
            self.last = Some(self.runs.len() - 1);
        }
    }

    /// Apply one transport message.
    pub fn handle(&mut self, msg: Message) -> Result<Applied, IngestError> {
        match msg {
            Message::TransmissionBegin(ts) => self.begin(ts).map(Applied::RunStarted),
            Message::TransmissionEnd(ts) => self.end(ts),
            Message::CounterInfos(infos) => self.set_counter_infos(infos),
            Message::RegularData(records) => self.add_records(records),
        }
    }

    /// Start a new live run.
    pub fn begin(&mut self, timestamp: f64) -> Result<RunId, IngestError> {
        if let Some(live) = self.current_run() {
            return Err(IngestError::DuplicateBegin { live: live.id() });
        }

        let id = self.next_id;
        self.next_id += 1;
        self.runs.push(Run::new(id, timestamp));
        self.live = Some(self.runs.len() - 1);

        info!(run_id = id, start = timestamp, "run started");

        Ok(id)
    }

    /// Finalize the live run. Exporting it is up to the caller, outside the
    /// write lock.
    pub fn end(&mut self, timestamp: f64) -> Result<Applied, IngestError> {
        let idx = self.live.take().ok_or(IngestError::NoLiveRun)?;
        self.last = Some(idx);

        let Some(run) = self.runs.get_mut(idx) else {
            return Err(IngestError::NoLiveRun);
        };
        run.finalize(timestamp);
        let id = run.id();

        info!(
            run_id = id,
            end = timestamp,
            samples = run.series().len(),
            tasks = run.tasks().len(),
            "run finalized",
        );

        Ok(Applied::RunFinalized(id))
    }

    pub fn set_counter_infos(&mut self, infos: CounterInfos) -> Result<Applied, IngestError> {
        let count = infos.len();
        let run = self.live_mut().ok_or(IngestError::NoActiveRun { records: count })?;
        run.set_counter_infos(infos);
        Ok(Applied::CounterInfos { count })
    }

    /// Store a batch in the live run, in order.
    pub fn add_records(&mut self, records: Vec<DataRecord>) -> Result<Applied, IngestError> {
        let count = records.len();
        let Some(run) = self.live.and_then(|i| self.runs.get_mut(i)) else {
            self.dropped += count as u64;
            return Err(IngestError::NoActiveRun { records: count });
        };

        for record in records {
            match TelemetryRecord::from(record) {
                TelemetryRecord::CounterSample(s) => {
                    run.add_sample(&s);
                }
                TelemetryRecord::TaskEvent(t) => run.add_task(&t),
                TelemetryRecord::PlainLine { text } => {
                    debug!(run_id = run.id(), line = %text, "program output");
                    run.add_plain_line(text);
                }
                TelemetryRecord::CounterDescription(_) | TelemetryRecord::RunBoundary { .. } => {}
            }
        }

        Ok(Applied::Records { stored: count })
    }

    fn live_mut(&mut self) -> Option<&mut Run> {
        self.live.and_then(|i| self.runs.get_mut(i))
    }

    /// All runs in creation order.
    pub fn list_runs(&self) -> &[Run] {
        &self.runs
    }

    pub fn run(&self, id: RunId) -> Option<&Run> {
        self.runs.iter().find(|r| r.id() == id)
    }

    /// The live run, if any.
    pub fn current_run(&self) -> Option<&Run> {
        self.live.and_then(|i| self.runs.get(i))
    }

    /// The most recently finalized run.
    pub fn last_finalized_run(&self) -> Option<&Run> {
        self.last.and_then(|i| self.runs.get(i))
    }

    pub fn run_metadata(&self, id: RunId) -> Option<RunMetadata> {
        self.run(id).map(Run::metadata)
    }

    /// Records dropped because no run was live.
    pub fn dropped_records(&self) -> u64 {
        self.dropped
    }
}
