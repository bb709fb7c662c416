//! On-disk session layout.
//!
//! ```text
//! session.<epoch>/
//!   session_metadata.json      manifest: session id and one entry per collection
//!   counter_data.<id>.csv      one row per counter sample
//!   task_data.<id>.csv         one row per task event
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::parser::record::{CounterInfos, CounterValue};
use crate::store::instance::{InstanceId, SeriesInstance};
use crate::store::run::{Run, RunId};
use crate::store::series::SamplePoint;
use crate::store::tasks::TaskSpan;

/// Manifest file name inside a session directory.
pub const MANIFEST_FILE: &str = "session_metadata.json";

/// Errors raised while saving or loading sessions.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("manifest: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no {MANIFEST_FILE} in {0}")]
    MissingManifest(PathBuf),

    #[error("collection {id} not listed in {dir}")]
    UnknownCollection { dir: PathBuf, id: RunId },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One collection listed in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub id: RunId,
    pub start: f64,
    pub end: Option<f64>,
    #[serde(default, skip_serializing_if = "CounterInfos::is_empty")]
    pub counter_infos: CounterInfos,
}

/// Contents of `session_metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionManifest {
    pub session_id: String,
    pub created: String,
    #[serde(default)]
    pub collections: Vec<CollectionEntry>,
}

/// Row of `counter_data.<id>.csv`.
#[derive(Debug, Serialize, Deserialize)]
struct CounterRow {
    name: String,
    instance: String,
    locality: Option<String>,
    pool: Option<String>,
    thread: Option<String>,
    sequence_number: u64,
    timestamp: f64,
    timestamp_unit: String,
    value: String,
    value_unit: Option<String>,
}

/// Row of `task_data.<id>.csv`.
#[derive(Debug, Serialize, Deserialize)]
struct TaskRow {
    locality: String,
    worker_id: String,
    name: String,
    start: f64,
    end: f64,
}

pub fn counter_file(id: RunId) -> String {
    format!("counter_data.{id}.csv")
}

pub fn task_file(id: RunId) -> String {
    format!("task_data.{id}.csv")
}

/// Writes finalized runs into one session directory.
///
/// The directory is created on the first save.
#[derive(Debug)]
pub struct SessionWriter {
    dir: PathBuf,
    manifest: SessionManifest,
}

impl SessionWriter {
    /// New session `session.<epoch>` under `parent`.
    pub fn new(parent: &Path) -> Self {
        let now = chrono::Utc::now();
        let session_id = format!("session.{}", now.timestamp());
        Self {
            dir: parent.join(&session_id),
            manifest: SessionManifest {
                session_id,
                created: now.to_rfc3339(),
                collections: Vec::new(),
            },
        }
    }

    /// Continue an existing session, appending to its manifest.
    pub fn open(dir: &Path) -> Result<Self, PersistenceError> {
        Ok(Self {
            dir: dir.to_path_buf(),
            manifest: read_manifest(dir)?,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> &SessionManifest {
        &self.manifest
    }

    /// Export a run and record it in the manifest.
    pub fn save_run(&mut self, run: &Run) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;

        let samples = write_counters(&self.dir.join(counter_file(run.id())), run)?;
        let tasks = write_tasks(&self.dir.join(task_file(run.id())), run)?;

        let entry = CollectionEntry {
            id: run.id(),
            start: run.start(),
            end: run.end(),
            counter_infos: run.counter_descriptions().clone(),
        };
        match self.manifest.collections.iter_mut().find(|c| c.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.manifest.collections.push(entry),
        }
        self.write_manifest()?;

        info!(
            run_id = run.id(),
            samples,
            tasks,
            dir = %self.dir.display(),
            "run saved",
        );

        Ok(())
    }

    fn write_manifest(&self) -> Result<(), PersistenceError> {
        let path = self.dir.join(MANIFEST_FILE);
        let tmp = self.dir.join(format!("{MANIFEST_FILE}.tmp"));
        let body = serde_json::to_vec_pretty(&self.manifest)?;
        fs::write(&tmp, body).map_err(io_err(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_err(&path))?;
        Ok(())
    }
}

fn write_counters(path: &Path, run: &Run) -> Result<usize, PersistenceError> {
    let mut w = csv::Writer::from_path(path)?;
    let mut rows = 0;

    for (name, instance, points) in run.series().iter_series() {
        let id = instance.as_id();
        for p in points {
            w.serialize(CounterRow {
                name: name.to_string(),
                instance: instance.to_string(),
                locality: id.map(|i| i.locality.clone()),
                pool: id.and_then(|i| i.pool.clone()),
                thread: id.map(|i| i.worker.clone()),
                sequence_number: p.sequence_number,
                timestamp: p.timestamp,
                timestamp_unit: p.timestamp_unit.clone(),
                value: p.value.to_string(),
                value_unit: p.value_unit.clone(),
            })?;
            rows += 1;
        }
    }

    // Header-only file for runs without samples.
    if rows == 0 {
        w.write_record([
            "name",
            "instance",
            "locality",
            "pool",
            "thread",
            "sequence_number",
            "timestamp",
            "timestamp_unit",
            "value",
            "value_unit",
        ])?;
    }
    w.flush().map_err(io_err(path))?;
    Ok(rows)
}

fn write_tasks(path: &Path, run: &Run) -> Result<usize, PersistenceError> {
    let mut w = csv::Writer::from_path(path)?;
    let mut rows = 0;

    for (locality, worker, spans) in run.tasks().iter_workers() {
        for s in spans {
            w.serialize(TaskRow {
                locality: locality.to_string(),
                worker_id: worker.to_string(),
                name: s.task_name.clone(),
                start: s.start,
                end: s.end,
            })?;
            rows += 1;
        }
    }

    if rows == 0 {
        w.write_record(["locality", "worker_id", "name", "start", "end"])?;
    }
    w.flush().map_err(io_err(path))?;
    Ok(rows)
}

pub fn read_manifest(dir: &Path) -> Result<SessionManifest, PersistenceError> {
    let path = dir.join(MANIFEST_FILE);
    if !path.is_file() {
        return Err(PersistenceError::MissingManifest(dir.to_path_buf()));
    }
    let body = fs::read(&path).map_err(io_err(&path))?;
    Ok(serde_json::from_slice(&body)?)
}

/// Load every run listed in a session's manifest.
///
/// Rows are grouped by series and by worker and handed to the run in bulk,
/// so each group resolves its key and catalog entry once.
pub fn import_session(dir: &Path) -> Result<Vec<Run>, PersistenceError> {
    let manifest = read_manifest(dir)?;
    let runs = manifest
        .collections
        .iter()
        .map(|entry| load_run(dir, entry))
        .collect::<Result<Vec<_>, _>>()?;

    info!(
        session = %manifest.session_id,
        runs = runs.len(),
        "session imported",
    );

    Ok(runs)
}

/// Load a single collection of a session.
pub fn import_run(dir: &Path, id: RunId) -> Result<Run, PersistenceError> {
    let manifest = read_manifest(dir)?;
    let entry = manifest
        .collections
        .iter()
        .find(|c| c.id == id)
        .ok_or_else(|| PersistenceError::UnknownCollection {
            dir: dir.to_path_buf(),
            id,
        })?;
    load_run(dir, entry)
}

fn load_run(dir: &Path, entry: &CollectionEntry) -> Result<Run, PersistenceError> {
    let mut run = Run::new(entry.id, entry.start);
    if let Some(end) = entry.end {
        run.finalize(end);
    }
    run.set_counter_infos(entry.counter_infos.clone());

    load_counters(&dir.join(counter_file(entry.id)), &mut run)?;
    load_tasks(&dir.join(task_file(entry.id)), &mut run)?;

    debug!(
        run_id = entry.id,
        samples = run.series().len(),
        tasks = run.tasks().len(),
        "run imported",
    );

    Ok(run)
}

fn row_instance(row: &CounterRow) -> SeriesInstance {
    match (&row.locality, &row.thread) {
        (Some(locality), Some(thread)) => SeriesInstance::Addressed(InstanceId {
            locality: locality.clone(),
            pool: row.pool.clone(),
            worker: thread.clone(),
        }),
        _ => SeriesInstance::Raw(row.instance.clone()),
    }
}

fn load_counters(path: &Path, run: &mut Run) -> Result<(), PersistenceError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut current: Option<(String, SeriesInstance)> = None;
    let mut points: Vec<SamplePoint> = Vec::new();

    for row in reader.deserialize::<CounterRow>() {
        let row = row?;
        let instance = row_instance(&row);

        let same = current
            .as_ref()
            .is_some_and(|(n, i)| *n == row.name && *i == instance);
        if !same {
            if let Some((name, inst)) = current.take() {
                run.extend_series(&name, inst, points.drain(..));
            }
            current = Some((row.name.clone(), instance));
        }

        points.push(SamplePoint {
            sequence_number: row.sequence_number,
            timestamp: row.timestamp,
            timestamp_unit: row.timestamp_unit,
            value: CounterValue::parse(&row.value),
            value_unit: row.value_unit,
        });
    }

    if let Some((name, inst)) = current {
        run.extend_series(&name, inst, points);
    }
    Ok(())
}

fn load_tasks(path: &Path, run: &mut Run) -> Result<(), PersistenceError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut current: Option<(String, String)> = None;
    let mut spans: Vec<TaskSpan> = Vec::new();

    for row in reader.deserialize::<TaskRow>() {
        let row = row?;

        let same = current
            .as_ref()
            .is_some_and(|(l, w)| *l == row.locality && *w == row.worker_id);
        if !same {
            if let Some((locality, worker)) = current.take() {
                run.extend_tasks(&locality, &worker, spans.drain(..));
            }
            current = Some((row.locality.clone(), row.worker_id.clone()));
        }

        spans.push(TaskSpan {
            task_name: row.name,
            start: row.start,
            end: row.end,
        });
    }

    if let Some((locality, worker)) = current {
        run.extend_tasks(&locality, &worker, spans);
    }
    Ok(())
}
