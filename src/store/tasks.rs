use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::buffer::{GrowthBuffer, RowBuffer};
use crate::parser::record::TaskEvent;

/// Half the height of a task rectangle, in worker rows.
const TASK_HALF_HEIGHT: f64 = 0.4;

/// One executed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpan {
    pub task_name: String,
    pub start: f64,
    pub end: f64,
}

impl From<&TaskEvent> for TaskSpan {
    fn from(t: &TaskEvent) -> Self {
        Self {
            task_name: t.task_name.clone(),
            start: t.start,
            end: t.end,
        }
    }
}

/// Rectangles of all tasks, as a triangle mesh.
///
/// Every task adds four `(x, y)` vertices (start/end time by worker row
/// ±0.4) and two triangles indexing them.
#[derive(Debug, Clone, Default)]
pub struct TaskGeometry {
    pub vertices: RowBuffer<f64, 2>,
    pub triangles: RowBuffer<u32, 3>,
}

impl TaskGeometry {
    fn push_rect(&mut self, row: f64, start: f64, end: f64) {
        let base = self.vertices.len() as u32;
        self.vertices.push_row([start, row - TASK_HALF_HEIGHT]);
        self.vertices.push_row([end, row - TASK_HALF_HEIGHT]);
        self.vertices.push_row([end, row + TASK_HALF_HEIGHT]);
        self.vertices.push_row([start, row + TASK_HALF_HEIGHT]);
        self.triangles.push_row([base, base + 1, base + 2]);
        self.triangles.push_row([base, base + 2, base + 3]);
    }
}

/// Task events keyed by `(locality, worker)`.
#[derive(Debug, Clone, Default)]
pub struct TaskStore {
    spans: HashMap<String, HashMap<String, GrowthBuffer<TaskSpan>>>,
    /// Rows of workers without a numeric id, in first-seen order.
    extra_rows: HashMap<String, f64>,
    geometry: TaskGeometry,
    total: usize,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&mut self, locality: &str, worker: &str, span: TaskSpan) {
        let row = self.worker_row(worker);
        self.geometry.push_rect(row, span.start, span.end);
        self.spans_mut(locality, worker).push(span);
        self.total += 1;
    }

    /// Append many tasks of one worker.
    pub fn extend(
        &mut self,
        locality: &str,
        worker: &str,
        spans: impl IntoIterator<Item = TaskSpan>,
    ) {
        let row = self.worker_row(worker);
        let mut added = 0;
        let mut rects = Vec::new();
        {
            let buf = self.spans_mut(locality, worker);
            for span in spans {
                rects.push((span.start, span.end));
                buf.push(span);
                added += 1;
            }
        }
        for (start, end) in rects {
            self.geometry.push_rect(row, start, end);
        }
        self.total += added;
    }

    fn spans_mut(&mut self, locality: &str, worker: &str) -> &mut GrowthBuffer<TaskSpan> {
        self.spans
            .entry(locality.to_string())
            .or_default()
            .entry(worker.to_string())
            .or_default()
    }

    /// Vertical position of a worker: its numeric id, or -1, -2, ... for
    /// named workers in first-seen order.
    fn worker_row(&mut self, worker: &str) -> f64 {
        if let Ok(id) = worker.parse::<u32>() {
            return f64::from(id);
        }
        let next = -(self.extra_rows.len() as f64) - 1.0;
        *self.extra_rows.entry(worker.to_string()).or_insert(next)
    }

    /// Tasks of one worker from `from_index` on, in arrival order.
    pub fn get_task_events(&self, locality: &str, worker: &str, from_index: usize) -> &[TaskSpan] {
        self.spans
            .get(locality)
            .and_then(|w| w.get(worker))
            .map_or(&[], |buf| buf.from_index(from_index))
    }

    /// All `(locality, worker, spans)` groups, sorted by key.
    pub fn iter_workers(&self) -> Vec<(&str, &str, &[TaskSpan])> {
        let mut all: Vec<(&str, &str, &[TaskSpan])> = self
            .spans
            .iter()
            .flat_map(|(loc, workers)| {
                workers
                    .iter()
                    .map(move |(w, buf)| (loc.as_str(), w.as_str(), buf.as_slice()))
            })
            .collect();
        all.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        all
    }

    pub fn geometry(&self) -> &TaskGeometry {
        &self.geometry
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}
