use serde::{Deserialize, Serialize};

use super::buffer::{GrowthBuffer, RowBuffer};
use super::catalog::InstanceCatalog;
use super::instance::{parse_instance_path, InstanceId, SeriesInstance};
use super::series::{SamplePoint, SeriesStore};
use super::tasks::{TaskGeometry, TaskSpan, TaskStore};
use crate::parser::record::{CounterInfos, CounterSample, TaskEvent};

/// Identifier of a run, unique within a process.
pub type RunId = u64;

/// Summary of a run for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub id: RunId,
    pub start: f64,
    pub end: Option<f64>,
    pub locality_count: usize,
    pub worker_count: usize,
    pub counter_count: usize,
    pub sample_count: usize,
    pub task_count: usize,
}

/// One collection from transmission begin to transmission end.
#[derive(Debug, Clone)]
pub struct Run {
    id: RunId,
    start: f64,
    end: Option<f64>,
    counter_descriptions: CounterInfos,
    series: SeriesStore,
    tasks: TaskStore,
    catalog: InstanceCatalog,
    plain_lines: GrowthBuffer<String>,
}

impl Run {
    pub fn new(id: RunId, start: f64) -> Self {
        Self {
            id,
            start,
            end: None,
            counter_descriptions: CounterInfos::new(),
            series: SeriesStore::new(),
            tasks: TaskStore::new(),
            catalog: InstanceCatalog::new(),
            plain_lines: GrowthBuffer::new(),
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> Option<f64> {
        self.end
    }

    pub fn is_finalized(&self) -> bool {
        self.end.is_some()
    }

    pub(crate) fn finalize(&mut self, end: f64) {
        self.end = Some(end);
    }

    /// Store a counter sample under its resolved instance.
    pub fn add_sample(&mut self, sample: &CounterSample) -> SeriesInstance {
        let instance = parse_instance_path(&sample.instance);
        if let SeriesInstance::Addressed(id) = &instance {
            self.catalog.insert(id);
        }
        self.series.append(
            &sample.series_name(),
            instance.clone(),
            SamplePoint::from(sample),
        );
        instance
    }

    /// Store a task event; its worker is registered in the default pool.
    pub fn add_task(&mut self, task: &TaskEvent) {
        self.catalog.insert(&InstanceId::new(
            task.locality.as_str(),
            None::<&str>,
            task.worker_id.as_str(),
        ));
        self.tasks
            .add_task(&task.locality, &task.worker_id, TaskSpan::from(task));
    }

    pub fn add_plain_line(&mut self, text: String) {
        self.plain_lines.push(text);
    }

    /// Merge counter descriptions into the run.
    pub fn set_counter_infos(&mut self, infos: CounterInfos) {
        self.counter_descriptions.extend(infos);
    }

    /// Bulk-load one series, registering its instance once.
    pub fn extend_series(
        &mut self,
        name: &str,
        instance: SeriesInstance,
        points: impl IntoIterator<Item = SamplePoint>,
    ) {
        if let SeriesInstance::Addressed(id) = &instance {
            self.catalog.insert(id);
        }
        self.series.extend(name, instance, points);
    }

    /// Bulk-load the tasks of one worker, registering it once.
    pub fn extend_tasks(
        &mut self,
        locality: &str,
        worker: &str,
        spans: impl IntoIterator<Item = TaskSpan>,
    ) {
        self.catalog
            .insert(&InstanceId::new(locality, None::<&str>, worker));
        self.tasks.extend(locality, worker, spans);
    }

    pub fn get_series(
        &self,
        name: &str,
        instance: &SeriesInstance,
        from_index: usize,
    ) -> &[SamplePoint] {
        self.series.get_series(name, instance, from_index)
    }

    pub fn get_task_events(&self, locality: &str, worker: &str, from_index: usize) -> &[TaskSpan] {
        self.tasks.get_task_events(locality, worker, from_index)
    }

    pub fn list_counter_names(&self) -> &[String] {
        self.series.list_counter_names()
    }

    pub fn list_localities(&self) -> Vec<&str> {
        self.catalog.list_localities()
    }

    pub fn list_pools(&self, locality: &str) -> Vec<Option<&str>> {
        self.catalog.list_pools(locality)
    }

    pub fn list_workers(&self, locality: &str, pool: Option<&str>) -> Vec<&str> {
        self.catalog.list_workers(locality, pool)
    }

    pub fn worker_count(&self, locality: &str) -> usize {
        self.catalog.worker_count(locality)
    }

    pub fn counter_descriptions(&self) -> &CounterInfos {
        &self.counter_descriptions
    }

    pub fn series(&self) -> &SeriesStore {
        &self.series
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn catalog(&self) -> &InstanceCatalog {
        &self.catalog
    }

    /// `(timestamp, value, series_index)` rows of all numeric samples.
    pub fn numeric(&self) -> &RowBuffer<f64, 3> {
        self.series.numeric()
    }

    pub fn geometry(&self) -> &TaskGeometry {
        self.tasks.geometry()
    }

    pub fn plain_lines(&self, from_index: usize) -> &[String] {
        self.plain_lines.from_index(from_index)
    }

    pub fn metadata(&self) -> RunMetadata {
        let localities = self.catalog.list_localities();
        RunMetadata {
            id: self.id,
            start: self.start,
            end: self.end,
            locality_count: localities.len(),
            worker_count: localities
                .iter()
                .map(|l| self.catalog.worker_count(l))
                .sum(),
            counter_count: self.series.list_counter_names().len(),
            sample_count: self.series.len(),
            task_count: self.tasks.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::record::CounterValue;

    fn sample(instance: &str, seq: u64, value: f64) -> CounterSample {
        CounterSample {
            counter_name: "threads/count/cumulative".to_string(),
            instance: instance.to_string(),
            parameters: None,
            sequence_number: seq,
            timestamp: seq as f64,
            timestamp_unit: "[s]".to_string(),
            value: CounterValue::Number(value),
            value_unit: None,
        }
    }

    #[test]
    fn test_add_sample_registers_instance() {
        let mut run = Run::new(0, 1.0);
        let inst = run.add_sample(&sample("locality#0/pool#default/worker-thread#1", 1, 5.0));

        assert_eq!(
            inst,
            SeriesInstance::Addressed(InstanceId::new("0", Some("default"), "1"))
        );
        assert_eq!(run.list_localities(), vec!["0"]);
        assert_eq!(run.list_workers("0", Some("default")), vec!["1"]);
        assert_eq!(run.get_series("threads/count/cumulative", &inst, 0).len(), 1);
    }

    #[test]
    fn test_raw_instance_not_in_catalog() {
        let mut run = Run::new(0, 1.0);
        let inst = run.add_sample(&sample("/threads{locality#0/total}/count,2", 1, 5.0));
        assert!(matches!(inst, SeriesInstance::Raw(_)));
        assert!(run.catalog().is_empty());
    }

    #[test]
    fn test_add_task_and_metadata() {
        let mut run = Run::new(3, 10.0);
        for w in ["0", "1", "3"] {
            run.add_task(&TaskEvent {
                locality: "0".to_string(),
                worker_id: w.to_string(),
                task_name: "f".to_string(),
                start: 0.0,
                end: 1.0,
            });
        }
        run.add_sample(&sample("locality#1/total", 1, 1.0));
        run.finalize(20.0);

        let meta = run.metadata();
        assert_eq!(meta.id, 3);
        assert_eq!(meta.start, 10.0);
        assert_eq!(meta.end, Some(20.0));
        assert_eq!(meta.locality_count, 2);
        assert_eq!(meta.worker_count, 4);
        assert_eq!(meta.task_count, 3);
        assert_eq!(meta.sample_count, 1);
        assert_eq!(run.geometry().triangles.len(), 6);
    }
}
