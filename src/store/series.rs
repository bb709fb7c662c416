use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::buffer::{GrowthBuffer, RowBuffer};
use super::instance::SeriesInstance;
use crate::parser::record::{CounterSample, CounterValue};

/// One stored counter reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplePoint {
    pub sequence_number: u64,
    pub timestamp: f64,
    pub timestamp_unit: String,
    pub value: CounterValue,
    pub value_unit: Option<String>,
}

impl From<&CounterSample> for SamplePoint {
    fn from(s: &CounterSample) -> Self {
        Self {
            sequence_number: s.sequence_number,
            timestamp: s.timestamp,
            timestamp_unit: s.timestamp_unit.clone(),
            value: s.value.clone(),
            value_unit: s.value_unit.clone(),
        }
    }
}

/// Counter time series of a run, keyed by `(name[@params], instance)`.
#[derive(Debug, Clone, Default)]
pub struct SeriesStore {
    /// Counter names in first-seen order.
    names: Vec<String>,
    /// Series index by name and instance.
    index: HashMap<String, HashMap<SeriesInstance, u32>>,
    /// Points per series, addressed by series index.
    series: Vec<GrowthBuffer<SamplePoint>>,
    /// `(timestamp, value, series_index)` of every numeric sample.
    numeric: RowBuffer<f64, 3>,
    total: usize,
}

impl SeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one sample; returns the stable index of its series.
    pub fn append(&mut self, name: &str, instance: SeriesInstance, point: SamplePoint) -> u32 {
        let index = self.series_entry(name, instance);
        self.push_point(index, point);
        index
    }

    /// Append a run of samples sharing one series key.
    pub fn extend(
        &mut self,
        name: &str,
        instance: SeriesInstance,
        points: impl IntoIterator<Item = SamplePoint>,
    ) -> u32 {
        let index = self.series_entry(name, instance);
        for point in points {
            self.push_point(index, point);
        }
        index
    }

    fn series_entry(&mut self, name: &str, instance: SeriesInstance) -> u32 {
        if let Some(index) = self.index.get(name).and_then(|m| m.get(&instance)) {
            return *index;
        }

        let index = self.series.len() as u32;
        self.series.push(GrowthBuffer::new());
        match self.index.get_mut(name) {
            Some(by_instance) => {
                by_instance.insert(instance, index);
            }
            None => {
                self.names.push(name.to_string());
                self.index
                    .insert(name.to_string(), HashMap::from([(instance, index)]));
            }
        }
        index
    }

    fn push_point(&mut self, index: u32, point: SamplePoint) {
        let Some(points) = self.series.get_mut(index as usize) else {
            return;
        };
        if let Some(v) = point.value.as_f64() {
            self.numeric.push_row([point.timestamp, v, f64::from(index)]);
        }
        points.push(point);
        self.total += 1;
    }

    /// Samples of one series from `from_index` on, in append order.
    pub fn get_series(
        &self,
        name: &str,
        instance: &SeriesInstance,
        from_index: usize,
    ) -> &[SamplePoint] {
        self.series_index(name, instance)
            .and_then(|i| self.series.get(i as usize))
            .map_or(&[], |points| points.from_index(from_index))
    }

    /// Stable per-run index of a series key.
    pub fn series_index(&self, name: &str, instance: &SeriesInstance) -> Option<u32> {
        self.index.get(name)?.get(instance).copied()
    }

    pub fn list_counter_names(&self) -> &[String] {
        &self.names
    }

    /// Instances recorded for a counter name, in first-seen order.
    pub fn list_instances(&self, name: &str) -> Vec<&SeriesInstance> {
        let mut instances: Vec<(&SeriesInstance, u32)> = self
            .index
            .get(name)
            .map(|m| m.iter().map(|(k, i)| (k, *i)).collect())
            .unwrap_or_default();
        instances.sort_by_key(|(_, index)| *index);
        instances.into_iter().map(|(k, _)| k).collect()
    }

    /// All series as `(name, instance, points)` in series-index order.
    pub fn iter_series(&self) -> impl Iterator<Item = (&str, &SeriesInstance, &[SamplePoint])> + '_ {
        let mut keys: Vec<(&str, &SeriesInstance, u32)> = self
            .index
            .iter()
            .flat_map(|(name, m)| m.iter().map(move |(inst, i)| (name.as_str(), inst, *i)))
            .collect();
        keys.sort_by_key(|(_, _, i)| *i);
        keys.into_iter().filter_map(|(name, inst, i)| {
            self.series
                .get(i as usize)
                .map(|points| (name, inst, points.as_slice()))
        })
    }

    pub fn numeric(&self) -> &RowBuffer<f64, 3> {
        &self.numeric
    }

    /// Number of stored samples.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }
}
