//! Classification of HPX program output into typed telemetry records.

pub mod classify;
pub mod record;
pub mod stats;

pub use classify::{Classification, LineClassifier};
pub use record::{
    BoundaryKind, CounterDescription, CounterInfos, CounterSample, CounterValue, RecordKind,
    TaskEvent, TelemetryRecord,
};
pub use stats::RecordStats;
