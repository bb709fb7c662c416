//! Server-side run store: append-only series and task buffers indexed by
//! counter name and instance, grouped into runs.

pub mod aggregator;
pub mod buffer;
pub mod catalog;
pub mod instance;
pub mod run;
pub mod series;
pub mod tasks;

pub use aggregator::{Applied, IngestError, RunAggregator, SharedAggregator};
pub use buffer::{GrowthBuffer, RowBuffer};
pub use instance::{parse_instance_path, InstanceId, SeriesInstance};
pub use run::{Run, RunId, RunMetadata};
pub use series::SamplePoint;
pub use tasks::TaskSpan;
