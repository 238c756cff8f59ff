pub mod config;
pub mod error;
pub mod payment;
pub mod pipeline;
pub mod source;
pub mod table;
pub mod transform;

pub use config::{JobConfig, PipelineConfig};
pub use error::{Result, TransformError};
pub use pipeline::{JobReport, Pipeline};
pub use table::{MergeMetrics, MergeOptions, TableStore, WriteMode};
pub use transform::{KeepStrategy, Transform};
