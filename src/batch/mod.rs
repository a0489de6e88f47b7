pub mod oracle;
pub mod progress;
pub mod worker;

pub use oracle::{parse_report, GroundTruth, GroundTruthOracle, NdpiReader, TrafficCounters, TrafficSummary};
pub use progress::{Progress, ProgressSnapshot};
pub use worker::{collect_inputs, process_capture, BatchPipeline, BatchReport};
