pub mod feature_processor;
pub mod engine;
mod publisher;
mod flow;

pub use feature_processor::FeatureProcessor;
pub use engine::{FlowEngine, ShutdownReason};
pub use flow::{
    DirectionStats, FlowDirection, FlowKey, FlowStage, FlowState, FlowTable, StatValue, FEATURE_ROW_LEN, STAT_COLUMNS,
};
