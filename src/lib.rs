//! Flow-level traffic classification.
//!
//! Two pipelines share one flow statistics engine: a streaming pipeline that
//! classifies live or replayed traffic with a trained model, and a batch
//! pipeline that labels stored captures with a DPI engine to build a
//! training set.

pub mod batch;
pub mod capture;
pub mod classifier;
pub mod config;
pub mod error;
pub mod export;
pub mod processor;
pub mod types;

pub use error::{MapperError, Result};
