use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classifier::FeatureSelection;
use crate::error::{MapperError, Result};

pub const DEFAULT_THRESHOLD: u64 = 8;
pub const DEFAULT_PROCESSES: usize = 15;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_FILTER: &str = "tcp or udp";
pub const DEFAULT_NDPI_READER: &str = "ndpiReader";

/// Settings of the streaming pipeline once a capture source and a classifier exist.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Packets a flow needs before it is sent to the classifier.
    pub threshold: u64,
    pub features: FeatureSelection,
    /// Where the report goes at shutdown; nothing is written when unset.
    pub results: Option<PathBuf>,
    pub sweep_interval: Duration,
    pub stats_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            features: FeatureSelection::default(),
            results: None,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.threshold == 0 {
            return Err(MapperError::Config("threshold must be at least 1".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(MapperError::Config("sweep interval must be positive".into()));
        }
        if self.stats_interval.is_zero() {
            return Err(MapperError::Config("status interval must be positive".into()));
        }
        // Re-check in case the selection was built without `FeatureSelection::new`.
        FeatureSelection::new(self.features.indices().iter().copied())?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    /// A capture file or a directory of capture files.
    pub input: PathBuf,
    pub output: PathBuf,
    pub threshold: u64,
    pub processes: usize,
    pub ndpi_reader: PathBuf,
    pub status_interval: Duration,
    /// Write a header row into an empty output file.
    pub header: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            output: PathBuf::new(),
            threshold: DEFAULT_THRESHOLD,
            processes: DEFAULT_PROCESSES,
            ndpi_reader: PathBuf::from(DEFAULT_NDPI_READER),
            status_interval: DEFAULT_STATS_INTERVAL,
            header: false,
        }
    }
}

impl BatchConfig {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self { input: input.into(), output: output.into(), ..Self::default() }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input.as_os_str().is_empty() {
            return Err(MapperError::Config("input path is required".into()));
        }
        if !self.input.exists() {
            return Err(MapperError::Config(format!("input {} does not exist", self.input.display())));
        }
        if self.output.as_os_str().is_empty() {
            return Err(MapperError::Config("output path is required".into()));
        }
        if self.threshold == 0 {
            return Err(MapperError::Config("threshold must be at least 1".into()));
        }
        if self.processes == 0 {
            return Err(MapperError::Config("process count must be at least 1".into()));
        }
        if self.status_interval.is_zero() {
            return Err(MapperError::Config("status interval must be positive".into()));
        }
        Ok(())
    }
}

/// `class_map.json` next to the model unless a path was given.
pub fn resolve_class_map(model: &Path, class_map: Option<&Path>) -> PathBuf {
    match class_map {
        Some(path) => path.to_path_buf(),
        None => model
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("class_map.json"),
    }
}
