use thiserror::Error;

#[derive(Debug, Error)]
pub enum MapperError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("capture error: {0}")]
    Capture(#[from] pcap::Error),

    #[error("classifier error: {0}")]
    Classifier(String),

    #[error("oracle error: {0}")]
    Oracle(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("lock poisoned: {0}")]
    Lock(String),

    #[error("pipeline is shutting down, packet rejected")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, MapperError>;
