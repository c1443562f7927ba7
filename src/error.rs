use thiserror::Error;

#[derive(Error, Debug)]
pub enum DedupError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Signature length mismatch: expected {expected}, got {got}")]
    SignatureMismatch { expected: usize, got: usize },
    #[error("Too many documents: {count} exceeds the index limit of {max}")]
    TooManyDocuments { count: usize, max: usize },
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DedupError>;
