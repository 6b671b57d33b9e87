use thiserror::Error;

#[derive(Debug, Error)]
pub enum LensError {
    #[error("uploaded file is not valid JSON: {0}")]
    InvalidUpload(String),
    #[error("no analysis results to combine")]
    NoResults,
    #[error("another analysis batch is already running")]
    BatchInFlight,
    #[error("thread not found: {0}")]
    ThreadNotFound(String),
}
