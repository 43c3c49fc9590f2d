//! Typed failures for the two ports and persona rendering.
//!
//! None of these are fatal to the process. The controller matches on them to
//! decide how an exchange degrades; everything else travels as `anyhow::Error`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model not loaded")]
    NotLoaded,
    #[error("model request timed out: {0}")]
    Timeout(String),
    #[error("unable to reach model: {0}")]
    Connection(String),
    #[error("model API returned error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("invalid model response: {0}")]
    InvalidResponse(String),
    #[error("generation worker unavailable: {0}")]
    WorkerUnavailable(String),
    #[error("model panicked during generation")]
    Panicked,
}

impl ModelError {
    /// Timeouts and connection failures, as opposed to the model answering badly.
    pub fn is_transport(&self) -> bool {
        matches!(self, ModelError::Timeout(_) | ModelError::Connection(_))
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ModelError::Timeout(error.to_string())
        } else if error.is_connect() || error.is_request() {
            ModelError::Connection(error.to_string())
        } else if error.is_decode() {
            ModelError::InvalidResponse(error.to_string())
        } else {
            ModelError::Connection(error.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum MemoryStoreError {
    #[error("memory store unavailable: {0}")]
    Unavailable(String),
    #[error("memory store rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("memory storage failure: {0}")]
    Storage(String),
    #[error("invalid memory record: {0}")]
    InvalidRecord(String),
}

impl From<reqwest::Error> for MemoryStoreError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            MemoryStoreError::InvalidRecord(error.to_string())
        } else {
            MemoryStoreError::Unavailable(error.to_string())
        }
    }
}

impl From<rusqlite::Error> for MemoryStoreError {
    fn from(error: rusqlite::Error) -> Self {
        MemoryStoreError::Storage(error.to_string())
    }
}

#[derive(Debug, Error)]
pub enum TemplateRenderError {
    #[error("persona template references unknown placeholder '{0}'")]
    UnknownPlaceholder(String),
    #[error("persona placeholder pattern failed to compile: {0}")]
    Pattern(String),
    #[error("failed to read persona template {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
