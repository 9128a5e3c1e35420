use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CacheError {
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("unknown repository: {0}")]
    UnknownRepository(String),

    #[error("missing config file adc-cache.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("ADC request failed: {0}")]
    AdcHttp(String),

    #[error("ADC repository returned status {status}: {message}")]
    AdcStatus { status: u16, message: String },

    #[error("ADC response could not be decoded: {0}")]
    AdcResponse(String),

    #[error("postit request failed: {0}")]
    PostitHttp(String),

    #[error("postit service returned status {status}: {message}")]
    PostitStatus { status: u16, message: String },

    #[error("metadata store error: {0}")]
    MetadataStore(String),

    #[error("metadata record {uuid} could not be decoded: {message}")]
    RecordDecode { uuid: String, message: String },

    #[error("duplicate cache entry: {0}")]
    DuplicateEntry(String),

    #[error("cache entry not found: {0}")]
    EntryNotFound(String),

    #[error("cache entry not ready: {0}")]
    EntryNotReady(String),

    #[error("async query id mismatch: expected {expected}, got {actual}")]
    QueryMismatch { expected: String, actual: String },

    #[error("unexpected notification for record {0}")]
    UnexpectedNotification(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}

impl CacheError {
    /// Errors that point at inconsistent records rather than a flaky collaborator.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            CacheError::DuplicateEntry(_)
                | CacheError::EntryNotFound(_)
                | CacheError::RecordDecode { .. }
                | CacheError::QueryMismatch { .. }
                | CacheError::UnexpectedNotification(_)
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CacheError::AdcHttp(_)
                | CacheError::AdcStatus { .. }
                | CacheError::PostitHttp(_)
                | CacheError::PostitStatus { .. }
                | CacheError::MetadataStore(_)
        )
    }
}
