//! Structured error types for data operations.
//!
//! These cover the plugin fetch path, the storage collaborator and the
//! frame helpers. They are displayable in both CLI and log contexts.

use polars::prelude::PolarsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("no series registered for uri '{uri}'")]
    NoSuchSeries { uri: String },

    #[error("fetch failed for {uri}: {reason}")]
    FetchFailed { uri: String, reason: String },

    #[error("fetched frame for {uri} is missing required fields: {missing:?}")]
    ShapeValidationFailed { uri: String, missing: Vec<String> },

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("entity not found upstream: {entity}")]
    EntityNotFound { entity: String },

    #[error("hard stop: data provider has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("frame error: {0}")]
    Frame(#[from] PolarsError),

    #[error("data error: {0}")]
    Other(String),
}
