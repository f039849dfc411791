//! Error types for hookflow.
//!
//! Faults are scoped so that a failure in one flow never takes down the
//! polling loop: render and evaluation problems degrade to sentinel values
//! long before they reach this enum, and the scheduler treats the remaining
//! variants as per-flow or per-tick events.

use thiserror::Error;

/// Result type alias for hookflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// hookflow error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Polled source unreachable, non-2xx, or unparseable. The affected
    /// flow is skipped for the current tick; no state is mutated.
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Webhook delivery failed or was rejected. Trigger state must not
    /// advance so the same trigger is retried next tick.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Flow store read or write failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Bad flow or embed configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable code for log filtering.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Fetch(_) => "FETCH_ERROR",
            Error::Dispatch(_) => "DISPATCH_ERROR",
            Error::Store(_) => "STORE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }
}
