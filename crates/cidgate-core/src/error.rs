use thiserror::Error;

/// Errors raised by persistence backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("storage quota exceeded for key '{key}'")]
    QuotaExceeded { key: String },
}

/// Errors produced by the gateway engine.
///
/// Probe failures are not errors: they are folded into
/// [`ProbeResult`](cidgate_types::ProbeResult) values.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid endpoint URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("endpoint already registered: {url}")]
    DuplicateEndpoint { url: String },

    #[error("endpoint not found: {url}")]
    EndpointNotFound { url: String },

    /// Read-back after a cache write did not return what was written.
    #[error("cache write verification failed: wrote {expected} results, read back {actual}")]
    CacheWriteMismatch { expected: usize, actual: usize },

    #[error("cache encoding failed: {0}")]
    CacheEncoding(String),

    #[error("gateway returned HTTP {status} for {url}")]
    BadStatus { url: String, status: u16 },

    #[error("request cancelled")]
    Cancelled,

    #[error("request timed out")]
    Timeout,

    /// The scheduler's supervisor loop is no longer running.
    #[error("verification scheduler shut down")]
    SchedulerShutdown,
}
