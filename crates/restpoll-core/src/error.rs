use std::fmt;

use thiserror::Error;

/// Application-wide error types for restpoll.
#[derive(Error, Debug)]
pub enum AppError {
    /// The server answered with a non-2xx status.
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// The request could not be sent or its body could not be read.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// A URL could not be parsed or joined.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The response payload did not match the declared response shape.
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// A caller-supplied handler reported a failure.
    #[error("Handler error: {0}")]
    HandlerError(String),

    /// Handler output could not be delivered to a sink.
    #[error("Routing error: {0}")]
    RoutingError(String),

    /// Invalid extractor or auth configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Fetching an auth header failed.
    #[error("Auth error: {0}")]
    AuthError(String),

    /// The run was cancelled while this operation was waiting.
    #[error("Cancelled")]
    Cancelled,

    /// One or more calls failed during a run.
    #[error("{0}")]
    RunFailed(RunFailure),
}

impl AppError {
    /// Returns true if this error is a transient HTTP failure worth retrying.
    ///
    /// Only non-2xx statuses qualify. Transport, decode and handler failures
    /// propagate on the first occurrence.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::HttpStatus { .. })
    }

    /// Convenience constructor for handler failures.
    pub fn handler(message: impl fmt::Display) -> Self {
        AppError::HandlerError(message.to_string())
    }
}

/// A single failed call, attributed to the endpoint that issued it.
#[derive(Debug)]
pub struct CallFailure {
    pub endpoint: String,
    pub error: AppError,
}

/// Aggregate of every call failure recorded during a run.
#[derive(Debug, Default)]
pub struct RunFailure {
    pub failures: Vec<CallFailure>,
}

impl RunFailure {
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Names of the endpoints that failed, in the order the failures were recorded.
    pub fn endpoints(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.endpoint.as_str()).collect()
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} call(s) failed during run", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.endpoint, failure.error)?;
        }
        Ok(())
    }
}
