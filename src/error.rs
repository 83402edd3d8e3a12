// src/error.rs
// =============================================================================
// Error types for the engine.
//
// Taxonomy:
// - QueueError: closed-queue writes and end-of-stream reads
// - CrawlError: everything that can fail inside one pipeline pass
// - RequestError: a CrawlError together with the request that caused it
// - EngineError: what the completion channel carries (queue or request error)
// - ConfigError: invalid options, reported before anything starts
// =============================================================================

use std::sync::Arc;

use thiserror::Error;

use crate::request::Request;

/// Error type returned by caller-supplied handlers and middlewares.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by a queue backend.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue no longer accepts new jobs.
    #[error("queue is closed")]
    Closed,

    /// No further jobs will ever be produced.
    #[error("end of stream")]
    EndOfStream,

    /// A request could not be serialized for the message bus.
    #[error("envelope encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// The message bus rejected a publish.
    #[error("bus error: {0}")]
    Bus(String),
}

/// Errors produced while executing a single request.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("invalid url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid method {0:?}")]
    InvalidMethod(String),

    #[error("invalid header {0:?}")]
    InvalidHeader(String),

    /// A middleware vetoed the request; nothing was sent.
    #[error("middleware rejected request: {0}")]
    Middleware(#[source] BoxError),

    #[error("invalid proxy address {addr:?}: {reason}")]
    Proxy { addr: String, reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The job's context was cancelled.
    #[error("request cancelled")]
    Cancelled,

    /// The job's deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("reading response body failed: {0}")]
    Body(#[source] reqwest::Error),

    /// The payload could not be turned into a document.
    #[error("payload parse failed: {0}")]
    Parse(String),

    /// The response was already closed when its body was requested.
    #[error("response is closed")]
    ResponseClosed,

    /// Strict dispatch found no handler for a callback name.
    #[error("no handler registered for callback {0:?}")]
    UnhandledCallback(String),

    /// A handler returned an error; remaining handlers were skipped.
    #[error("handler {key:?} failed: {source}")]
    Handler {
        key: String,
        #[source]
        source: BoxError,
    },
}

impl CrawlError {
    /// True when the job was stopped by its context rather than by a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, CrawlError::Cancelled | CrawlError::DeadlineExceeded)
    }
}

/// A pipeline failure wrapped with the request that caused it.
#[derive(Debug, Error)]
#[error("{request}: {source}")]
pub struct RequestError {
    pub request: Arc<Request>,
    #[source]
    pub source: CrawlError,
}

/// Items delivered on the completion channel.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Request(#[from] RequestError),
}

impl EngineError {
    /// The offending request, when the error came from a pipeline pass.
    pub fn request(&self) -> Option<&Request> {
        match self {
            EngineError::Request(err) => Some(&err.request),
            EngineError::Queue(_) => None,
        }
    }
}

/// Invalid engine options.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("max_requests_per_second and max_requests_per_minute are mutually exclusive")]
    ConflictingRateLimits,

    #[error("rate limit of {permits} per {window:?} leaves no time between requests")]
    RateTooHigh { permits: u32, window: std::time::Duration },

    #[error("invalid default header {0:?}")]
    InvalidHeader(String),

    #[error("invalid callback pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("building http client failed: {0}")]
    Client(#[from] reqwest::Error),
}

/// Errors from document queries.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("invalid selector {selector:?}: {reason}")]
    Selector { selector: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_error_display() {
        let request = Arc::new(Request::new("http://x.test/a"));
        let err = RequestError {
            request,
            source: CrawlError::Cancelled,
        };
        assert_eq!(err.to_string(), "GET http://x.test/a: request cancelled");
    }

    #[test]
    fn test_engine_error_carries_request() {
        let err: EngineError = RequestError {
            request: Arc::new(Request::new("http://x.test/")),
            source: CrawlError::DeadlineExceeded,
        }
        .into();
        assert_eq!(err.request().map(|r| r.url.as_str()), Some("http://x.test/"));

        let err: EngineError = QueueError::Closed.into();
        assert!(err.request().is_none());
    }

    #[test]
    fn test_cancellation_classification() {
        assert!(CrawlError::Cancelled.is_cancellation());
        assert!(CrawlError::DeadlineExceeded.is_cancellation());
        assert!(!CrawlError::UnhandledCallback("x".into()).is_cancellation());
    }
}
