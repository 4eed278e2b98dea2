//! Error types shared across the engine.
//!
//! [`SpiderError`] is the single error enum that flows through the pipeline,
//! the downloader and spider callbacks. [`Failure`] pairs an error with the
//! request that caused it so it can travel the response-direction pipeline
//! the same way a [`Response`](crate::response::Response) does.

use crate::queue::QueueError;
use crate::request::Request;
use crate::settings::SettingsError;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors produced while scheduling, downloading or processing requests.
#[derive(Debug, Error)]
pub enum SpiderError {
    /// Connection-level failure reported by a download handler.
    #[error("network error downloading {url}: {message}")]
    Network { url: String, message: String },

    /// The handler gave up waiting for the remote end.
    #[error("timeout downloading {url}")]
    Timeout { url: String },

    /// The accumulated body grew beyond the configured limit.
    #[error("response from {url} exceeded the size limit of {limit} bytes")]
    SizeExceeded { url: String, limit: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// No handler is registered (or available) for the URL scheme.
    #[error("unsupported URL scheme `{0}`")]
    UnsupportedScheme(String),

    /// A component opted out of construction for the current settings.
    #[error("not configured: {0}")]
    NotConfigured(String),

    /// A pipeline stage returned a drop signal for the request.
    #[error("request dropped by {stage}.{method}")]
    RequestDropped { stage: String, method: &'static str },

    /// A component broke the calling contract; indicates a programming bug.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("middleware error: {0}")]
    Middleware(String),

    #[error("spider error: {0}")]
    Spider(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    GeneralError(String),
}

impl SpiderError {
    /// Returns true for drop signals, which are expected and not reported to the spider.
    pub fn is_drop(&self) -> bool {
        matches!(self, SpiderError::RequestDropped { .. })
    }

    /// Returns true for transport-class errors that a retry might resolve.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SpiderError::Network { .. } | SpiderError::Timeout { .. } | SpiderError::Io(_)
        )
    }
}

impl From<url::ParseError> for SpiderError {
    fn from(e: url::ParseError) -> Self {
        SpiderError::InvalidUrl {
            url: String::new(),
            reason: e.to_string(),
        }
    }
}

/// A captured error plus the request it belongs to.
///
/// The request is attached after the error is caught, since the origin is not
/// always known where the error is raised.
#[derive(Clone)]
pub struct Failure {
    error: Arc<SpiderError>,
    request: Option<Request>,
}

impl Failure {
    pub fn new(error: SpiderError) -> Self {
        Self {
            error: Arc::new(error),
            request: None,
        }
    }

    pub fn with_request(error: SpiderError, request: Request) -> Self {
        Self {
            error: Arc::new(error),
            request: Some(request),
        }
    }

    pub fn error(&self) -> &SpiderError {
        &self.error
    }

    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    pub fn set_request(&mut self, request: Request) {
        self.request = Some(request);
    }

    pub fn take_request(&mut self) -> Option<Request> {
        self.request.take()
    }

    pub fn is_drop(&self) -> bool {
        self.error.is_drop()
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure")
            .field("error", &self.error)
            .field("request", &self.request.as_ref().map(|r| r.url().as_str()))
            .finish()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.request {
            Some(request) => write!(f, "{} ({})", self.error, request.url()),
            None => write!(f, "{}", self.error),
        }
    }
}

impl From<SpiderError> for Failure {
    fn from(error: SpiderError) -> Self {
        Failure::new(error)
    }
}

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
