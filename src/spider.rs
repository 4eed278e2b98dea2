//! # Spider Module
//!
//! Defines the `Spider` trait that supplies the crawl's start requests and
//! consumes its responses.
//!
//! ## Overview
//!
//! A spider names the crawl, optionally contributes a settings layer, emits the
//! start requests and parses every response whose request carries no callback
//! of its own. Failures without an errback reach [`Spider::handle_failure`],
//! which logs them by default.
//!
//! The engine owns the spider and calls it from its own task, so `parse` may
//! freely mutate spider state. Before the crawl starts the spider receives an
//! [`EngineHandle`] it can keep to pause or stop the engine later.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::prelude::*;
//!
//! struct QuotesSpider;
//!
//! #[async_trait]
//! impl Spider for QuotesSpider {
//!     fn name(&self) -> &str {
//!         "quotes"
//!     }
//!
//!     fn start_urls(&self) -> Vec<&'static str> {
//!         vec!["https://quotes.toscrape.com/"]
//!     }
//!
//!     async fn parse(&mut self, response: Response) -> Result<ParseOutput, SpiderError> {
//!         let mut output = ParseOutput::new();
//!         // ... inspect response.text() and queue follow-ups ...
//!         output.add_request(Request::new("https://quotes.toscrape.com/page/2/")?);
//!         Ok(output)
//!     }
//! }
//! ```

use crate::engine::EngineHandle;
use crate::error::{Failure, SpiderError};
use crate::request::Request;
use crate::response::Response;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;

/// Requests produced by a callback, errback or `parse`.
#[derive(Debug, Default)]
pub struct ParseOutput {
    requests: Vec<Request>,
}

impl ParseOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request(mut self, request: Request) -> Self {
        self.requests.push(request);
        self
    }

    pub fn add_request(&mut self, request: Request) {
        self.requests.push(request);
    }

    pub fn add_requests(&mut self, requests: impl IntoIterator<Item = Request>) {
        self.requests.extend(requests);
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn into_requests(self) -> Vec<Request> {
        self.requests
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

impl From<Vec<Request>> for ParseOutput {
    fn from(requests: Vec<Request>) -> Self {
        Self { requests }
    }
}

/// Defines the contract for a spider.
#[async_trait]
pub trait Spider: Send + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Settings applied at spider priority, above the module layer.
    fn settings(&self) -> Option<Map<String, Value>> {
        None
    }

    /// Returns the initial URLs to start crawling from.
    fn start_urls(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Generates the initial requests; defaults to a GET for each start URL.
    fn start_requests(&mut self) -> Result<Vec<Request>, SpiderError> {
        self.start_urls().into_iter().map(Request::new).collect()
    }

    /// Receives a handle to the engine running this spider.
    fn set_engine(&mut self, _engine: EngineHandle) {}

    /// Parses a response whose request has no callback.
    async fn parse(&mut self, response: Response) -> Result<ParseOutput, SpiderError>;

    /// Handles a failure whose request has no errback.
    async fn handle_failure(&mut self, failure: Failure) -> Result<ParseOutput, SpiderError> {
        warn!("[{}] Unhandled failure: {}", self.name(), failure);
        Ok(ParseOutput::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StartOnly;

    #[async_trait]
    impl Spider for StartOnly {
        fn name(&self) -> &str {
            "start_only"
        }

        fn start_urls(&self) -> Vec<&'static str> {
            vec!["http://example.com/a", "http://example.com/b"]
        }

        async fn parse(&mut self, _response: Response) -> Result<ParseOutput, SpiderError> {
            Ok(ParseOutput::new())
        }
    }

    struct BadStart;

    #[async_trait]
    impl Spider for BadStart {
        fn name(&self) -> &str {
            "bad_start"
        }

        fn start_urls(&self) -> Vec<&'static str> {
            vec!["not a url"]
        }

        async fn parse(&mut self, _response: Response) -> Result<ParseOutput, SpiderError> {
            Ok(ParseOutput::new())
        }
    }

    #[test]
    fn test_default_start_requests() {
        let requests = StartOnly.start_requests().unwrap();
        let urls: Vec<&str> = requests.iter().map(|r| r.url().as_str()).collect();
        assert_eq!(urls, vec!["http://example.com/a", "http://example.com/b"]);
        assert!(StartOnly.settings().is_none());
    }

    #[test]
    fn test_invalid_start_url() {
        assert!(matches!(BadStart.start_requests(), Err(SpiderError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn test_default_failure_handler_yields_nothing() {
        let failure = Failure::new(SpiderError::Timeout {
            url: "http://example.com/".into(),
        });
        let output = StartOnly.handle_failure(failure).await.unwrap();
        assert!(output.is_empty());
    }

    #[test]
    fn test_parse_output_collects_requests() {
        let mut output = ParseOutput::new().with_request(Request::new("http://example.com/1").unwrap());
        output.add_requests(vec![Request::new("http://example.com/2").unwrap()]);
        assert_eq!(output.len(), 2);
        assert_eq!(output.into_requests()[1].url().path(), "/2");
    }
}
