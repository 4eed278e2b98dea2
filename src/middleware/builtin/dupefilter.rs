use super::META_DONT_FILTER;
use crate::error::SpiderError;
use crate::middleware::{Hooks, Middleware, RequestAction};
use crate::request::Request;
use crate::settings::{Settings, DUPEFILTER_CAPACITY};
use async_trait::async_trait;
use moka::sync::Cache;
use tracing::debug;

/// Drops requests whose fingerprint has already been seen.
///
/// Fingerprints live in a bounded `moka` cache, so on very large crawls the
/// oldest ones are eventually forgotten. Requests with `dont_filter: true` in
/// their meta are always let through and not recorded.
pub struct DuplicateFilterMiddleware {
    seen: Cache<String, ()>,
}

impl DuplicateFilterMiddleware {
    pub const NAME: &'static str = "DuplicateFilterMiddleware";

    pub fn new(capacity: u64) -> Self {
        Self {
            seen: Cache::builder().max_capacity(capacity).build(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, SpiderError> {
        let capacity = settings.get_int_or(DUPEFILTER_CAPACITY, 1_000_000)?;
        if capacity <= 0 {
            return Err(SpiderError::NotConfigured("DUPEFILTER_CAPACITY is zero".to_string()));
        }
        Ok(Self::new(capacity as u64))
    }

    /// Records `request` and returns whether it had been seen before.
    pub fn request_seen(&self, request: &Request) -> bool {
        let fingerprint = request.fingerprint();
        if self.seen.contains_key(&fingerprint) {
            return true;
        }
        self.seen.insert(fingerprint, ());
        false
    }
}

#[async_trait]
impl Middleware for DuplicateFilterMiddleware {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn hooks(&self) -> Hooks {
        Hooks::REQUEST
    }

    async fn process_request(&mut self, request: Request) -> Result<RequestAction, SpiderError> {
        if request.meta_flag(META_DONT_FILTER) == Some(true) {
            return Ok(RequestAction::Continue(request));
        }
        if self.request_seen(&request) {
            debug!("Filtered duplicate request: {}", request);
            return Ok(RequestAction::Drop);
        }
        Ok(RequestAction::Continue(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drops_repeated_fingerprints() {
        let mut filter = DuplicateFilterMiddleware::new(100);
        let first = Request::new("http://example.com/?a=1&b=2").unwrap();
        let same = Request::new("http://example.com/?b=2&a=1#frag").unwrap();
        let other = Request::new("http://example.com/other").unwrap();

        assert!(matches!(filter.process_request(first).await.unwrap(), RequestAction::Continue(_)));
        assert!(matches!(filter.process_request(same).await.unwrap(), RequestAction::Drop));
        assert!(matches!(filter.process_request(other).await.unwrap(), RequestAction::Continue(_)));
    }

    #[tokio::test]
    async fn test_dont_filter_bypasses() {
        let mut filter = DuplicateFilterMiddleware::new(100);
        let request = Request::builder("http://example.com/")
            .meta(META_DONT_FILTER, true)
            .build()
            .unwrap();

        for _ in 0..3 {
            let action = filter.process_request(request.clone()).await.unwrap();
            assert!(matches!(action, RequestAction::Continue(_)));
        }
        let plain = Request::new("http://example.com/").unwrap();
        assert!(matches!(filter.process_request(plain).await.unwrap(), RequestAction::Continue(_)));
    }
}
