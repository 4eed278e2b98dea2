//! Response cache keyed by request fingerprint.
//!
//! Storage sits behind [`CacheStorage`] so other backends can be plugged in
//! with [`HttpCacheMiddleware::with_storage`]. The default is an in-memory
//! `moka` cache bounded by `HTTPCACHE_MAX_ENTRIES`.

use crate::error::SpiderError;
use crate::middleware::{Hooks, Middleware, RequestAction, ResponseAction};
use crate::request::Request;
use crate::response::{Response, FLAG_CACHED};
use crate::settings::{Settings, HTTPCACHE_ENABLED, HTTPCACHE_IGNORE_HTTP_CODES, HTTPCACHE_MAX_ENTRIES};
use crate::stats::StatCollector;
use async_trait::async_trait;
use moka::sync::Cache;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};

/// Meta key that skips the cache for one request in both directions.
pub const META_DONT_CACHE: &str = "dont_cache";

pub trait CacheStorage: Send + Sync {
    fn retrieve(&self, request: &Request) -> Option<Response>;
    fn store(&self, request: &Request, response: &Response);
}

pub struct MemoryCacheStorage {
    entries: Cache<String, Response>,
}

impl MemoryCacheStorage {
    pub fn new(max_entries: u64) -> Self {
        Self {
            entries: Cache::builder().max_capacity(max_entries).build(),
        }
    }

    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStorage for MemoryCacheStorage {
    fn retrieve(&self, request: &Request) -> Option<Response> {
        self.entries.get(&request.fingerprint())
    }

    fn store(&self, request: &Request, response: &Response) {
        // Stored copies are detached from the request that produced them.
        let detached = Response::new(
            response.url().clone(),
            response.status(),
            response.headers().clone(),
            response.body().clone(),
        );
        self.entries.insert(request.fingerprint(), detached);
    }
}

pub struct HttpCacheMiddleware {
    storage: Arc<dyn CacheStorage>,
    ignore_codes: HashSet<u16>,
    stats: Arc<StatCollector>,
}

impl HttpCacheMiddleware {
    pub const NAME: &'static str = "HttpCacheMiddleware";

    pub fn with_storage(
        storage: Arc<dyn CacheStorage>,
        ignore_codes: impl IntoIterator<Item = u16>,
        stats: Arc<StatCollector>,
    ) -> Self {
        Self {
            storage,
            ignore_codes: ignore_codes.into_iter().collect(),
            stats,
        }
    }

    pub fn from_settings(settings: &Settings, stats: Arc<StatCollector>) -> Result<Self, SpiderError> {
        if !settings.get_bool_or(HTTPCACHE_ENABLED, false)? {
            return Err(SpiderError::NotConfigured("HTTPCACHE_ENABLED is off".to_string()));
        }
        let max_entries = settings.get_int_or(HTTPCACHE_MAX_ENTRIES, 10_000)?.max(1) as u64;
        Ok(Self::with_storage(
            Arc::new(MemoryCacheStorage::new(max_entries)),
            settings.get_status_codes(HTTPCACHE_IGNORE_HTTP_CODES)?,
            stats,
        ))
    }
}

#[async_trait]
impl Middleware for HttpCacheMiddleware {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn hooks(&self) -> Hooks {
        Hooks {
            request: true,
            response: true,
            failure: false,
        }
    }

    async fn process_request(&mut self, request: Request) -> Result<RequestAction, SpiderError> {
        if request.meta_flag(META_DONT_CACHE) == Some(true) {
            return Ok(RequestAction::Continue(request));
        }
        match self.storage.retrieve(&request) {
            Some(cached) => {
                debug!("Serving {} from cache", request);
                self.stats.increment_responses_from_cache();
                Ok(RequestAction::Respond(cached.with_flag(FLAG_CACHED).with_request(request)))
            }
            None => Ok(RequestAction::Continue(request)),
        }
    }

    async fn process_response(&mut self, response: Response) -> Result<ResponseAction, SpiderError> {
        if response.is_cached() {
            return Ok(ResponseAction::Continue(response));
        }
        let request = response.request()?;
        if request.meta_flag(META_DONT_CACHE) == Some(true)
            || self.ignore_codes.contains(&response.status().as_u16())
        {
            return Ok(ResponseAction::Continue(response));
        }
        trace!("Caching response for {}", request);
        self.storage.store(request, &response);
        Ok(ResponseAction::Continue(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsPriority;
    use reqwest::header::HeaderMap;

    fn enabled(ignore: &[u16]) -> (HttpCacheMiddleware, Arc<StatCollector>) {
        let mut settings = Settings::new();
        settings.set(SettingsPriority::Custom, HTTPCACHE_ENABLED, true);
        settings.set(SettingsPriority::Custom, HTTPCACHE_IGNORE_HTTP_CODES, ignore.to_vec());
        let stats = Arc::new(StatCollector::new());
        (HttpCacheMiddleware::from_settings(&settings, Arc::clone(&stats)).unwrap(), stats)
    }

    fn downloaded(request: &Request, status: u16, body: &'static str) -> Response {
        Response::from_status(request.url().clone(), status, HeaderMap::new(), body)
            .unwrap()
            .with_request(request.clone())
    }

    #[tokio::test]
    async fn test_serves_stored_responses() {
        let (mut cache, stats) = enabled(&[]);
        let request = Request::new("http://example.com/page").unwrap();

        assert!(matches!(cache.process_request(request.clone()).await.unwrap(), RequestAction::Continue(_)));
        cache.process_response(downloaded(&request, 200, "body")).await.unwrap();

        match cache.process_request(request.clone()).await.unwrap() {
            RequestAction::Respond(response) => {
                assert!(response.is_cached());
                assert_eq!(response.body().as_ref(), b"body");
                assert_eq!(response.request().unwrap().url(), request.url());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(stats.responses_from_cache(), 1);
    }

    #[tokio::test]
    async fn test_skips_ignored_codes_and_opt_outs() {
        let (mut cache, _) = enabled(&[404]);
        let missing = Request::new("http://example.com/missing").unwrap();
        cache.process_response(downloaded(&missing, 404, "")).await.unwrap();
        assert!(matches!(cache.process_request(missing).await.unwrap(), RequestAction::Continue(_)));

        let private = Request::builder("http://example.com/private")
            .meta(META_DONT_CACHE, true)
            .build()
            .unwrap();
        cache.process_response(downloaded(&private, 200, "secret")).await.unwrap();
        let plain = private.replace().remove_meta(META_DONT_CACHE).build().unwrap();
        assert!(matches!(cache.process_request(plain).await.unwrap(), RequestAction::Continue(_)));
    }

    #[test]
    fn test_memory_storage_detaches_request() {
        let storage = MemoryCacheStorage::new(10);
        let request = Request::new("http://example.com/").unwrap();
        storage.store(&request, &downloaded(&request, 200, "x"));

        assert_eq!(storage.len(), 1);
        assert!(!storage.retrieve(&request).unwrap().has_request());
    }

    #[test]
    fn test_disabled_by_default() {
        assert!(matches!(
            HttpCacheMiddleware::from_settings(&Settings::new(), Arc::new(StatCollector::new())),
            Err(SpiderError::NotConfigured(_))
        ));
    }
}
