//! Built-in middlewares and the factory table used by `PIPELINE_BASE` / `PIPELINE`.

mod default_headers;
mod dupefilter;
mod httpcache;
mod redirect;
mod retry;

pub use default_headers::DefaultHeadersMiddleware;
pub use dupefilter::DuplicateFilterMiddleware;
pub use httpcache::{CacheStorage, HttpCacheMiddleware, MemoryCacheStorage};
pub use redirect::RedirectMiddleware;
pub use retry::RetryMiddleware;

use super::{Middleware, MiddlewareFactory};
use crate::error::SpiderError;
use crate::settings::Settings;
use crate::stats::StatCollector;
use std::sync::Arc;

/// Meta key that bypasses the duplicate filter; retries and redirects set it.
pub const META_DONT_FILTER: &str = "dont_filter";

pub const BUILTIN_NAMES: [&str; 5] = [
    DuplicateFilterMiddleware::NAME,
    DefaultHeadersMiddleware::NAME,
    RetryMiddleware::NAME,
    RedirectMiddleware::NAME,
    HttpCacheMiddleware::NAME,
];

/// Looks up the factory for a built-in middleware name.
pub fn factory(name: &str) -> Option<MiddlewareFactory> {
    let factory: MiddlewareFactory = match name {
        DuplicateFilterMiddleware::NAME => build_dupefilter,
        DefaultHeadersMiddleware::NAME => build_default_headers,
        RetryMiddleware::NAME => build_retry,
        RedirectMiddleware::NAME => build_redirect,
        HttpCacheMiddleware::NAME => build_httpcache,
        _ => return None,
    };
    Some(factory)
}

fn build_dupefilter(settings: &Settings, _: &Arc<StatCollector>) -> Result<Box<dyn Middleware>, SpiderError> {
    Ok(Box::new(DuplicateFilterMiddleware::from_settings(settings)?))
}

fn build_default_headers(settings: &Settings, _: &Arc<StatCollector>) -> Result<Box<dyn Middleware>, SpiderError> {
    Ok(Box::new(DefaultHeadersMiddleware::from_settings(settings)?))
}

fn build_retry(settings: &Settings, stats: &Arc<StatCollector>) -> Result<Box<dyn Middleware>, SpiderError> {
    Ok(Box::new(RetryMiddleware::from_settings(settings, Arc::clone(stats))?))
}

fn build_redirect(settings: &Settings, stats: &Arc<StatCollector>) -> Result<Box<dyn Middleware>, SpiderError> {
    Ok(Box::new(RedirectMiddleware::from_settings(settings, Arc::clone(stats))?))
}

fn build_httpcache(settings: &Settings, stats: &Arc<StatCollector>) -> Result<Box<dyn Middleware>, SpiderError> {
    Ok(Box::new(HttpCacheMiddleware::from_settings(settings, Arc::clone(stats))?))
}
