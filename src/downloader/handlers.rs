//! # Download Handlers
//!
//! Scheme-specific transports used by the downloader.
//!
//! ## Overview
//!
//! A [`DownloadHandler`] turns one [`Request`] into one [`Response`] or an
//! error. The [`HandlerRegistry`] dispatches on the URL scheme and is itself a
//! handler, so the downloader only ever talks to the registry.
//!
//! Handlers are built from settings through factories. A factory that returns
//! [`SpiderError::NotConfigured`] makes its scheme unavailable without failing
//! the build, and `DOWNLOAD_HANDLERS = { "<scheme>": null }` switches a scheme
//! off explicitly. Requests for schemes without a handler fail with
//! [`SpiderError::UnsupportedScheme`].
//!
//! ## Built-in handlers
//!
//! - [`FileHandler`]: `file://` URLs read through `tokio::fs`
//! - [`HttpHandler`]: `http://` and `https://` through `reqwest`, with one
//!   client per proxy, `DOWNLOAD_TIMEOUT` and a streamed `DOWNLOAD_MAXSIZE` check

use crate::error::SpiderError;
use crate::request::Request;
use crate::response::Response;
use crate::settings::{Settings, DOWNLOAD_HANDLERS, DOWNLOAD_MAXSIZE, DOWNLOAD_TIMEOUT};
use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::DashMap;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH};
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use url::Url;

/// Meta key overriding `DOWNLOAD_TIMEOUT` for one request, in seconds.
pub const META_DOWNLOAD_TIMEOUT: &str = "download_timeout";
/// Meta key overriding `DOWNLOAD_MAXSIZE` for one request, in bytes.
pub const META_DOWNLOAD_MAXSIZE: &str = "download_maxsize";

/// Performs the transfer for one request.
#[async_trait]
pub trait DownloadHandler: Send + Sync {
    async fn download(&self, request: &Request) -> Result<Response, SpiderError>;
}

/// Per-scheme handler table.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn DownloadHandler>>,
    unavailable: HashMap<String, String>,
    disabled: HashSet<String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the registry with the built-in `file`, `http` and `https` handlers.
    pub fn from_settings(settings: &Settings) -> Result<Self, SpiderError> {
        let mut registry = Self::new();
        for (scheme, value) in settings.get_map_or(DOWNLOAD_HANDLERS, Map::new())? {
            match value {
                Value::Null => {
                    registry.disabled.insert(scheme.to_ascii_lowercase());
                }
                other => {
                    return Err(SpiderError::Configuration(format!(
                        "DOWNLOAD_HANDLERS entries may only disable a scheme with null, got {} for `{}`",
                        other, scheme
                    )))
                }
            }
        }

        registry.register_factory("file", settings, |s| Ok(Arc::new(FileHandler::from_settings(s)?)))?;

        let http: Result<Arc<dyn DownloadHandler>, SpiderError> =
            HttpHandler::from_settings(settings).map(|h| Arc::new(h) as Arc<dyn DownloadHandler>);
        for scheme in ["http", "https"] {
            let http = match &http {
                Ok(handler) => Ok(Arc::clone(handler)),
                Err(SpiderError::NotConfigured(reason)) => Err(SpiderError::NotConfigured(reason.clone())),
                Err(e) => return Err(SpiderError::Configuration(e.to_string())),
            };
            registry.register_factory(scheme, settings, move |_| http)?;
        }
        Ok(registry)
    }

    /// Registers the handler produced by `factory`, unless the scheme is disabled
    /// or the factory opts out with `NotConfigured`.
    pub fn register_factory<F>(&mut self, scheme: &str, settings: &Settings, factory: F) -> Result<(), SpiderError>
    where
        F: FnOnce(&Settings) -> Result<Arc<dyn DownloadHandler>, SpiderError>,
    {
        let scheme = scheme.to_ascii_lowercase();
        if self.disabled.contains(&scheme) {
            debug!("Download handler for scheme `{}` disabled by settings", scheme);
            self.handlers.remove(&scheme);
            self.unavailable.insert(scheme, "disabled by DOWNLOAD_HANDLERS".to_string());
            return Ok(());
        }
        match factory(settings) {
            Ok(handler) => {
                trace!("Registered download handler for scheme `{}`", scheme);
                self.unavailable.remove(&scheme);
                self.handlers.insert(scheme, handler);
                Ok(())
            }
            Err(SpiderError::NotConfigured(reason)) => {
                debug!("Download handler for scheme `{}` not configured: {}", scheme, reason);
                self.unavailable.insert(scheme, reason);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Registers `handler` for `scheme`, replacing any existing one.
    pub fn register(&mut self, scheme: &str, handler: Arc<dyn DownloadHandler>) {
        let scheme = scheme.to_ascii_lowercase();
        self.unavailable.remove(&scheme);
        self.handlers.insert(scheme, handler);
    }

    pub fn supports(&self, scheme: &str) -> bool {
        self.handlers.contains_key(&scheme.to_ascii_lowercase())
    }

    /// Reason a scheme has no handler, when it was skipped during setup.
    pub fn unavailable_reason(&self, scheme: &str) -> Option<&str> {
        self.unavailable.get(&scheme.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }
}

#[async_trait]
impl DownloadHandler for HandlerRegistry {
    async fn download(&self, request: &Request) -> Result<Response, SpiderError> {
        let scheme = request.url().scheme();
        match self.handlers.get(scheme) {
            Some(handler) => handler.download(request).await,
            None => {
                let reason = self.unavailable_reason(scheme).unwrap_or("no handler registered");
                debug!("Cannot download {}: scheme `{}` unavailable ({})", request.url(), scheme, reason);
                Err(SpiderError::UnsupportedScheme(scheme.to_string()))
            }
        }
    }
}

/// Reads a size limit in bytes; zero means unlimited.
fn max_size_from(settings: &Settings) -> Result<u64, SpiderError> {
    Ok(settings.get_int_or(DOWNLOAD_MAXSIZE, 0)?.max(0) as u64)
}

fn request_max_size(request: &Request, default: u64) -> u64 {
    request
        .meta()
        .get(META_DOWNLOAD_MAXSIZE)
        .and_then(Value::as_u64)
        .unwrap_or(default)
}

/// Serves `file://` URLs from the local filesystem.
#[derive(Debug, Clone)]
pub struct FileHandler {
    max_size: u64,
}

impl FileHandler {
    pub fn new(max_size: u64) -> Self {
        Self { max_size }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, SpiderError> {
        Ok(Self::new(max_size_from(settings)?))
    }
}

#[async_trait]
impl DownloadHandler for FileHandler {
    async fn download(&self, request: &Request) -> Result<Response, SpiderError> {
        let url = request.url();
        let path = url.to_file_path().map_err(|_| SpiderError::InvalidUrl {
            url: url.to_string(),
            reason: "not a local file path".to_string(),
        })?;

        let max_size = request_max_size(request, self.max_size);
        let metadata = tokio::fs::metadata(&path).await?;
        if max_size > 0 && metadata.len() > max_size {
            return Err(SpiderError::SizeExceeded {
                url: url.to_string(),
                limit: max_size,
            });
        }

        let body = tokio::fs::read(&path).await?;
        trace!("Read {} bytes from {}", body.len(), path.display());
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
        Ok(Response::new(url.clone(), StatusCode::OK, headers, body))
    }
}

/// Fetches `http(s)://` URLs with `reqwest`.
///
/// Redirects are never followed here; the redirect middleware owns them.
pub struct HttpHandler {
    timeout: Duration,
    max_size: u64,
    clients: DashMap<Option<String>, Client>,
}

impl HttpHandler {
    pub fn new(timeout: Duration, max_size: u64) -> Self {
        Self {
            timeout,
            max_size,
            clients: DashMap::new(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, SpiderError> {
        let timeout = settings.get_float_or(DOWNLOAD_TIMEOUT, 180.0)?;
        if !timeout.is_finite() || timeout <= 0.0 {
            return Err(SpiderError::Configuration(format!(
                "DOWNLOAD_TIMEOUT must be positive, got {}",
                timeout
            )));
        }
        Ok(Self::new(Duration::from_secs_f64(timeout), max_size_from(settings)?))
    }

    /// Returns the client for `proxy`, building and caching it on first use.
    fn client_for(&self, proxy: Option<&Url>) -> Result<Client, SpiderError> {
        let key = proxy.map(Url::to_string);
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .timeout(self.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .gzip(true);
        builder = match proxy {
            Some(proxy) => builder.proxy(
                reqwest::Proxy::all(proxy.as_str())
                    .map_err(|e| SpiderError::Configuration(format!("invalid proxy {}: {}", proxy, e)))?,
            ),
            None => builder.no_proxy(),
        };
        let client = builder
            .build()
            .map_err(|e| SpiderError::Configuration(format!("failed to build HTTP client: {}", e)))?;

        debug!("Built HTTP client for proxy {:?}", key);
        self.clients.insert(key, client.clone());
        Ok(client)
    }

    pub fn cached_clients(&self) -> usize {
        self.clients.len()
    }
}

fn map_reqwest_error(url: &Url, error: reqwest::Error) -> SpiderError {
    if error.is_timeout() {
        SpiderError::Timeout { url: url.to_string() }
    } else {
        SpiderError::Network {
            url: url.to_string(),
            message: error.to_string(),
        }
    }
}

#[async_trait]
impl DownloadHandler for HttpHandler {
    async fn download(&self, request: &Request) -> Result<Response, SpiderError> {
        let url = request.url();
        let client = self.client_for(request.proxy())?;
        let max_size = request_max_size(request, self.max_size);

        let mut builder = client
            .request(request.method().clone(), url.clone())
            .headers(request.headers().clone());
        if !request.body().is_empty() {
            builder = builder.body(request.body().clone());
        }
        if let Some(secs) = request.meta().get(META_DOWNLOAD_TIMEOUT).and_then(Value::as_f64) {
            if secs.is_finite() && secs > 0.0 {
                builder = builder.timeout(Duration::from_secs_f64(secs));
            }
        }

        trace!("Sending {} {}", request.method(), url);
        let response = builder.send().await.map_err(|e| map_reqwest_error(url, e))?;

        if max_size > 0 {
            if let Some(length) = response.content_length() {
                if length > max_size {
                    debug!("Rejecting {}: Content-Length {} over limit {}", url, length, max_size);
                    return Err(SpiderError::SizeExceeded {
                        url: url.to_string(),
                        limit: max_size,
                    });
                }
            }
        }

        let status = response.status();
        let headers = response.headers().clone();
        let final_url = response.url().clone();

        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_reqwest_error(url, e))?;
            body.extend_from_slice(&chunk);
            if max_size > 0 && body.len() as u64 > max_size {
                return Err(SpiderError::SizeExceeded {
                    url: url.to_string(),
                    limit: max_size,
                });
            }
        }

        Ok(Response::new(final_url, status, headers, body.freeze()))
    }
}
