//! The [`Request`] descriptor and its builder.
//!
//! A request is immutable once built. Middlewares that need a different
//! request derive one through [`Request::replace`], which copies every field
//! and lets the caller override a subset before validating again.

use crate::error::{Failure, SpiderError};
use crate::response::Response;
use crate::spider::ParseOutput;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Future returned by request callbacks and errbacks.
pub type CallbackFuture = BoxFuture<'static, Result<ParseOutput, SpiderError>>;

/// Invoked with the final response of a request.
pub type Callback = Arc<dyn Fn(Response) -> CallbackFuture + Send + Sync>;

/// Invoked with the failure of a request.
pub type Errback = Arc<dyn Fn(Failure) -> CallbackFuture + Send + Sync>;

/// Free-form per-request state shared between middlewares.
pub type Meta = HashMap<String, Value>;

#[derive(Clone)]
pub struct Request {
    url: Url,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
    meta: Meta,
    priority: i32,
    history: Vec<Url>,
    proxy: Option<Url>,
    callback: Option<Callback>,
    errback: Option<Errback>,
    encoding: String,
}

impl Request {
    /// Builds a GET request for `url`.
    pub fn new(url: &str) -> Result<Self, SpiderError> {
        Self::builder(url).build()
    }

    /// Builds a GET request from an already parsed URL.
    pub fn from_url(url: Url) -> Result<Self, SpiderError> {
        RequestBuilder::from_parsed(url).build()
    }

    pub fn builder(url: &str) -> RequestBuilder {
        RequestBuilder::new(url)
    }

    /// Returns a builder seeded with a copy of every field of this request.
    pub fn replace(&self) -> RequestBuilder {
        RequestBuilder {
            url: Ok(self.url.clone()),
            method: self.method.as_str().to_string(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            meta: self.meta.clone(),
            priority: self.priority,
            history: self.history.clone(),
            proxy: self.proxy.clone(),
            callback: self.callback.clone(),
            errback: self.errback.clone(),
            encoding: self.encoding.clone(),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn history(&self) -> &[Url] {
        &self.history
    }

    pub fn proxy(&self) -> Option<&Url> {
        self.proxy.as_ref()
    }

    pub fn callback(&self) -> Option<&Callback> {
        self.callback.as_ref()
    }

    pub fn errback(&self) -> Option<&Errback> {
        self.errback.as_ref()
    }

    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    /// Host used to partition traffic, if the URL has one.
    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }

    /// Reads a boolean flag from meta; absent or non-boolean values yield `None`.
    pub fn meta_flag(&self, key: &str) -> Option<bool> {
        match self.meta.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_i64().map(|v| v != 0),
            Value::Null => Some(false),
            _ => None,
        }
    }

    /// Stable hash of the request's effective identity.
    pub fn fingerprint(&self) -> String {
        self.fingerprint_with_headers(&[])
    }

    /// Like [`fingerprint`](Self::fingerprint) but also mixes in the named headers.
    pub fn fingerprint_with_headers(&self, include_headers: &[&str]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.method.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(canonicalize_url(&self.url).as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(&self.body);

        let mut names: Vec<String> = include_headers.iter().map(|h| h.to_ascii_lowercase()).collect();
        names.sort();
        names.dedup();
        for name in names {
            hasher.update(b"\n");
            hasher.update(name.as_bytes());
            for value in self.headers.get_all(name.as_str()) {
                hasher.update(b":");
                hasher.update(value.as_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }
}

/// Canonical form used for fingerprints: sorted query pairs, no fragment.
pub fn canonicalize_url(url: &Url) -> Url {
    let mut canonical = url.clone();
    canonical.set_fragment(None);
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        canonical.set_query(None);
    } else {
        pairs.sort();
        canonical.query_pairs_mut().clear().extend_pairs(pairs);
    }
    canonical
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("priority", &self.priority)
            .field("meta", &self.meta)
            .field("history", &self.history.len())
            .field("callback", &self.callback.is_some())
            .field("errback", &self.errback.is_some())
            .finish()
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {}>", self.method, self.url)
    }
}

/// Fluent constructor for [`Request`]; validation happens in [`build`](Self::build).
pub struct RequestBuilder {
    url: Result<Url, SpiderError>,
    method: String,
    headers: HeaderMap,
    body: Bytes,
    meta: Meta,
    priority: i32,
    history: Vec<Url>,
    proxy: Option<Url>,
    callback: Option<Callback>,
    errback: Option<Errback>,
    encoding: String,
}

impl RequestBuilder {
    pub fn new(url: &str) -> Self {
        let parsed = Url::parse(url).map_err(|e| SpiderError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        });
        Self::with_url_result(parsed)
    }

    fn from_parsed(url: Url) -> Self {
        Self::with_url_result(Ok(url))
    }

    fn with_url_result(url: Result<Url, SpiderError>) -> Self {
        Self {
            url,
            method: "GET".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            meta: Meta::new(),
            priority: 0,
            history: Vec::new(),
            proxy: None,
            callback: None,
            errback: None,
            encoding: "utf-8".to_string(),
        }
    }

    pub fn url(mut self, url: &str) -> Self {
        self.url = Url::parse(url).map_err(|e| SpiderError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        });
        self
    }

    pub fn parsed_url(mut self, url: Url) -> Self {
        self.url = Ok(url);
        self
    }

    pub fn method(mut self, method: &str) -> Self {
        self.method = method.to_string();
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn remove_meta(mut self, key: &str) -> Self {
        self.meta.remove(key);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn history(mut self, history: Vec<Url>) -> Self {
        self.history = history;
        self
    }

    pub fn proxy(mut self, proxy: Option<Url>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(Response) -> CallbackFuture + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn errback<F>(mut self, errback: F) -> Self
    where
        F: Fn(Failure) -> CallbackFuture + Send + Sync + 'static,
    {
        self.errback = Some(Arc::new(errback));
        self
    }

    pub fn encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    pub fn build(self) -> Result<Request, SpiderError> {
        let url = self.url?;
        if url.host().is_none() && url.path().is_empty() {
            return Err(SpiderError::InvalidUrl {
                url: url.to_string(),
                reason: "URL needs a host or a path".to_string(),
            });
        }
        let method = Method::from_bytes(self.method.to_ascii_uppercase().as_bytes()).map_err(|_| {
            SpiderError::Configuration(format!("invalid HTTP method `{}`", self.method))
        })?;

        Ok(Request {
            url,
            method,
            headers: self.headers,
            body: self.body,
            meta: self.meta,
            priority: self.priority,
            history: self.history,
            proxy: self.proxy,
            callback: self.callback,
            errback: self.errback,
            encoding: self.encoding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::USER_AGENT;

    #[test]
    fn test_method_is_uppercased() {
        let request = Request::builder("http://example.com/").method("post").build().unwrap();
        assert_eq!(*request.method(), Method::POST);
    }

    #[test]
    fn test_url_is_percent_encoded() {
        let request = Request::new("http://example.com/a b?q=ü").unwrap();
        assert_eq!(request.url().as_str(), "http://example.com/a%20b?q=%C3%BC");
    }

    #[test]
    fn test_rejects_url_without_scheme() {
        assert!(matches!(
            Request::new("example.com/page"),
            Err(SpiderError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_rejects_url_without_host_or_path() {
        assert!(matches!(
            Request::new("mailto:"),
            Err(SpiderError::InvalidUrl { .. })
        ));
        assert!(Request::new("file:///tmp/page.html").is_ok());
    }

    #[test]
    fn test_replace_overrides_only_given_fields() {
        let original = Request::builder("http://example.com/")
            .header(USER_AGENT, HeaderValue::from_static("test"))
            .meta("depth", 2)
            .priority(5)
            .history(vec![Url::parse("http://example.com/old").unwrap()])
            .body("payload")
            .build()
            .unwrap();

        let replaced = original.replace().method("POST").build().unwrap();

        assert_eq!(*replaced.method(), Method::POST);
        assert_eq!(*original.method(), Method::GET);
        assert_eq!(replaced.url(), original.url());
        assert_eq!(replaced.headers(), original.headers());
        assert_eq!(replaced.body(), original.body());
        assert_eq!(replaced.meta(), original.meta());
        assert_eq!(replaced.priority(), original.priority());
        assert_eq!(replaced.history(), original.history());
        assert_eq!(replaced.encoding(), original.encoding());
    }

    #[test]
    fn test_replace_copies_are_independent() {
        let original = Request::builder("http://example.com/").meta("a", 1).build().unwrap();
        let replaced = original.replace().meta("b", 2).build().unwrap();

        assert!(original.meta().get("b").is_none());
        assert_eq!(replaced.meta().get("a"), Some(&Value::from(1)));
    }

    #[test]
    fn test_fingerprint_ignores_query_order_and_fragment() {
        let a = Request::new("http://example.com/?b=2&a=1#top").unwrap();
        let b = Request::new("http://example.com/?a=1&b=2").unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let post = a.replace().method("POST").build().unwrap();
        assert_ne!(a.fingerprint(), post.fingerprint());
    }

    #[test]
    fn test_fingerprint_with_headers() {
        let a = Request::builder("http://example.com/")
            .header(USER_AGENT, HeaderValue::from_static("one"))
            .build()
            .unwrap();
        let b = a
            .replace()
            .headers(HeaderMap::new())
            .header(USER_AGENT, HeaderValue::from_static("two"))
            .build()
            .unwrap();

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(
            a.fingerprint_with_headers(&["User-Agent"]),
            b.fingerprint_with_headers(&["User-Agent"])
        );
    }

    #[test]
    fn test_meta_flag() {
        let request = Request::builder("http://example.com/")
            .meta("dont_filter", true)
            .meta("off", 0)
            .meta("name", "x")
            .build()
            .unwrap();
        assert_eq!(request.meta_flag("dont_filter"), Some(true));
        assert_eq!(request.meta_flag("off"), Some(false));
        assert_eq!(request.meta_flag("name"), None);
        assert_eq!(request.meta_flag("missing"), None);
    }
}
