//! The [`Response`] produced by download handlers or short-circuiting middlewares.

use crate::error::{Failure, SpiderError};
use crate::request::{Meta, Request};
use bytes::Bytes;
use encoding_rs::{Encoding, UTF_8};
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::StatusCode;
use std::borrow::Cow;
use std::fmt;
use url::Url;

/// Flag attached to responses served from the HTTP cache.
pub const FLAG_CACHED: &str = "cached";

#[derive(Clone)]
pub struct Response {
    url: Url,
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    request: Option<Request>,
    flags: Vec<String>,
}

impl Response {
    pub fn new(url: Url, status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            headers,
            body: body.into(),
            request: None,
            flags: Vec::new(),
        }
    }

    /// Builds a response from a raw status number, rejecting invalid codes.
    pub fn from_status(url: Url, status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Result<Self, SpiderError> {
        let status = StatusCode::from_u16(status).map_err(|_| {
            SpiderError::ContractViolation(format!("invalid HTTP status {} for {}", status, url))
        })?;
        Ok(Self::new(url, status, headers, body))
    }

    pub fn with_request(mut self, request: Request) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.add_flag(flag);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn flags(&self) -> &[String] {
        &self.flags
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    pub fn add_flag(&mut self, flag: impl Into<String>) {
        let flag = flag.into();
        if !self.has_flag(&flag) {
            self.flags.push(flag);
        }
    }

    pub fn is_cached(&self) -> bool {
        self.has_flag(FLAG_CACHED)
    }

    /// The request that produced this response.
    pub fn request(&self) -> Result<&Request, SpiderError> {
        self.request.as_ref().ok_or_else(|| {
            SpiderError::ContractViolation(format!("response for {} has no request attached", self.url))
        })
    }

    pub fn has_request(&self) -> bool {
        self.request.is_some()
    }

    pub fn set_request(&mut self, request: Request) {
        self.request = Some(request);
    }

    pub fn meta(&self) -> Result<&Meta, SpiderError> {
        Ok(self.request()?.meta())
    }

    pub fn history(&self) -> Result<&[Url], SpiderError> {
        Ok(self.request()?.history())
    }

    /// URL of the request that started the chain leading to this response.
    pub fn original_url(&self) -> Result<&Url, SpiderError> {
        let request = self.request()?;
        Ok(request.history().first().unwrap_or(request.url()))
    }

    /// Resolves the body encoding: `Content-Type` charset, then BOM, then the
    /// request's declared encoding, then UTF-8.
    pub fn encoding(&self) -> &'static Encoding {
        if let Some(encoding) = self.header_encoding() {
            return encoding;
        }
        if let Some((encoding, _)) = Encoding::for_bom(&self.body) {
            return encoding;
        }
        self.request
            .as_ref()
            .and_then(|r| Encoding::for_label(r.encoding().as_bytes()))
            .unwrap_or(UTF_8)
    }

    /// Decoded text view of the body.
    pub fn text(&self) -> Cow<'_, str> {
        let encoding = self.encoding();
        match Encoding::for_bom(&self.body) {
            Some((bom_encoding, bom_len)) if bom_encoding == encoding => {
                encoding.decode_without_bom_handling(&self.body[bom_len..]).0
            }
            _ => encoding.decode_without_bom_handling(&self.body).0,
        }
    }

    fn header_encoding(&self) -> Option<&'static Encoding> {
        let content_type = self.headers.get(CONTENT_TYPE)?.to_str().ok()?;
        content_type
            .split(';')
            .filter_map(|part| {
                let (key, value) = part.trim().split_once('=')?;
                key.trim().eq_ignore_ascii_case("charset").then(|| value.trim().trim_matches('"'))
            })
            .find_map(|label| Encoding::for_label(label.as_bytes()))
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url.as_str())
            .field("status", &self.status.as_u16())
            .field("body_len", &self.body.len())
            .field("flags", &self.flags)
            .field("has_request", &self.request.is_some())
            .finish()
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {}>", self.status.as_u16(), self.url)
    }
}

/// Result of downloading a request, travelling the response direction of the pipeline.
#[derive(Debug, Clone)]
pub enum Outcome {
    Response(Response),
    Failure(Failure),
}

impl Outcome {
    pub fn request(&self) -> Option<&Request> {
        match self {
            Outcome::Response(response) => response.request.as_ref(),
            Outcome::Failure(failure) => failure.request(),
        }
    }

    pub fn set_request(&mut self, request: Request) {
        match self {
            Outcome::Response(response) => response.set_request(request),
            Outcome::Failure(failure) => failure.set_request(request),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }
}

impl From<Response> for Outcome {
    fn from(response: Response) -> Self {
        Outcome::Response(response)
    }
}

impl From<Failure> for Outcome {
    fn from(failure: Failure) -> Self {
        Outcome::Failure(failure)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Response(response) => write!(f, "{}", response),
            Outcome::Failure(failure) => write!(f, "{}", failure),
        }
    }
}
