use crate::error::SpiderError;
use crate::middleware::{Hooks, Middleware, ResponseAction};
use crate::response::Response;
use crate::settings::{Settings, REDIRECT_ENABLED, REDIRECT_MAX_TIMES};
use crate::stats::StatCollector;
use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Meta key counting the redirects followed so far.
pub const META_REDIRECT_TIMES: &str = "redirect_times";
/// Meta key disabling redirect handling for one request.
pub const META_DONT_REDIRECT: &str = "dont_redirect";

/// Follows 3xx responses that carry a `Location` header.
pub struct RedirectMiddleware {
    max_times: u64,
    stats: Arc<StatCollector>,
}

impl RedirectMiddleware {
    pub const NAME: &'static str = "RedirectMiddleware";

    pub fn from_settings(settings: &Settings, stats: Arc<StatCollector>) -> Result<Self, SpiderError> {
        if !settings.get_bool_or(REDIRECT_ENABLED, true)? {
            return Err(SpiderError::NotConfigured("REDIRECT_ENABLED is off".to_string()));
        }
        Ok(Self {
            max_times: settings.get_int_or(REDIRECT_MAX_TIMES, 20)?.max(0) as u64,
            stats,
        })
    }

    fn is_redirect(status: StatusCode) -> bool {
        matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
    }
}

#[async_trait]
impl Middleware for RedirectMiddleware {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn hooks(&self) -> Hooks {
        Hooks {
            request: false,
            response: true,
            failure: false,
        }
    }

    async fn process_response(&mut self, response: Response) -> Result<ResponseAction, SpiderError> {
        let request = response.request()?;
        if request.meta_flag(META_DONT_REDIRECT) == Some(true) || !Self::is_redirect(response.status()) {
            return Ok(ResponseAction::Continue(response));
        }
        let Some(location) = response.headers().get(LOCATION).and_then(|v| v.to_str().ok()) else {
            return Ok(ResponseAction::Continue(response));
        };
        let target = match response.url().join(location) {
            Ok(target) => target,
            Err(e) => {
                debug!("Ignoring redirect from {} to invalid location {:?}: {}", request, location, e);
                return Ok(ResponseAction::Continue(response));
            }
        };

        let times = request.meta().get(META_REDIRECT_TIMES).and_then(Value::as_u64).unwrap_or(0) + 1;
        if times > self.max_times {
            debug!("Discarding {}: max redirections reached", request);
            return Ok(ResponseAction::Drop);
        }

        let mut history = request.history().to_vec();
        history.push(request.url().clone());

        let mut builder = request
            .replace()
            .parsed_url(target)
            .history(history)
            .meta(META_REDIRECT_TIMES, times);

        let status = response.status();
        if matches!(status, StatusCode::FOUND | StatusCode::SEE_OTHER) && *request.method() != Method::HEAD {
            let mut headers = request.headers().clone();
            headers.remove(CONTENT_TYPE);
            headers.remove(CONTENT_LENGTH);
            builder = builder.method("GET").body(Vec::new()).headers(headers);
        }

        let redirected = builder.build()?;
        debug!("Redirecting ({}) to {} from {}", status.as_u16(), redirected, request);
        self.stats.increment_requests_redirected();
        Ok(ResponseAction::Reschedule(redirected))
    }
}
