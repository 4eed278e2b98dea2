use super::META_DONT_FILTER;
use crate::error::{Failure, SpiderError};
use crate::middleware::{Hooks, Middleware, ResponseAction};
use crate::request::Request;
use crate::response::Response;
use crate::settings::{Settings, RETRY_ENABLED, RETRY_HTTP_CODES, RETRY_PRIORITY_ADJUST, RETRY_TIMES};
use crate::stats::StatCollector;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Meta key counting how often a request has been retried.
pub const META_RETRY_TIMES: &str = "retry_times";
/// Meta key overriding `RETRY_TIMES` for one request.
pub const META_MAX_RETRY_TIMES: &str = "max_retry_times";
/// Meta key disabling retries for one request.
pub const META_DONT_RETRY: &str = "dont_retry";

/// Re-schedules requests that failed transiently or came back with a retryable status.
pub struct RetryMiddleware {
    max_retries: u64,
    http_codes: HashSet<u16>,
    priority_adjust: i32,
    stats: Arc<StatCollector>,
}

impl RetryMiddleware {
    pub const NAME: &'static str = "RetryMiddleware";

    pub fn from_settings(settings: &Settings, stats: Arc<StatCollector>) -> Result<Self, SpiderError> {
        if !settings.get_bool_or(RETRY_ENABLED, true)? {
            return Err(SpiderError::NotConfigured("RETRY_ENABLED is off".to_string()));
        }
        Ok(Self {
            max_retries: settings.get_int_or(RETRY_TIMES, 2)?.max(0) as u64,
            http_codes: settings.get_status_codes(RETRY_HTTP_CODES)?.into_iter().collect(),
            priority_adjust: settings.get_int_or(RETRY_PRIORITY_ADJUST, -1)? as i32,
            stats,
        })
    }

    fn is_retryable(error: &SpiderError) -> bool {
        error.is_transient() || matches!(error, SpiderError::SizeExceeded { .. })
    }

    /// Builds the next attempt of `request`, or `None` once retries are exhausted.
    fn retry(&self, request: &Request, reason: &str) -> Result<Option<Request>, SpiderError> {
        let meta = request.meta();
        let attempts = meta.get(META_RETRY_TIMES).and_then(Value::as_u64).unwrap_or(0) + 1;
        let max = meta
            .get(META_MAX_RETRY_TIMES)
            .and_then(Value::as_u64)
            .unwrap_or(self.max_retries);

        if attempts > max {
            debug!("Gave up retrying {} (failed {} times): {}", request, attempts, reason);
            return Ok(None);
        }

        debug!("Retrying {} (failed {} times): {}", request, attempts, reason);
        self.stats.increment_requests_retried();
        let retry = request
            .replace()
            .meta(META_RETRY_TIMES, attempts)
            .meta(META_DONT_FILTER, true)
            .priority(request.priority().saturating_add(self.priority_adjust))
            .build()?;
        Ok(Some(retry))
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn hooks(&self) -> Hooks {
        Hooks::OUTCOME
    }

    async fn process_response(&mut self, response: Response) -> Result<ResponseAction, SpiderError> {
        let request = response.request()?;
        if request.meta_flag(META_DONT_RETRY) == Some(true) || !self.http_codes.contains(&response.status().as_u16()) {
            return Ok(ResponseAction::Continue(response));
        }
        let reason = format!("HTTP {}", response.status().as_u16());
        Ok(match self.retry(request, &reason)? {
            Some(retry) => ResponseAction::Reschedule(retry),
            None => ResponseAction::Continue(response),
        })
    }

    async fn process_failure(&mut self, failure: Failure) -> Result<ResponseAction, SpiderError> {
        let Some(request) = failure.request() else {
            return Ok(ResponseAction::Fail(failure));
        };
        if request.meta_flag(META_DONT_RETRY) == Some(true) || !Self::is_retryable(failure.error()) {
            return Ok(ResponseAction::Fail(failure));
        }
        Ok(match self.retry(request, &failure.error().to_string())? {
            Some(retry) => ResponseAction::Reschedule(retry),
            None => ResponseAction::Fail(failure),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderMap;
    use reqwest::StatusCode;

    fn middleware() -> (RetryMiddleware, Arc<StatCollector>) {
        let stats = Arc::new(StatCollector::new());
        let middleware = RetryMiddleware::from_settings(&Settings::new(), Arc::clone(&stats)).unwrap();
        (middleware, stats)
    }

    fn response(status: u16, request: Request) -> Response {
        Response::from_status(request.url().clone(), status, HeaderMap::new(), "")
            .unwrap()
            .with_request(request)
    }

    fn timeout(request: Request) -> Failure {
        Failure::with_request(
            SpiderError::Timeout {
                url: request.url().to_string(),
            },
            request,
        )
    }

    #[tokio::test]
    async fn test_retries_server_errors_until_exhausted() {
        let (mut retry, stats) = middleware();
        let mut request = Request::builder("http://example.com/").priority(5).build().unwrap();

        for attempt in 1..=2u64 {
            match retry.process_response(response(503, request.clone())).await.unwrap() {
                ResponseAction::Reschedule(next) => {
                    assert_eq!(next.meta().get(META_RETRY_TIMES), Some(&Value::from(attempt)));
                    assert_eq!(next.meta_flag(META_DONT_FILTER), Some(true));
                    assert_eq!(next.priority(), request.priority() - 1);
                    request = next;
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        let last = retry.process_response(response(503, request)).await.unwrap();
        assert!(matches!(last, ResponseAction::Continue(r) if r.status() == StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(stats.requests_retried(), 2);
    }

    #[tokio::test]
    async fn test_ignores_successful_responses() {
        let (mut retry, _) = middleware();
        let request = Request::new("http://example.com/").unwrap();
        let action = retry.process_response(response(200, request)).await.unwrap();
        assert!(matches!(action, ResponseAction::Continue(_)));
    }

    #[tokio::test]
    async fn test_retries_transient_failures_only() {
        let (mut retry, _) = middleware();
        let request = Request::new("http://example.com/").unwrap();

        let action = retry.process_failure(timeout(request.clone())).await.unwrap();
        assert!(matches!(action, ResponseAction::Reschedule(_)));

        let permanent = Failure::with_request(SpiderError::UnsupportedScheme("ftp".into()), request);
        let action = retry.process_failure(permanent).await.unwrap();
        assert!(matches!(action, ResponseAction::Fail(_)));
    }

    #[tokio::test]
    async fn test_meta_overrides() {
        let (mut retry, _) = middleware();
        let never = Request::builder("http://example.com/").meta(META_DONT_RETRY, true).build().unwrap();
        assert!(matches!(
            retry.process_failure(timeout(never)).await.unwrap(),
            ResponseAction::Fail(_)
        ));

        let once = Request::builder("http://example.com/")
            .meta(META_MAX_RETRY_TIMES, 0)
            .build()
            .unwrap();
        assert!(matches!(
            retry.process_failure(timeout(once)).await.unwrap(),
            ResponseAction::Fail(_)
        ));
    }

    #[test]
    fn test_disabled_by_settings() {
        let mut settings = Settings::new();
        settings.set(crate::settings::SettingsPriority::Custom, RETRY_ENABLED, false);
        assert!(matches!(
            RetryMiddleware::from_settings(&settings, Arc::new(StatCollector::new())),
            Err(SpiderError::NotConfigured(_))
        ));
    }
}
