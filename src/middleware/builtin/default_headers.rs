use crate::error::SpiderError;
use crate::middleware::{Hooks, Middleware, RequestAction};
use crate::request::Request;
use crate::settings::{Settings, DEFAULT_REQUEST_HEADERS, USER_AGENT};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};

/// Fills in `DEFAULT_REQUEST_HEADERS` and `USER_AGENT` on requests that lack them.
#[derive(Debug, Clone)]
pub struct DefaultHeadersMiddleware {
    headers: HeaderMap,
}

impl DefaultHeadersMiddleware {
    pub const NAME: &'static str = "DefaultHeadersMiddleware";

    pub fn new(headers: HeaderMap) -> Self {
        Self { headers }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, SpiderError> {
        let mut headers = HeaderMap::new();
        for (name, value) in settings.get_map_or(DEFAULT_REQUEST_HEADERS, Map::new())? {
            let Value::String(value) = value else {
                return Err(SpiderError::Configuration(format!(
                    "default header {} must be a string, got {}",
                    name, value
                )));
            };
            headers.insert(parse_name(&name)?, parse_value(&name, &value)?);
        }
        if let Some(Value::String(agent)) = settings.get(USER_AGENT) {
            if !agent.is_empty() {
                headers.insert(reqwest::header::USER_AGENT, parse_value(USER_AGENT, agent)?);
            }
        }
        if headers.is_empty() {
            return Err(SpiderError::NotConfigured("no default headers configured".to_string()));
        }
        Ok(Self::new(headers))
    }
}

fn parse_name(name: &str) -> Result<HeaderName, SpiderError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| SpiderError::Configuration(format!("invalid header name {}: {}", name, e)))
}

fn parse_value(name: &str, value: &str) -> Result<HeaderValue, SpiderError> {
    HeaderValue::from_str(value)
        .map_err(|e| SpiderError::Configuration(format!("invalid value for header {}: {}", name, e)))
}

#[async_trait]
impl Middleware for DefaultHeadersMiddleware {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn hooks(&self) -> Hooks {
        Hooks::REQUEST
    }

    async fn process_request(&mut self, request: Request) -> Result<RequestAction, SpiderError> {
        let missing: Vec<(&HeaderName, &HeaderValue)> = self
            .headers
            .iter()
            .filter(|(name, _)| !request.headers().contains_key(*name))
            .collect();
        if missing.is_empty() {
            return Ok(RequestAction::Continue(request));
        }

        let mut headers = request.headers().clone();
        for (name, value) in missing {
            headers.insert(name.clone(), value.clone());
        }
        Ok(RequestAction::Continue(request.replace().headers(headers).build()?))
    }
}
