//! Ordered middleware chain with onion semantics.

use super::{builtin, Hooks, Middleware, RequestAction, ResponseAction};
use crate::error::{Failure, SpiderError};
use crate::request::Request;
use crate::response::{Outcome, Response};
use crate::settings::{Settings, PIPELINE, PIPELINE_BASE};
use crate::stats::StatCollector;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Builds a middleware from settings; `NotConfigured` opts it out of the chain.
pub type MiddlewareFactory = fn(&Settings, &Arc<StatCollector>) -> Result<Box<dyn Middleware>, SpiderError>;

/// Where a request goes after the request-direction chain.
#[derive(Debug)]
pub enum RequestResult {
    /// Schedule the request for download.
    Download(Request),
    /// A stage answered the request; the response carries the request.
    Respond(Response),
}

/// Final result of the response-direction chain.
#[derive(Debug)]
pub enum PipelineResult {
    Response(Response),
    Failure(Failure),
    Reschedule(Request),
    Handled,
}

struct Stage {
    order: i64,
    hooks: Hooks,
    middleware: Box<dyn Middleware>,
}

impl Stage {
    fn name(&self) -> &str {
        self.middleware.name()
    }

    /// Honours the `<name>_ENABLED = false` meta opt-out.
    fn enabled_for(&self, request: &Request) -> bool {
        request.meta_flag(&format!("{}_ENABLED", self.name())) != Some(false)
    }
}

pub struct PipelineManager {
    stages: Vec<Stage>,
    request_chain: Vec<usize>,
    outcome_chain: Vec<usize>,
}

impl PipelineManager {
    /// Builds a chain from `(order, middleware)` pairs. Equal orders keep insertion order.
    pub fn new(middlewares: Vec<(i64, Box<dyn Middleware>)>) -> Self {
        let mut stages: Vec<Stage> = middlewares
            .into_iter()
            .map(|(order, middleware)| Stage {
                order,
                hooks: middleware.hooks(),
                middleware,
            })
            .collect();
        stages.sort_by_key(|stage| stage.order);

        let request_chain = (0..stages.len()).filter(|&i| stages[i].hooks.request).collect();
        let outcome_chain = (0..stages.len())
            .rev()
            .filter(|&i| stages[i].hooks.response || stages[i].hooks.failure)
            .collect();

        for stage in &stages {
            debug!("Pipeline stage {} at order {} ({:?})", stage.name(), stage.order, stage.hooks);
        }
        PipelineManager {
            stages,
            request_chain,
            outcome_chain,
        }
    }

    /// Builds the chain named by `PIPELINE_BASE` overlaid with `PIPELINE`, plus `custom` stages.
    ///
    /// A `null` order disables a stage, whether built-in or custom.
    pub fn from_settings(
        settings: &Settings,
        stats: &Arc<StatCollector>,
        custom: Vec<(i64, Box<dyn Middleware>)>,
    ) -> Result<Self, SpiderError> {
        let overrides = settings.get_map_or(PIPELINE, Map::new())?;
        let mut orders: Map<String, Value> = settings.get_map_or(PIPELINE_BASE, Map::new())?;
        orders.extend(overrides.clone());

        let mut disabled = HashSet::new();
        let mut middlewares = Vec::new();
        for (name, value) in orders {
            if value.is_null() {
                debug!("Middleware {} disabled by settings", name);
                disabled.insert(name);
                continue;
            }
            let order = value.as_i64().ok_or_else(|| {
                SpiderError::Configuration(format!("order for middleware {} must be an integer, got {}", name, value))
            })?;
            let Some(factory) = builtin::factory(&name) else {
                if custom.iter().any(|(_, m)| m.name() == name) {
                    continue;
                }
                return Err(SpiderError::Configuration(format!("unknown middleware {}", name)));
            };
            match factory(settings, stats) {
                Ok(middleware) => middlewares.push((order, middleware)),
                Err(SpiderError::NotConfigured(reason)) => {
                    debug!("Middleware {} not configured: {}", name, reason);
                }
                Err(e) => return Err(e),
            }
        }

        for (order, middleware) in custom {
            if disabled.contains(middleware.name()) {
                debug!("Middleware {} disabled by settings", middleware.name());
                continue;
            }
            // An explicit PIPELINE entry overrides the order given in code.
            let order = overrides
                .get(middleware.name())
                .and_then(Value::as_i64)
                .unwrap_or(order);
            middlewares.push((order, middleware));
        }

        Ok(Self::new(middlewares))
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage names in request order.
    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(Stage::name).collect()
    }

    /// Runs `request` through the request-direction stages in ascending order.
    ///
    /// Errors, including drops, come back as a [`Failure`] carrying the request
    /// as it entered the failing stage.
    pub async fn process_request(&mut self, request: Request) -> Result<RequestResult, Failure> {
        let mut current = request;
        'restart: loop {
            for &index in &self.request_chain {
                let stage = &mut self.stages[index];
                if !stage.enabled_for(&current) {
                    trace!("Skipping {} for {}", stage.name(), current);
                    continue;
                }

                let entering = current.clone();
                match stage.middleware.process_request(current).await {
                    Ok(RequestAction::Continue(request)) => current = request,
                    Ok(RequestAction::Drop) => {
                        let error = SpiderError::RequestDropped {
                            stage: stage.name().to_string(),
                            method: "process_request",
                        };
                        return Err(Failure::with_request(error, entering));
                    }
                    Ok(RequestAction::Respond(mut response)) => {
                        trace!("{} answered {} without download", stage.name(), entering);
                        if !response.has_request() {
                            response.set_request(entering);
                        }
                        return Ok(RequestResult::Respond(response));
                    }
                    Ok(RequestAction::Restart(request)) => {
                        trace!("{} restarted the chain with {}", stage.name(), request);
                        current = request;
                        continue 'restart;
                    }
                    Err(e) => return Err(Failure::with_request(e, entering)),
                }
            }
            return Ok(RequestResult::Download(current));
        }
    }

    /// Runs a download outcome through the response-direction stages in reverse order.
    ///
    /// The outcome must carry its request; it is re-attached before every stage
    /// and to the final result.
    pub async fn process_response(&mut self, outcome: Outcome) -> Result<PipelineResult, SpiderError> {
        let request = outcome.request().cloned().ok_or_else(|| {
            SpiderError::ContractViolation(format!("outcome {} reached the pipeline without its request", outcome))
        })?;

        let mut current = outcome;
        for &index in &self.outcome_chain {
            let stage = &mut self.stages[index];
            if !stage.enabled_for(&request) {
                trace!("Skipping {} for {}", stage.name(), request);
                continue;
            }
            current.set_request(request.clone());

            let (method, result) = match current {
                Outcome::Response(response) if stage.hooks.response => {
                    ("process_response", stage.middleware.process_response(response).await)
                }
                Outcome::Failure(failure) if stage.hooks.failure => {
                    ("process_failure", stage.middleware.process_failure(failure).await)
                }
                passthrough => {
                    current = passthrough;
                    continue;
                }
            };

            current = match result {
                Ok(ResponseAction::Continue(response)) => Outcome::Response(response),
                Ok(ResponseAction::Fail(failure)) => Outcome::Failure(failure),
                Ok(ResponseAction::Drop) => {
                    let error = SpiderError::RequestDropped {
                        stage: stage.name().to_string(),
                        method,
                    };
                    return Ok(PipelineResult::Failure(Failure::with_request(error, request)));
                }
                Ok(ResponseAction::Reschedule(next)) => {
                    trace!("{} rescheduled {} as {}", stage.name(), request, next);
                    return Ok(PipelineResult::Reschedule(next));
                }
                Ok(ResponseAction::Handled) => return Ok(PipelineResult::Handled),
                Err(e) => {
                    warn!("{}.{} failed for {}: {}", stage.name(), method, request, e);
                    Outcome::Failure(Failure::with_request(e, request.clone()))
                }
            };
        }

        current.set_request(request);
        Ok(match current {
            Outcome::Response(response) => PipelineResult::Response(response),
            Outcome::Failure(failure) => PipelineResult::Failure(failure),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsPriority;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use reqwest::header::HeaderMap;
    use reqwest::StatusCode;
    use serde_json::json;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records every call and performs a scripted action.
    struct Probe {
        name: &'static str,
        hooks: Hooks,
        log: Log,
        on_request: fn(Request) -> Result<RequestAction, SpiderError>,
        on_response: fn(Response) -> Result<ResponseAction, SpiderError>,
        on_failure: fn(Failure) -> Result<ResponseAction, SpiderError>,
    }

    impl Probe {
        fn new(name: &'static str, log: &Log) -> Self {
            Probe {
                name,
                hooks: Hooks::ALL,
                log: Arc::clone(log),
                on_request: |r| Ok(RequestAction::Continue(r)),
                on_response: |r| Ok(ResponseAction::Continue(r)),
                on_failure: |f| Ok(ResponseAction::Fail(f)),
            }
        }
    }

    #[async_trait]
    impl Middleware for Probe {
        fn name(&self) -> &str {
            self.name
        }

        fn hooks(&self) -> Hooks {
            self.hooks
        }

        async fn process_request(&mut self, request: Request) -> Result<RequestAction, SpiderError> {
            self.log.lock().push(format!("{}.request", self.name));
            (self.on_request)(request)
        }

        async fn process_response(&mut self, response: Response) -> Result<ResponseAction, SpiderError> {
            assert!(response.has_request());
            self.log.lock().push(format!("{}.response", self.name));
            (self.on_response)(response)
        }

        async fn process_failure(&mut self, failure: Failure) -> Result<ResponseAction, SpiderError> {
            assert!(failure.request().is_some());
            self.log.lock().push(format!("{}.failure", self.name));
            (self.on_failure)(failure)
        }
    }

    fn request() -> Request {
        Request::new("http://example.com/").unwrap()
    }

    fn response_for(request: Request) -> Outcome {
        Outcome::Response(
            Response::new(request.url().clone(), StatusCode::OK, HeaderMap::new(), "").with_request(request),
        )
    }

    fn manager(stages: Vec<(i64, Probe)>) -> PipelineManager {
        PipelineManager::new(
            stages
                .into_iter()
                .map(|(order, probe)| (order, Box::new(probe) as Box<dyn Middleware>))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_onion_ordering() {
        let log = Log::default();
        let mut pipeline = manager(vec![
            (300, Probe::new("c", &log)),
            (100, Probe::new("a", &log)),
            (200, Probe::new("b", &log)),
        ]);
        assert_eq!(pipeline.names(), vec!["a", "b", "c"]);

        let request = match pipeline.process_request(request()).await.unwrap() {
            RequestResult::Download(request) => request,
            other => panic!("unexpected {:?}", other),
        };
        let result = pipeline.process_response(response_for(request)).await.unwrap();
        assert!(matches!(result, PipelineResult::Response(r) if r.has_request()));

        assert_eq!(
            *log.lock(),
            vec!["a.request", "b.request", "c.request", "c.response", "b.response", "a.response"]
        );
    }

    #[tokio::test]
    async fn test_request_drop_stops_chain() {
        let log = Log::default();
        let mut dropper = Probe::new("dropper", &log);
        dropper.on_request = |_| Ok(RequestAction::Drop);
        let mut pipeline = manager(vec![(1, dropper), (2, Probe::new("later", &log))]);

        let failure = match pipeline.process_request(request()).await {
            Err(failure) => failure,
            Ok(other) => panic!("unexpected {:?}", other),
        };
        assert!(matches!(
            failure.error(),
            SpiderError::RequestDropped { stage, method: "process_request" } if stage == "dropper"
        ));
        assert!(failure.request().is_some());
        assert_eq!(*log.lock(), vec!["dropper.request"]);
    }

    #[tokio::test]
    async fn test_request_respond_short_circuits() {
        let log = Log::default();
        let mut responder = Probe::new("responder", &log);
        responder.on_request = |r| {
            Ok(RequestAction::Respond(Response::new(
                r.url().clone(),
                StatusCode::OK,
                HeaderMap::new(),
                "cached",
            )))
        };
        let mut pipeline = manager(vec![(1, responder), (2, Probe::new("later", &log))]);

        let result = pipeline.process_request(request()).await.unwrap();
        assert!(matches!(result, RequestResult::Respond(r) if r.has_request()));
        assert_eq!(*log.lock(), vec!["responder.request"]);
    }

    #[tokio::test]
    async fn test_restart_reruns_from_first_stage() {
        let log = Log::default();
        let mut restarter = Probe::new("restarter", &log);
        restarter.on_request = |r| {
            if r.meta_flag("restarted") == Some(true) {
                Ok(RequestAction::Continue(r))
            } else {
                Ok(RequestAction::Restart(r.replace().meta("restarted", true).build()?))
            }
        };
        let mut pipeline = manager(vec![(1, Probe::new("first", &log)), (2, restarter)]);

        let result = pipeline.process_request(request()).await.unwrap();
        assert!(matches!(result, RequestResult::Download(r) if r.meta_flag("restarted") == Some(true)));
        assert_eq!(
            *log.lock(),
            vec!["first.request", "restarter.request", "first.request", "restarter.request"]
        );
    }

    #[tokio::test]
    async fn test_request_error_carries_request() {
        let log = Log::default();
        let mut failing = Probe::new("failing", &log);
        failing.on_request = |_| Err(SpiderError::Middleware("nope".into()));
        let mut pipeline = manager(vec![(1, failing)]);

        let failure = pipeline.process_request(request()).await.err().unwrap();
        assert!(matches!(failure.error(), SpiderError::Middleware(_)));
        assert_eq!(failure.request().unwrap().url().as_str(), "http://example.com/");
    }

    #[tokio::test]
    async fn test_response_error_switches_to_failure_path() {
        let log = Log::default();
        let mut recovering = Probe::new("outer", &log);
        recovering.on_failure = |f| {
            let request = f.request().cloned().unwrap();
            Ok(ResponseAction::Continue(
                Response::new(request.url().clone(), StatusCode::OK, HeaderMap::new(), "recovered"),
            ))
        };
        let mut failing = Probe::new("inner", &log);
        failing.on_response = |_| Err(SpiderError::Middleware("bad body".into()));
        let mut pipeline = manager(vec![(1, recovering), (2, failing)]);

        let result = pipeline.process_response(response_for(request())).await.unwrap();
        match result {
            PipelineResult::Response(response) => {
                assert_eq!(response.body().as_ref(), b"recovered");
                assert!(response.has_request());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(*log.lock(), vec!["inner.response", "outer.failure"]);
    }

    #[tokio::test]
    async fn test_response_drop_returns_tagged_failure() {
        let log = Log::default();
        let mut dropper = Probe::new("dropper", &log);
        dropper.on_response = |_| Ok(ResponseAction::Drop);
        let mut pipeline = manager(vec![(1, Probe::new("outer", &log)), (2, dropper)]);

        let result = pipeline.process_response(response_for(request())).await.unwrap();
        match result {
            PipelineResult::Failure(failure) => {
                assert!(failure.is_drop());
                assert!(matches!(
                    failure.error(),
                    SpiderError::RequestDropped { method: "process_response", .. }
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(*log.lock(), vec!["dropper.response"]);
    }

    #[tokio::test]
    async fn test_reschedule_and_handled_short_circuit() {
        let log = Log::default();
        let mut rescheduler = Probe::new("rescheduler", &log);
        rescheduler.on_response = |r| Ok(ResponseAction::Reschedule(r.request()?.clone()));
        let mut pipeline = manager(vec![(1, Probe::new("outer", &log)), (2, rescheduler)]);
        let result = pipeline.process_response(response_for(request())).await.unwrap();
        assert!(matches!(result, PipelineResult::Reschedule(_)));

        let mut consumer = Probe::new("consumer", &log);
        consumer.on_response = |_| Ok(ResponseAction::Handled);
        let mut pipeline = manager(vec![(1, Probe::new("outer", &log)), (2, consumer)]);
        let result = pipeline.process_response(response_for(request())).await.unwrap();
        assert!(matches!(result, PipelineResult::Handled));
        assert!(!log.lock().contains(&"outer.response".to_string()));
    }

    #[tokio::test]
    async fn test_missing_request_is_contract_violation() {
        let mut pipeline = manager(vec![]);
        let orphan = Outcome::Response(Response::new(
            url::Url::parse("http://example.com/").unwrap(),
            StatusCode::OK,
            HeaderMap::new(),
            "",
        ));
        assert!(matches!(
            pipeline.process_response(orphan).await,
            Err(SpiderError::ContractViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_enabled_meta_skips_stage() {
        let log = Log::default();
        let mut pipeline = manager(vec![(1, Probe::new("a", &log)), (2, Probe::new("b", &log))]);
        let request = Request::builder("http://example.com/").meta("b_ENABLED", false).build().unwrap();

        let request = match pipeline.process_request(request).await.unwrap() {
            RequestResult::Download(request) => request,
            other => panic!("unexpected {:?}", other),
        };
        pipeline.process_response(response_for(request)).await.unwrap();
        assert_eq!(*log.lock(), vec!["a.request", "a.response"]);
    }

    #[tokio::test]
    async fn test_hooks_limit_participation() {
        let log = Log::default();
        let mut request_only = Probe::new("request_only", &log);
        request_only.hooks = Hooks::REQUEST;
        let mut outcome_only = Probe::new("outcome_only", &log);
        outcome_only.hooks = Hooks::OUTCOME;
        let mut pipeline = manager(vec![(1, request_only), (2, outcome_only)]);

        let request = match pipeline.process_request(request()).await.unwrap() {
            RequestResult::Download(request) => request,
            other => panic!("unexpected {:?}", other),
        };
        pipeline.process_response(response_for(request)).await.unwrap();
        assert_eq!(*log.lock(), vec!["request_only.request", "outcome_only.response"]);
    }

    #[test]
    fn test_from_settings_orders_and_disables() {
        let stats = Arc::new(StatCollector::new());
        let mut settings = Settings::new();
        settings.set(
            SettingsPriority::Custom,
            PIPELINE,
            json!({ "RetryMiddleware": null, "DefaultHeadersMiddleware": 50 }),
        );

        let pipeline = PipelineManager::from_settings(&settings, &stats, Vec::new()).unwrap();
        assert_eq!(
            pipeline.names(),
            vec!["DefaultHeadersMiddleware", "DuplicateFilterMiddleware", "RedirectMiddleware"]
        );
    }

    #[test]
    fn test_from_settings_places_custom_stages() {
        let stats = Arc::new(StatCollector::new());
        let log = Log::default();
        let mut settings = Settings::empty();
        settings.set(SettingsPriority::Custom, PIPELINE, json!({ "late": 10 }));

        let custom: Vec<(i64, Box<dyn Middleware>)> = vec![
            (1, Box::new(Probe::new("late", &log))),
            (5, Box::new(Probe::new("early", &log))),
        ];
        let pipeline = PipelineManager::from_settings(&settings, &stats, custom).unwrap();
        assert_eq!(pipeline.names(), vec!["early", "late"]);
    }

    #[test]
    fn test_from_settings_rejects_unknown_names() {
        let stats = Arc::new(StatCollector::new());
        let mut settings = Settings::empty();
        settings.set(SettingsPriority::Custom, PIPELINE, json!({ "Nope": 1 }));
        assert!(matches!(
            PipelineManager::from_settings(&settings, &stats, Vec::new()),
            Err(SpiderError::Configuration(_))
        ));
    }
}
