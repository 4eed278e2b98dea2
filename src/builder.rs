//! # Builder Module
//!
//! Provides the `EngineBuilder`, a fluent API for assembling an [`Engine`]
//! around a spider.
//!
//! ## Overview
//!
//! Fluent setters write the custom settings layer or register components;
//! nothing is constructed until [`EngineBuilder::build`], which performs setup
//! in a fixed order:
//!
//! 1. settings layers: defaults, the module file, the spider's settings, then custom values
//! 2. the signal bus, with any subscribers registered through [`EngineBuilder::connect`]
//! 3. the stats collector
//! 4. download handlers and the downloader
//! 5. the middleware pipeline
//! 6. the spider receives its [`EngineHandle`](crate::engine::EngineHandle)
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::prelude::*;
//! use std::time::Duration;
//!
//! async fn crawl() -> Result<(), SpiderError> {
//!     let mut engine = EngineBuilder::new(MySpider)
//!         .concurrent_requests(8)
//!         .concurrent_requests_per_domain(2)
//!         .download_delay(Duration::from_millis(250))
//!         .setting("RETRY_TIMES", 5)
//!         .build()?;
//!
//!     engine.run().await?;
//!     println!("{}", engine.stats());
//!     Ok(())
//! }
//! ```

use crate::downloader::{DownloadHandler, Downloader, HandlerRegistry, SlotPolicy};
use crate::engine::Engine;
use crate::error::SpiderError;
use crate::middleware::{Middleware, PipelineManager};
use crate::settings::{
    Settings, SettingsPriority, CONCURRENT_REQUESTS, CONCURRENT_REQUESTS_PER_DOMAIN, DOWNLOAD_DELAY,
};
use crate::signals::{Signal, SignalArgs, SignalBus, SignalHandler, SignalOutcome};
use crate::spider::Spider;
use crate::stats::StatCollector;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct EngineBuilder {
    spider: Box<dyn Spider>,
    settings_file: Option<PathBuf>,
    custom: Map<String, Value>,
    middlewares: Vec<(i64, Box<dyn Middleware>)>,
    handlers: Vec<(String, Arc<dyn DownloadHandler>)>,
    subscribers: Vec<(Signal, SignalHandler)>,
}

impl EngineBuilder {
    pub fn new<S: Spider>(spider: S) -> Self {
        Self {
            spider: Box::new(spider),
            settings_file: None,
            custom: Map::new(),
            middlewares: Vec::new(),
            handlers: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    /// Sets the global download concurrency (`CONCURRENT_REQUESTS`).
    pub fn concurrent_requests(self, limit: usize) -> Self {
        self.setting(CONCURRENT_REQUESTS, limit)
    }

    /// Sets the per-domain download concurrency (`CONCURRENT_REQUESTS_PER_DOMAIN`).
    pub fn concurrent_requests_per_domain(self, limit: usize) -> Self {
        self.setting(CONCURRENT_REQUESTS_PER_DOMAIN, limit)
    }

    /// Sets `DOWNLOAD_DELAY`. Any non-zero delay serialises all downloads.
    pub fn download_delay(self, delay: Duration) -> Self {
        self.setting(DOWNLOAD_DELAY, delay.as_secs_f64())
    }

    /// Sets a value in the custom layer, which overrides every other layer.
    pub fn setting(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }

    /// Loads a JSON object file into the module layer at build time.
    pub fn settings_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_file = Some(path.into());
        self
    }

    /// Adds a custom middleware at `order`. A `PIPELINE` entry with its name
    /// overrides the order or, when `null`, disables it.
    pub fn middleware<M>(mut self, order: i64, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.middlewares.push((order, Box::new(middleware)));
        self
    }

    /// Registers a download handler for `scheme`, replacing the built-in one.
    pub fn download_handler<H>(mut self, scheme: &str, handler: H) -> Self
    where
        H: DownloadHandler + 'static,
    {
        self.handlers.push((scheme.to_string(), Arc::new(handler)));
        self
    }

    /// Subscribes `handler` to `signal` before the engine is assembled.
    pub fn connect<F>(mut self, signal: Signal, handler: F) -> Self
    where
        F: Fn(SignalArgs<'_>) -> Result<SignalOutcome, SpiderError> + Send + Sync + 'static,
    {
        self.subscribers.push((signal, Arc::new(handler)));
        self
    }

    fn build_settings(&self) -> Result<Settings, SpiderError> {
        let mut settings = Settings::new();
        if let Some(path) = &self.settings_file {
            settings.load_module_file(path)?;
        }
        if let Some(spider_settings) = self.spider.settings() {
            settings.set_layer(SettingsPriority::Spider, spider_settings);
        }
        settings.set_layer(SettingsPriority::Custom, self.custom.clone());
        Ok(settings)
    }

    /// Performs setup and returns an engine ready for [`Engine::run`].
    pub fn build(self) -> Result<Engine, SpiderError> {
        let settings = Arc::new(self.build_settings()?);
        debug!("[{}] Settings resolved", self.spider.name());

        let signals = Arc::new(SignalBus::new());
        for (signal, handler) in self.subscribers {
            signals.connect(signal, move |args| handler(args));
        }

        let stats = Arc::new(StatCollector::new());

        let mut registry = HandlerRegistry::from_settings(&settings)?;
        for (scheme, handler) in self.handlers {
            registry.register_factory(&scheme, &settings, move |_| Ok(handler))?;
        }
        debug!("Download handlers available for {:?}", registry.schemes());
        let policy = SlotPolicy::from_settings(&settings)?;
        let (downloader, events) = Downloader::new(policy, Arc::new(registry), Arc::clone(&stats));

        let pipeline = PipelineManager::from_settings(&settings, &stats, self.middlewares)?;

        Engine::new(settings, signals, stats, downloader, events, pipeline, self.spider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineHandle, EngineState};
    use crate::middleware::{Hooks, RequestAction};
    use crate::request::Request;
    use crate::response::Response;
    use crate::settings::{PIPELINE, RETRY_TIMES, USER_AGENT};
    use crate::spider::ParseOutput;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::io::Write;

    #[derive(Default)]
    struct ConfiguredSpider {
        handle: Arc<Mutex<Option<EngineHandle>>>,
    }

    #[async_trait]
    impl Spider for ConfiguredSpider {
        fn name(&self) -> &str {
            "configured"
        }

        fn settings(&self) -> Option<Map<String, Value>> {
            let mut layer = Map::new();
            layer.insert(RETRY_TIMES.into(), json!(7));
            layer.insert(USER_AGENT.into(), json!("from-spider"));
            Some(layer)
        }

        fn set_engine(&mut self, engine: EngineHandle) {
            *self.handle.lock() = Some(engine);
        }

        async fn parse(&mut self, _response: Response) -> Result<ParseOutput, SpiderError> {
            Ok(ParseOutput::new())
        }
    }

    struct Tagger;

    #[async_trait]
    impl Middleware for Tagger {
        fn name(&self) -> &str {
            "Tagger"
        }

        fn hooks(&self) -> Hooks {
            Hooks::REQUEST
        }

        async fn process_request(&mut self, request: Request) -> Result<RequestAction, SpiderError> {
            Ok(RequestAction::Continue(request))
        }
    }

    #[test]
    fn test_settings_layers_resolve_in_priority_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"RETRY_TIMES": 3, "USER_AGENT": "from-module", "DOWNLOAD_TIMEOUT": 5}}"#).unwrap();

        let engine = EngineBuilder::new(ConfiguredSpider::default())
            .settings_file(file.path())
            .setting(USER_AGENT, "from-builder")
            .build()
            .unwrap();
        let settings = engine.settings();

        assert_eq!(settings.get_int(RETRY_TIMES).unwrap(), 7);
        assert_eq!(settings.get(USER_AGENT), Some(&json!("from-builder")));
        assert_eq!(settings.get_float(crate::settings::DOWNLOAD_TIMEOUT).unwrap(), 5.0);
        assert_eq!(settings.priority_of(USER_AGENT), Some(SettingsPriority::Custom));
    }

    #[test]
    fn test_spider_receives_handle_last() {
        let spider = ConfiguredSpider::default();
        let handle = Arc::clone(&spider.handle);
        let engine = EngineBuilder::new(spider).build().unwrap();

        let received = handle.lock().clone().unwrap();
        assert_eq!(received.state(), EngineState::SetUp);
        assert_eq!(engine.state(), EngineState::SetUp);
    }

    #[test]
    fn test_fluent_setters_write_custom_layer() {
        let engine = EngineBuilder::new(ConfiguredSpider::default())
            .concurrent_requests(4)
            .concurrent_requests_per_domain(2)
            .download_delay(Duration::from_millis(1500))
            .build()
            .unwrap();
        let settings = engine.settings();

        assert_eq!(settings.get_int(CONCURRENT_REQUESTS).unwrap(), 4);
        assert_eq!(settings.get_int(CONCURRENT_REQUESTS_PER_DOMAIN).unwrap(), 2);
        assert_eq!(settings.get_float(DOWNLOAD_DELAY).unwrap(), 1.5);
    }

    #[test]
    fn test_custom_middleware_order_can_be_overridden() {
        let result = EngineBuilder::new(ConfiguredSpider::default())
            .middleware(10, Tagger)
            .setting(PIPELINE, json!({ "Tagger": null }))
            .build();
        assert!(result.is_ok());

        let unknown = EngineBuilder::new(ConfiguredSpider::default())
            .setting(PIPELINE, json!({ "NoSuchMiddleware": 5 }))
            .build();
        assert!(matches!(unknown, Err(SpiderError::Configuration(_))));
    }

    #[test]
    fn test_invalid_concurrency_is_rejected() {
        let result = EngineBuilder::new(ConfiguredSpider::default())
            .concurrent_requests(0)
            .build();
        assert!(matches!(result, Err(SpiderError::Configuration(_))));
    }

    #[test]
    fn test_missing_settings_file_is_an_error() {
        let result = EngineBuilder::new(ConfiguredSpider::default())
            .settings_file("/nonexistent/settings.json")
            .build();
        assert!(matches!(result, Err(SpiderError::Settings(_))));
    }

    #[test]
    fn test_builder_subscribers_are_connected() {
        let engine = EngineBuilder::new(ConfiguredSpider::default())
            .connect(crate::signals::ENGINE_STARTED, |_| Ok(SignalOutcome::Done))
            .build()
            .unwrap();
        assert_eq!(engine.signals().subscriber_count(crate::signals::ENGINE_STARTED), 1);
    }
}
