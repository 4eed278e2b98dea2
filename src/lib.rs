//! # spider-engine
//!
//! Scheduling and pipeline-coordination engine for web crawlers.
//!
//! Provides the main components: the [`Engine`] and its [`EngineBuilder`], the
//! [`Spider`] trait, per-domain download slots, a bidirectional middleware
//! pipeline, layered settings and a signal bus.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::prelude::*;
//!
//! struct MySpider;
//!
//! #[async_trait]
//! impl Spider for MySpider {
//!     fn name(&self) -> &str {
//!         "example"
//!     }
//!
//!     fn start_urls(&self) -> Vec<&'static str> {
//!         vec!["https://example.com"]
//!     }
//!
//!     async fn parse(&mut self, response: Response) -> Result<ParseOutput, SpiderError> {
//!         println!("{} bytes from {}", response.body().len(), response.url());
//!         Ok(ParseOutput::new())
//!     }
//! }
//!
//! async fn run_crawler() -> Result<(), SpiderError> {
//!     let mut engine = EngineBuilder::new(MySpider).build()?;
//!     spider_engine::logging::init_tracing(engine.settings())?;
//!     engine.run().await
//! }
//! ```

pub mod builder;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod prelude;
pub mod queue;
pub mod request;
pub mod response;
pub mod settings;
pub mod signals;
pub mod spider;
pub mod stats;

pub use builder::EngineBuilder;
pub use engine::{Engine, EngineHandle, EngineState};
pub use error::{Failure, SpiderError};
pub use request::Request;
pub use response::{Outcome, Response};
pub use settings::Settings;
pub use spider::{ParseOutput, Spider};
pub use stats::StatCollector;

pub use async_trait::async_trait;
pub use tokio;
