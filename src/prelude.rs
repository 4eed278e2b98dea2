//! A "prelude" for users of the `spider-engine` crate.
//!
//! This prelude re-exports the most commonly used traits and types so that
//! they can be easily imported.
//!
//! # Example
//!
//! ```
//! use spider_engine::prelude::*;
//! ```

pub use crate::{
    // Core structs
    Engine,
    EngineBuilder,
    EngineHandle,
    EngineState,
    // Core traits
    Spider,
    // Essential re-exports for trait implementation
    async_trait,
};

pub use crate::downloader::DownloadHandler;
pub use crate::error::{Failure, SpiderError};
pub use crate::middleware::{Hooks, Middleware, RequestAction, ResponseAction};
pub use crate::request::Request;
pub use crate::response::{Outcome, Response};
pub use crate::settings::{Settings, SettingsPriority};
pub use crate::signals::{Signal, SignalArgs, SignalOutcome};
pub use crate::spider::ParseOutput;
