//! # Engine Module
//!
//! The scheduling core that moves requests from the spider through the
//! middleware pipeline, the download slots and back to spider callbacks.
//!
//! ## Overview
//!
//! The [`Engine`] owns two queues: a priority inbound queue of requests
//! waiting for a download slot and a FIFO outbound queue of download outcomes
//! waiting for the response pipeline. A `pending` counter tracks every request
//! the pipeline accepted until its outcome has been handled; when it reaches
//! zero with nothing left outbound the engine stops with reason `"finished"`.
//!
//! [`Engine::run`] multiplexes a queue-check ticker, downloader events,
//! commands from [`EngineHandle`]s and Ctrl-C on a single task.
//!
//! ## Key Components
//!
//! - [`Engine`]: queues, counters, lifecycle and callback dispatch
//! - [`EngineHandle`]: cloneable pause / unpause / stop control
//! - [`EngineState`]: lifecycle states observable through the handle

mod core;
mod handle;
mod state;

pub use self::core::{Engine, PAUSED_TICK_INTERVAL, TICK_INTERVAL};
pub use handle::{ControlCommand, EngineHandle};
pub use state::EngineState;
