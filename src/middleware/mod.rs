//! # Middleware Module
//!
//! The bidirectional processing pipeline wrapped around the downloader.
//!
//! ## Overview
//!
//! A [`Middleware`] sees every request on its way to the downloader and every
//! response or failure on its way back. The [`PipelineManager`] runs requests
//! through the stages in ascending order and outcomes in reverse, so the first
//! stage to touch a request is the last to touch its response.
//!
//! Each hook returns an action that either continues the chain or short-cuts
//! it: requests can be dropped, answered directly or restarted from the first
//! stage; outcomes can switch between the response and failure paths, be
//! dropped, turn into a follow-up request or be consumed outright.
//!
//! ## Key Components
//!
//! - [`Middleware`]: the stage trait, with passthrough defaults
//! - [`Hooks`]: which directions a stage takes part in, read once at construction
//! - [`RequestAction`] / [`ResponseAction`]: what a stage asks the chain to do next
//! - [`PipelineManager`]: ordering, dispatch and per-request opt-out via `<Name>_ENABLED`
//! - [`builtin`]: default headers, duplicate filter, retry, redirect and HTTP cache

pub mod builtin;
mod manager;

pub use manager::{MiddlewareFactory, PipelineManager, PipelineResult, RequestResult};

use crate::error::{Failure, SpiderError};
use crate::request::Request;
use crate::response::Response;
use async_trait::async_trait;

/// Directions a middleware takes part in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hooks {
    pub request: bool,
    pub response: bool,
    pub failure: bool,
}

impl Hooks {
    pub const ALL: Hooks = Hooks {
        request: true,
        response: true,
        failure: true,
    };

    pub const REQUEST: Hooks = Hooks {
        request: true,
        response: false,
        failure: false,
    };

    pub const OUTCOME: Hooks = Hooks {
        request: false,
        response: true,
        failure: true,
    };
}

impl Default for Hooks {
    fn default() -> Self {
        Hooks::ALL
    }
}

/// Result of a request-direction hook.
#[derive(Debug)]
pub enum RequestAction {
    /// Hand the (possibly replaced) request to the next stage.
    Continue(Request),
    /// Stop processing; the request is discarded.
    Drop,
    /// Skip the download and use this response instead.
    Respond(Response),
    /// Run the whole request chain again from the first stage.
    Restart(Request),
}

/// Result of a response- or failure-direction hook.
#[derive(Debug)]
pub enum ResponseAction {
    /// Continue on the response path.
    Continue(Response),
    /// Continue on the failure path.
    Fail(Failure),
    /// Stop processing; the outcome is discarded.
    Drop,
    /// Stop processing and schedule this request instead.
    Reschedule(Request),
    /// Stop processing; the middleware consumed the outcome.
    Handled,
}

/// A pipeline stage.
#[async_trait]
pub trait Middleware: Send {
    /// Stage name, also used for the `<name>_ENABLED` meta opt-out.
    fn name(&self) -> &str;

    fn hooks(&self) -> Hooks {
        Hooks::ALL
    }

    async fn process_request(&mut self, request: Request) -> Result<RequestAction, SpiderError> {
        Ok(RequestAction::Continue(request))
    }

    async fn process_response(&mut self, response: Response) -> Result<ResponseAction, SpiderError> {
        Ok(ResponseAction::Continue(response))
    }

    async fn process_failure(&mut self, failure: Failure) -> Result<ResponseAction, SpiderError> {
        Ok(ResponseAction::Fail(failure))
    }
}
