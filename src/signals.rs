//! # Signals Module
//!
//! Publish/subscribe bus for engine lifecycle and per-request events.
//!
//! ## Overview
//!
//! A [`Signal`] is a named token; subscribers are closures registered with
//! [`SignalBus::connect`]. The payload travels separately as [`SignalArgs`]
//! so a single handler type covers every signal.
//!
//! A handler either finishes synchronously ([`SignalOutcome::Done`]) or hands
//! back a future ([`SignalOutcome::Deferred`]). [`SignalBus::send`] cannot
//! wait, so deferred outcomes are reported and dropped there, while
//! [`SignalBus::send_async`] awaits them in subscription order.
//!
//! Errors and panics raised by one subscriber are logged and returned to the
//! caller; they never prevent the remaining subscribers from running.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::signals::{SignalArgs, SignalBus, SignalOutcome, RESPONSE_RECEIVED};
//!
//! let bus = SignalBus::new();
//! bus.connect(RESPONSE_RECEIVED, |args| {
//!     if let SignalArgs::Response(response) = args {
//!         println!("got {}", response.url());
//!     }
//!     Ok(SignalOutcome::Done)
//! });
//! ```

use crate::error::{panic_message, Failure, SpiderError};
use crate::request::Request;
use crate::response::{Outcome, Response};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, trace};

/// Named event token; two signals are the same when their names match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signal(&'static str);

impl Signal {
    pub const fn new(name: &'static str) -> Self {
        Signal(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

pub const ENGINE_STARTED: Signal = Signal::new("engine_started");
pub const ENGINE_STOPPING: Signal = Signal::new("engine_stopping");
pub const ENGINE_STOPPED: Signal = Signal::new("engine_stopped");
pub const REQUEST_RECEIVED: Signal = Signal::new("request_received");
pub const RESPONSE_DOWNLOADED: Signal = Signal::new("response_downloaded");
pub const RESPONSE_RECEIVED: Signal = Signal::new("response_received");
pub const SPIDER_ERROR: Signal = Signal::new("spider_error");

/// Payload passed to subscribers.
#[derive(Debug, Clone, Copy)]
pub enum SignalArgs<'a> {
    Empty,
    Reason(&'a str),
    Request(&'a Request),
    Response(&'a Response),
    Failure(&'a Failure),
    Outcome(&'a Outcome),
}

/// What a subscriber returns.
pub enum SignalOutcome {
    Done,
    /// Work to be awaited by [`SignalBus::send_async`].
    Deferred(BoxFuture<'static, Result<(), SpiderError>>),
}

impl fmt::Debug for SignalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalOutcome::Done => f.write_str("Done"),
            SignalOutcome::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

pub type SignalHandler = Arc<dyn Fn(SignalArgs<'_>) -> Result<SignalOutcome, SpiderError> + Send + Sync>;

/// Identifies a subscription so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct SignalBus {
    subscribers: RwLock<HashMap<Signal, Vec<(SubscriptionId, SignalHandler)>>>,
    next_id: AtomicU64,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `handler` to `signal`.
    pub fn connect<F>(&self, signal: Signal, handler: F) -> SubscriptionId
    where
        F: Fn(SignalArgs<'_>) -> Result<SignalOutcome, SpiderError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .entry(signal)
            .or_default()
            .push((id, Arc::new(handler)));
        trace!("Connected subscriber {:?} to signal {}", id, signal);
        id
    }

    /// Removes one subscription; returns whether it existed.
    pub fn disconnect(&self, signal: Signal, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let Some(handlers) = subscribers.get_mut(&signal) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        before != handlers.len()
    }

    pub fn disconnect_all(&self, signal: Signal) {
        self.subscribers.write().remove(&signal);
    }

    pub fn subscriber_count(&self, signal: Signal) -> usize {
        self.subscribers.read().get(&signal).map_or(0, Vec::len)
    }

    /// Handlers are cloned out so subscribers may connect or disconnect while being invoked.
    fn handlers(&self, signal: Signal) -> Vec<SignalHandler> {
        self.subscribers
            .read()
            .get(&signal)
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    /// Delivers `signal` synchronously. Deferred outcomes are reported and dropped.
    pub fn send(&self, signal: Signal, args: SignalArgs<'_>) -> Vec<Result<(), SpiderError>> {
        let mut results = Vec::new();
        for handler in self.handlers(signal) {
            let result = match invoke(&handler, args) {
                Ok(SignalOutcome::Done) => Ok(()),
                Ok(SignalOutcome::Deferred(_)) => Err(SpiderError::ContractViolation(format!(
                    "subscriber of {} returned deferred work to a synchronous send",
                    signal
                ))),
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                error!("Error caught on signal handler for {}: {}", signal, e);
            }
            results.push(result);
        }
        results
    }

    /// Delivers `signal` and awaits every deferred outcome in subscription order.
    pub async fn send_async(&self, signal: Signal, args: SignalArgs<'_>) -> Vec<Result<(), SpiderError>> {
        let mut results = Vec::new();
        for handler in self.handlers(signal) {
            let result = match invoke(&handler, args) {
                Ok(SignalOutcome::Done) => Ok(()),
                Ok(SignalOutcome::Deferred(future)) => match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(result) => result,
                    Err(payload) => Err(SpiderError::GeneralError(format!(
                        "signal handler panicked: {}",
                        panic_message(payload.as_ref())
                    ))),
                },
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                error!("Error caught on signal handler for {}: {}", signal, e);
            }
            results.push(result);
        }
        results
    }
}

impl fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscribers = self.subscribers.read();
        let mut map = f.debug_map();
        for (signal, handlers) in subscribers.iter() {
            map.entry(&signal.name(), &handlers.len());
        }
        map.finish()
    }
}

fn invoke(handler: &SignalHandler, args: SignalArgs<'_>) -> Result<SignalOutcome, SpiderError> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| handler(args))) {
        Ok(result) => result,
        Err(payload) => Err(SpiderError::GeneralError(format!(
            "signal handler panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}
