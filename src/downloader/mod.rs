//! # Downloader Module
//!
//! Routes requests into per-domain slots and runs the transfers.
//!
//! ## Overview
//!
//! The downloader sits between the engine's inbound and outbound queues. The
//! engine hands it requests while [`Downloader::can_fetch`] holds; each one is
//! routed to a [`Slot`] chosen by host, and the slot decides when it may
//! start. Released requests run on their own tokio task, which only calls the
//! [`DownloadHandler`] and reports back over a `kanal` channel. All slot and
//! counter state is therefore owned and mutated by the engine task alone.
//!
//! ## Policy
//!
//! - `DOWNLOAD_DELAY > 0`: one shared slot, global and per-slot concurrency of 1
//! - `CONCURRENT_REQUESTS_PER_DOMAIN` of 0 or at least `CONCURRENT_REQUESTS`:
//!   one shared slot with the global concurrency
//! - otherwise: one slot per host with the per-domain concurrency
//!
//! Slots whose requests have all finished are evicted once the slot table
//! reaches twice the global concurrency.

mod handlers;
mod slot;

pub use handlers::{
    DownloadHandler, FileHandler, HandlerRegistry, HttpHandler, META_DOWNLOAD_MAXSIZE, META_DOWNLOAD_TIMEOUT,
};
pub use slot::{RequestId, Slot, SlotStep};

use crate::error::{panic_message, SpiderError};
use crate::request::Request;
use crate::response::Response;
use crate::settings::{
    Settings, CONCURRENT_REQUESTS, CONCURRENT_REQUESTS_PER_DOMAIN, DOWNLOAD_DELAY, RANDOMIZE_DOWNLOAD_DELAY,
};
use crate::stats::StatCollector;
use futures_util::FutureExt;
use kanal::{AsyncReceiver, AsyncSender};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Key of the slot shared by every request when per-domain limiting is off.
pub const SHARED_SLOT: &str = "";

/// Notifications delivered from download tasks and slot timers to the engine.
#[derive(Debug)]
pub enum DownloaderEvent {
    Completed {
        slot: String,
        id: RequestId,
        request: Request,
        result: Result<Response, SpiderError>,
    },
    SlotReady(String),
}

/// Concurrency and delay settings resolved into a routing policy.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotPolicy {
    pub total_concurrency: usize,
    pub slot_concurrency: usize,
    pub per_domain: bool,
    pub delay: Duration,
    pub randomize_delay: bool,
}

impl SlotPolicy {
    pub fn new(total: usize, per_domain: usize, delay: Duration, randomize_delay: bool) -> Self {
        let total = total.max(1);
        if !delay.is_zero() {
            SlotPolicy {
                total_concurrency: 1,
                slot_concurrency: 1,
                per_domain: false,
                delay,
                randomize_delay,
            }
        } else if per_domain == 0 || per_domain >= total {
            SlotPolicy {
                total_concurrency: total,
                slot_concurrency: total,
                per_domain: false,
                delay,
                randomize_delay,
            }
        } else {
            SlotPolicy {
                total_concurrency: total,
                slot_concurrency: per_domain,
                per_domain: true,
                delay,
                randomize_delay,
            }
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, SpiderError> {
        let total = settings.get_int_or(CONCURRENT_REQUESTS, 16)?;
        let per_domain = settings.get_int_or(CONCURRENT_REQUESTS_PER_DOMAIN, 8)?;
        let delay = settings.get_float_or(DOWNLOAD_DELAY, 0.0)?;
        if total < 1 {
            return Err(SpiderError::Configuration(format!(
                "CONCURRENT_REQUESTS must be at least 1, got {}",
                total
            )));
        }
        if !delay.is_finite() || delay < 0.0 {
            return Err(SpiderError::Configuration(format!(
                "DOWNLOAD_DELAY must be a non-negative number, got {}",
                delay
            )));
        }
        Ok(Self::new(
            total as usize,
            per_domain.max(0) as usize,
            Duration::from_secs_f64(delay),
            settings.get_bool_or(RANDOMIZE_DOWNLOAD_DELAY, true)?,
        ))
    }

    /// Slot key for `request`.
    pub fn slot_key(&self, request: &Request) -> String {
        if self.per_domain {
            request.host().unwrap_or(SHARED_SLOT).to_string()
        } else {
            SHARED_SLOT.to_string()
        }
    }
}

pub struct Downloader {
    handler: Arc<dyn DownloadHandler>,
    stats: Arc<StatCollector>,
    policy: SlotPolicy,
    slots: HashMap<String, Slot>,
    active: usize,
    next_id: RequestId,
    tasks: JoinSet<()>,
    events: AsyncSender<DownloaderEvent>,
    paused: bool,
    closed: bool,
}

impl Downloader {
    /// Creates a downloader and the receiving end of its event channel.
    pub fn new(
        policy: SlotPolicy,
        handler: Arc<dyn DownloadHandler>,
        stats: Arc<StatCollector>,
    ) -> (Self, AsyncReceiver<DownloaderEvent>) {
        let (events, receiver) = kanal::unbounded_async();
        debug!(
            "Downloader initialised: total_concurrency={}, slot_concurrency={}, per_domain={}, delay={:?}",
            policy.total_concurrency, policy.slot_concurrency, policy.per_domain, policy.delay
        );
        let downloader = Downloader {
            handler,
            stats,
            policy,
            slots: HashMap::new(),
            active: 0,
            next_id: 0,
            tasks: JoinSet::new(),
            events,
            paused: false,
            closed: false,
        };
        (downloader, receiver)
    }

    pub fn policy(&self) -> &SlotPolicy {
        &self.policy
    }

    /// Requests accepted and not yet completed, queued in slots or transferring.
    pub fn active(&self) -> usize {
        self.active
    }

    /// True while the downloader wants another request from inbound.
    pub fn can_fetch(&self) -> bool {
        !self.closed && !self.paused && self.active < self.policy.total_concurrency
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn unpause(&mut self) {
        self.paused = false;
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, key: &str) -> Option<&Slot> {
        self.slots.get(key)
    }

    /// Accepts `request` into its slot and starts whatever the slot releases.
    pub fn fetch(&mut self, request: Request) -> Result<RequestId, SpiderError> {
        if self.closed {
            return Err(SpiderError::GeneralError("downloader is closed".to_string()));
        }
        let key = self.policy.slot_key(&request);
        let id = self.next_id;
        self.next_id += 1;
        self.active += 1;

        trace!("Routing {} to slot {:?}", request, key);
        let policy = &self.policy;
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Slot::new(policy.slot_concurrency, policy.delay, policy.randomize_delay))
            .enqueue(id, request);
        self.process_slot(&key);
        Ok(id)
    }

    /// Applies an event from the channel.
    ///
    /// Completions yield the request together with its download result.
    pub fn on_event(&mut self, event: DownloaderEvent) -> Option<(Request, Result<Response, SpiderError>)> {
        while self.tasks.try_join_next().is_some() {}

        match event {
            DownloaderEvent::Completed {
                slot,
                id,
                request,
                result,
            } => {
                self.active = self.active.saturating_sub(1);
                if let Some(state) = self.slots.get_mut(&slot) {
                    state.finish(id);
                }
                match &result {
                    Ok(response) => {
                        trace!("Downloaded {} ({})", request, response.status());
                        self.stats.record_response(response.status().as_u16(), response.body().len());
                    }
                    Err(e) => {
                        debug!("Download of {} failed: {}", request, e);
                        self.stats.increment_requests_failed();
                    }
                }
                if !self.closed {
                    self.process_slot(&slot);
                    self.collect_idle_slots();
                }
                Some((request, result))
            }
            DownloaderEvent::SlotReady(key) => {
                if let Some(slot) = self.slots.get_mut(&key) {
                    slot.wake_fired();
                }
                if !self.closed {
                    self.process_slot(&key);
                }
                None
            }
        }
    }

    fn process_slot(&mut self, key: &str) {
        let Some(slot) = self.slots.get_mut(key) else {
            return;
        };
        let step = slot.process(Instant::now());

        if let Some(wait) = step.wake_after {
            trace!("Slot {:?} delayed for {:?}", key, wait);
            let events = self.events.clone();
            let key = key.to_string();
            self.tasks.spawn(async move {
                tokio::time::sleep(wait).await;
                let _ = events.send(DownloaderEvent::SlotReady(key)).await;
            });
        }

        for (id, request) in step.released {
            self.start_transfer(key.to_string(), id, request);
        }
    }

    fn start_transfer(&mut self, slot: String, id: RequestId, request: Request) {
        self.stats.increment_requests_sent();
        let handler = Arc::clone(&self.handler);
        let events = self.events.clone();
        self.tasks.spawn(async move {
            let result = match AssertUnwindSafe(handler.download(&request)).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(SpiderError::GeneralError(format!(
                    "download handler panicked: {}",
                    panic_message(payload.as_ref())
                ))),
            };
            let event = DownloaderEvent::Completed {
                slot,
                id,
                request,
                result,
            };
            if events.send(event).await.is_err() {
                trace!("Downloader event channel closed, discarding completion");
            }
        });
    }

    fn collect_idle_slots(&mut self) {
        if self.slots.len() < 2 * self.policy.total_concurrency {
            return;
        }
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_idle());
        trace!("Evicted {} idle download slots", before - self.slots.len());
    }

    /// Stops all transfers and timers and forgets every slot.
    ///
    /// Returns the number of accepted requests that never completed.
    pub fn close(&mut self) -> usize {
        if self.closed {
            return 0;
        }
        self.closed = true;
        self.tasks.abort_all();
        let abandoned = self.active;
        if abandoned > 0 {
            warn!("Downloader closed with {} requests still in progress", abandoned);
        }
        self.slots.clear();
        self.active = 0;
        abandoned
    }
}
