//! The engine loop and its scheduling operations.

use super::handle::{ControlCommand, EngineHandle};
use super::state::{EngineState, SharedState};
use crate::downloader::{Downloader, DownloaderEvent};
use crate::error::{panic_message, Failure, SpiderError};
use crate::middleware::{PipelineManager, PipelineResult, RequestResult};
use crate::queue::{FifoQueue, PriorityQueue, Queue};
use crate::request::Request;
use crate::response::{Outcome, Response};
use crate::settings::{Settings, SHUTDOWN_TIMEOUT};
use crate::signals::{
    SignalArgs, SignalBus, ENGINE_STARTED, ENGINE_STOPPED, ENGINE_STOPPING, REQUEST_RECEIVED, RESPONSE_DOWNLOADED,
    RESPONSE_RECEIVED, SPIDER_ERROR,
};
use crate::spider::{ParseOutput, Spider};
use crate::stats::StatCollector;
use futures_util::FutureExt;
use kanal::AsyncReceiver;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, error, info, trace, warn};

/// Queue-check interval while running.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);
/// Queue-check interval while paused.
pub const PAUSED_TICK_INTERVAL: Duration = Duration::from_secs(5);

type CallbackResult = Result<Result<ParseOutput, SpiderError>, Box<dyn Any + Send>>;

/// Coordinates the spider, the middleware pipeline and the downloader.
///
/// Built by [`EngineBuilder`](crate::builder::EngineBuilder). All queue, slot,
/// pipeline and counter state is owned here and only touched from the task
/// driving [`Engine::run`].
pub struct Engine {
    settings: Arc<Settings>,
    signals: Arc<SignalBus>,
    stats: Arc<StatCollector>,
    spider: Box<dyn Spider>,
    pipeline: PipelineManager,
    downloader: Downloader,
    events: AsyncReceiver<DownloaderEvent>,
    inbound: PriorityQueue<Request>,
    outbound: FifoQueue<Outcome>,
    pending: usize,
    state: SharedState,
    control: AsyncReceiver<ControlCommand>,
    handle: EngineHandle,
    shutdown_timeout: Duration,
    stop_reason: Option<String>,
}

impl Engine {
    /// Assembles an engine from already-initialised components and hands the
    /// spider its [`EngineHandle`], which completes setup.
    pub(crate) fn new(
        settings: Arc<Settings>,
        signals: Arc<SignalBus>,
        stats: Arc<StatCollector>,
        downloader: Downloader,
        events: AsyncReceiver<DownloaderEvent>,
        pipeline: PipelineManager,
        mut spider: Box<dyn Spider>,
    ) -> Result<Self, SpiderError> {
        let shutdown_timeout = settings.get_float_or(SHUTDOWN_TIMEOUT, 30.0)?;
        if !shutdown_timeout.is_finite() || shutdown_timeout < 0.0 {
            return Err(SpiderError::Configuration(format!(
                "SHUTDOWN_TIMEOUT must be a non-negative number, got {}",
                shutdown_timeout
            )));
        }

        let state = SharedState::new();
        let (commands, control) = kanal::unbounded();
        let handle = EngineHandle::new(commands, state.clone());
        spider.set_engine(handle.clone());
        state.set(EngineState::SetUp);

        debug!(
            "[{}] Engine set up with middlewares {:?}",
            spider.name(),
            pipeline.names()
        );

        Ok(Engine {
            settings,
            signals,
            stats,
            spider,
            pipeline,
            downloader,
            events,
            inbound: PriorityQueue::fifo(),
            outbound: FifoQueue::new(),
            pending: 0,
            state,
            control: control.to_async(),
            handle,
            shutdown_timeout: Duration::from_secs_f64(shutdown_timeout),
            stop_reason: None,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn signals(&self) -> &Arc<SignalBus> {
        &self.signals
    }

    pub fn stats(&self) -> Arc<StatCollector> {
        Arc::clone(&self.stats)
    }

    /// Requests accepted by the pipeline whose outcome has not been handled yet.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Requests waiting in the inbound queue for a free download slot.
    pub fn queued(&self) -> usize {
        self.inbound.len().unwrap_or(0)
    }

    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }

    /// Starts the crawl: emits `engine_started` and seeds the start requests.
    ///
    /// Only valid right after setup; a stopped engine cannot be restarted.
    pub async fn start(&mut self) -> Result<(), SpiderError> {
        let state = self.state();
        if state != EngineState::SetUp {
            return Err(SpiderError::GeneralError(format!(
                "engine cannot be started while {}",
                state
            )));
        }
        info!("[{}] Engine starting", self.spider.name());
        self.state.set(EngineState::Running);
        self.signals.send_async(ENGINE_STARTED, SignalArgs::Empty).await;

        match self.spider.start_requests() {
            Ok(requests) => {
                debug!("[{}] Seeding {} start requests", self.spider.name(), requests.len());
                for request in requests {
                    self.download(request).await;
                }
            }
            Err(e) => {
                error!("[{}] Failed to build start requests: {}", self.spider.name(), e);
                self.stats.increment_spider_errors();
            }
        }
        Ok(())
    }

    /// Starts the engine and drives it until it stops.
    pub async fn run(&mut self) -> Result<(), SpiderError> {
        self.start().await?;

        let events = self.events.clone();
        let control = self.control.clone();
        let mut ctrl_c_armed = true;
        let mut next_tick = Instant::now() + TICK_INTERVAL;

        while self.state() != EngineState::Stopped {
            tokio::select! {
                _ = sleep_until(next_tick) => {
                    self.process_queue().await;
                    next_tick = Instant::now() + self.tick_interval();
                }
                Ok(event) = events.recv() => {
                    self.on_downloader_event(event);
                    self.process_queue().await;
                }
                Ok(command) = control.recv() => {
                    self.on_command(command).await;
                    next_tick = next_tick.min(Instant::now() + self.tick_interval());
                }
                result = tokio::signal::ctrl_c(), if ctrl_c_armed => {
                    match result {
                        Ok(()) => {
                            info!("Ctrl-C received, shutting down");
                            self.stop("shutdown").await;
                        }
                        Err(e) => {
                            warn!("Unable to listen for Ctrl-C: {}", e);
                            ctrl_c_armed = false;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn tick_interval(&self) -> Duration {
        if self.state() == EngineState::Paused {
            PAUSED_TICK_INTERVAL
        } else {
            TICK_INTERVAL
        }
    }

    async fn on_command(&mut self, command: ControlCommand) {
        trace!("Control command: {:?}", command);
        match command {
            ControlCommand::Pause => self.pause(),
            ControlCommand::Unpause => self.unpause(),
            ControlCommand::Stop(reason) => self.stop(&reason).await,
        }
    }

    /// Sends `request` through the request-direction pipeline and schedules the result.
    pub async fn download(&mut self, request: Request) {
        if !self.state().is_active() {
            debug!("Engine is {}, discarding {}", self.state(), request);
            return;
        }
        self.stats.increment_requests_received();

        match self.pipeline.process_request(request).await {
            Ok(RequestResult::Download(request)) => {
                self.pending += 1;
                self.signals.send_async(REQUEST_RECEIVED, SignalArgs::Request(&request)).await;
                trace!("Scheduling {} (priority {})", request, request.priority());
                if let Err(e) = self.inbound.push(request.priority(), request) {
                    error!("Inbound queue rejected a request: {}", e);
                    self.pending -= 1;
                    return;
                }
                self.fill_downloader();
            }
            Ok(RequestResult::Respond(response)) => {
                self.pending += 1;
                self.push_outcome(Outcome::Response(response));
            }
            Err(failure) if failure.is_drop() => {
                debug!("Dropped: {}", failure);
                self.stats.increment_requests_dropped();
            }
            Err(failure) => {
                warn!("Request pipeline failed: {}", failure);
                self.pending += 1;
                self.push_outcome(Outcome::Failure(failure));
            }
        }
    }

    fn push_outcome(&mut self, outcome: Outcome) {
        if let Err(e) = self.outbound.push(outcome) {
            error!("Outbound queue rejected an outcome: {}", e);
            self.pending = self.pending.saturating_sub(1);
        }
    }

    /// Moves requests from inbound into the downloader while it has capacity.
    fn fill_downloader(&mut self) {
        while self.downloader.can_fetch() && !self.inbound.is_empty().unwrap_or(true) {
            let request = match self.inbound.pop() {
                Ok(request) => request,
                Err(e) => {
                    error!("Failed to dequeue request: {}", e);
                    return;
                }
            };
            if let Err(e) = self.downloader.fetch(request) {
                error!("Downloader rejected request: {}", e);
                self.pending = self.pending.saturating_sub(1);
            }
        }
    }

    fn on_downloader_event(&mut self, event: DownloaderEvent) {
        if let Some((request, result)) = self.downloader.on_event(event) {
            let outcome = match result {
                Ok(mut response) => {
                    response.set_request(request);
                    Outcome::Response(response)
                }
                Err(e) => Outcome::Failure(Failure::with_request(e, request)),
            };
            self.push_outcome(outcome);
        }
        self.fill_downloader();
    }

    /// Handles every outbound outcome, then stops with `"finished"` once idle.
    pub async fn process_queue(&mut self) {
        if self.state() != EngineState::Running {
            return;
        }
        self.drain_outbound().await;

        if self.state() == EngineState::Running && self.pending == 0 && self.outbound.is_empty().unwrap_or(true) {
            self.stop("finished").await;
        }
    }

    async fn drain_outbound(&mut self) {
        while let Ok(outcome) = self.outbound.pop() {
            self.signals
                .send_async(RESPONSE_DOWNLOADED, SignalArgs::Outcome(&outcome))
                .await;
            match self.pipeline.process_response(outcome).await {
                Ok(result) => self.handle_pipeline_result(result).await,
                Err(e) => error!("Response pipeline aborted: {}", e),
            }
            self.pending = self.pending.saturating_sub(1);
        }
    }

    async fn handle_pipeline_result(&mut self, result: PipelineResult) {
        match result {
            PipelineResult::Handled => trace!("Outcome consumed by a middleware"),
            PipelineResult::Reschedule(request) => self.download(request).await,
            PipelineResult::Failure(failure) if failure.is_drop() => {
                debug!("Dropped: {}", failure);
                self.stats.increment_requests_dropped();
            }
            PipelineResult::Response(response) => self.call_callback(response).await,
            PipelineResult::Failure(failure) => self.call_errback(failure).await,
        }
    }

    async fn call_callback(&mut self, response: Response) {
        self.signals
            .send_async(RESPONSE_RECEIVED, SignalArgs::Response(&response))
            .await;
        let request = response.request().ok().cloned();
        let callback = request.as_ref().and_then(|r| r.callback().cloned());
        let result = match callback {
            Some(callback) => AssertUnwindSafe(callback(response)).catch_unwind().await,
            None => AssertUnwindSafe(self.spider.parse(response)).catch_unwind().await,
        };
        self.handle_output(request, result).await;
    }

    async fn call_errback(&mut self, failure: Failure) {
        let request = failure.request().cloned();
        let errback = request.as_ref().and_then(|r| r.errback().cloned());
        let result = match errback {
            Some(errback) => AssertUnwindSafe(errback(failure)).catch_unwind().await,
            None => AssertUnwindSafe(self.spider.handle_failure(failure)).catch_unwind().await,
        };
        self.handle_output(request, result).await;
    }

    async fn handle_output(&mut self, request: Option<Request>, result: CallbackResult) {
        let error = match result {
            Ok(Ok(output)) => {
                for request in output.into_requests() {
                    self.download(request).await;
                }
                return;
            }
            Ok(Err(e)) => e,
            Err(payload) => SpiderError::Spider(format!("callback panicked: {}", panic_message(payload.as_ref()))),
        };

        let failure = match request {
            Some(request) => Failure::with_request(error, request),
            None => Failure::new(error),
        };
        error!("[{}] Spider error processing {}", self.spider.name(), failure);
        self.stats.increment_spider_errors();
        self.signals.send_async(SPIDER_ERROR, SignalArgs::Failure(&failure)).await;
    }

    /// Stops taking requests from inbound; outcomes are held until [`unpause`](Self::unpause).
    pub fn pause(&mut self) {
        if self.state() != EngineState::Running {
            debug!("Ignoring pause while {}", self.state());
            return;
        }
        info!("[{}] Engine paused", self.spider.name());
        self.state.set(EngineState::Paused);
        self.downloader.pause();
    }

    pub fn unpause(&mut self) {
        if self.state() != EngineState::Paused {
            debug!("Ignoring unpause while {}", self.state());
            return;
        }
        info!("[{}] Engine resumed", self.spider.name());
        self.state.set(EngineState::Running);
        self.downloader.unpause();
        self.fill_downloader();
    }

    /// Shuts the engine down. Does nothing unless running or paused.
    ///
    /// In-progress downloads get up to `SHUTDOWN_TIMEOUT` to finish and their
    /// outcomes are still handed to callbacks; requests those callbacks yield
    /// are discarded.
    pub async fn stop(&mut self, reason: &str) {
        if !self.state().is_active() {
            debug!("Ignoring stop({}) while {}", reason, self.state());
            return;
        }
        info!("[{}] Closing engine ({})", self.spider.name(), reason);
        self.state.set(EngineState::Stopping);
        self.signals.send_async(ENGINE_STOPPING, SignalArgs::Reason(reason)).await;

        self.downloader.pause();
        self.quiesce().await;
        self.drain_outbound().await;

        let in_progress = self.downloader.close();
        let queued = self.inbound.len().unwrap_or(0);
        if queued > 0 {
            info!("Discarding {} queued requests", queued);
        }
        self.stats.add_requests_abandoned(in_progress + queued);
        if let Err(e) = self.inbound.close() {
            debug!("Inbound queue already closed: {}", e);
        }
        if let Err(e) = self.outbound.close() {
            debug!("Outbound queue already closed: {}", e);
        }
        self.pending = 0;

        info!("[{}] Crawl statistics:\n{}", self.spider.name(), self.stats.to_markdown_string());
        self.signals.send_async(ENGINE_STOPPED, SignalArgs::Reason(reason)).await;
        self.stop_reason = Some(reason.to_string());
        self.state.set(EngineState::Stopped);
        info!("[{}] Engine stopped ({})", self.spider.name(), reason);
    }

    /// Keeps applying downloader events until nothing is in progress or the timeout passes.
    async fn quiesce(&mut self) {
        let deadline = Instant::now() + self.shutdown_timeout;
        while self.downloader.active() > 0 {
            match timeout_at(deadline, self.events.recv()).await {
                Ok(Ok(event)) => self.on_downloader_event(event),
                Ok(Err(_)) => break,
                Err(_) => {
                    warn!(
                        "Shutdown timeout reached with {} downloads in progress",
                        self.downloader.active()
                    );
                    break;
                }
            }
        }
    }
}
