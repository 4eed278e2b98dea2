//! # Statistics Module
//!
//! Counters describing what the engine did during a crawl.
//!
//! ## Overview
//!
//! The `StatCollector` is shared as `Arc<StatCollector>` between the engine,
//! the downloader and the built-in middlewares. Every counter is an atomic,
//! so recording never blocks, and status codes are tallied in a `DashMap`.
//! The engine logs the collector when it stops.
//!
//! ## Key Metrics Tracked
//!
//! - **Requests**: received, sent, failed, retried, redirected, dropped, abandoned
//! - **Responses**: received, served from cache, status code distribution, bytes
//! - **Spider**: errors raised by callbacks and errbacks
//!
//! ## Example
//!
//! ```rust,ignore
//! let stats = engine.stats();
//! println!("{}", stats.to_json_string_pretty()?);
//! println!("{}", stats.to_markdown_string());
//! ```

use crate::error::SpiderError;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

// Point-in-time copy used by every presentation method.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub requests_received: usize,
    pub requests_sent: usize,
    pub requests_failed: usize,
    pub requests_retried: usize,
    pub requests_redirected: usize,
    pub requests_dropped: usize,
    pub requests_abandoned: usize,
    pub responses_received: usize,
    pub responses_from_cache: usize,
    pub bytes_downloaded: usize,
    pub spider_errors: usize,
    pub response_status_counts: BTreeMap<u16, usize>,
    #[serde(rename = "elapsed_secs", serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

fn serialize_secs<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

impl StatsSnapshot {
    fn per_second(&self, count: usize) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            count as f64 / secs
        } else {
            0.0
        }
    }

    fn formatted_bytes(&self) -> String {
        const KB: usize = 1024;
        const MB: usize = 1024 * KB;
        const GB: usize = 1024 * MB;

        match self.bytes_downloaded {
            b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
            b if b >= MB => format!("{:.2} MB", b as f64 / MB as f64),
            b if b >= KB => format!("{:.2} KB", b as f64 / KB as f64),
            b => format!("{} B", b),
        }
    }

    fn status_list(&self, separator: &str, fmt: impl Fn(u16, usize) -> String) -> Option<String> {
        if self.response_status_counts.is_empty() {
            return None;
        }
        Some(
            self.response_status_counts
                .iter()
                .map(|(code, count)| fmt(*code, *count))
                .collect::<Vec<_>>()
                .join(separator),
        )
    }
}

/// Thread-safe crawl counters.
#[derive(Debug)]
pub struct StatCollector {
    start_time: Instant,
    requests_received: AtomicUsize,
    requests_sent: AtomicUsize,
    requests_failed: AtomicUsize,
    requests_retried: AtomicUsize,
    requests_redirected: AtomicUsize,
    requests_dropped: AtomicUsize,
    requests_abandoned: AtomicUsize,
    responses_received: AtomicUsize,
    responses_from_cache: AtomicUsize,
    bytes_downloaded: AtomicUsize,
    spider_errors: AtomicUsize,
    response_status_counts: DashMap<u16, usize>,
}

impl StatCollector {
    pub fn new() -> Self {
        StatCollector {
            start_time: Instant::now(),
            requests_received: AtomicUsize::new(0),
            requests_sent: AtomicUsize::new(0),
            requests_failed: AtomicUsize::new(0),
            requests_retried: AtomicUsize::new(0),
            requests_redirected: AtomicUsize::new(0),
            requests_dropped: AtomicUsize::new(0),
            requests_abandoned: AtomicUsize::new(0),
            responses_received: AtomicUsize::new(0),
            responses_from_cache: AtomicUsize::new(0),
            bytes_downloaded: AtomicUsize::new(0),
            spider_errors: AtomicUsize::new(0),
            response_status_counts: DashMap::new(),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_received: self.requests_received.load(Ordering::SeqCst),
            requests_sent: self.requests_sent.load(Ordering::SeqCst),
            requests_failed: self.requests_failed.load(Ordering::SeqCst),
            requests_retried: self.requests_retried.load(Ordering::SeqCst),
            requests_redirected: self.requests_redirected.load(Ordering::SeqCst),
            requests_dropped: self.requests_dropped.load(Ordering::SeqCst),
            requests_abandoned: self.requests_abandoned.load(Ordering::SeqCst),
            responses_received: self.responses_received.load(Ordering::SeqCst),
            responses_from_cache: self.responses_from_cache.load(Ordering::SeqCst),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::SeqCst),
            spider_errors: self.spider_errors.load(Ordering::SeqCst),
            response_status_counts: self
                .response_status_counts
                .iter()
                .map(|entry| (*entry.key(), *entry.value()))
                .collect(),
            elapsed: self.start_time.elapsed(),
        }
    }

    /// Request accepted into the inbound queue.
    pub(crate) fn increment_requests_received(&self) {
        self.requests_received.fetch_add(1, Ordering::SeqCst);
    }

    /// Request handed to a download handler.
    pub(crate) fn increment_requests_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_retried(&self) {
        self.requests_retried.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_redirected(&self) {
        self.requests_redirected.fetch_add(1, Ordering::SeqCst);
    }

    /// Request dropped by a pipeline stage.
    pub(crate) fn increment_requests_dropped(&self) {
        self.requests_dropped.fetch_add(1, Ordering::SeqCst);
    }

    /// Requests left behind by a shutdown.
    pub(crate) fn add_requests_abandoned(&self, count: usize) {
        self.requests_abandoned.fetch_add(count, Ordering::SeqCst);
    }

    pub(crate) fn increment_responses_from_cache(&self) {
        self.responses_from_cache.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts a downloaded response along with its status and size.
    pub(crate) fn record_response(&self, status: u16, bytes: usize) {
        self.responses_received.fetch_add(1, Ordering::SeqCst);
        self.bytes_downloaded.fetch_add(bytes, Ordering::SeqCst);
        *self.response_status_counts.entry(status).or_insert(0) += 1;
    }

    pub(crate) fn increment_spider_errors(&self) {
        self.spider_errors.fetch_add(1, Ordering::SeqCst);
    }

    pub fn requests_received(&self) -> usize {
        self.requests_received.load(Ordering::SeqCst)
    }

    pub fn requests_sent(&self) -> usize {
        self.requests_sent.load(Ordering::SeqCst)
    }

    pub fn requests_failed(&self) -> usize {
        self.requests_failed.load(Ordering::SeqCst)
    }

    pub fn requests_retried(&self) -> usize {
        self.requests_retried.load(Ordering::SeqCst)
    }

    pub fn requests_redirected(&self) -> usize {
        self.requests_redirected.load(Ordering::SeqCst)
    }

    pub fn requests_dropped(&self) -> usize {
        self.requests_dropped.load(Ordering::SeqCst)
    }

    pub fn requests_abandoned(&self) -> usize {
        self.requests_abandoned.load(Ordering::SeqCst)
    }

    pub fn responses_received(&self) -> usize {
        self.responses_received.load(Ordering::SeqCst)
    }

    pub fn responses_from_cache(&self) -> usize {
        self.responses_from_cache.load(Ordering::SeqCst)
    }

    pub fn spider_errors(&self) -> usize {
        self.spider_errors.load(Ordering::SeqCst)
    }

    pub fn status_count(&self, status: u16) -> usize {
        self.response_status_counts.get(&status).map_or(0, |count| *count)
    }

    pub fn to_json_string(&self) -> Result<String, SpiderError> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    pub fn to_json_string_pretty(&self) -> Result<String, SpiderError> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }

    /// Renders the current statistics as a Markdown report.
    pub fn to_markdown_string(&self) -> String {
        let snapshot = self.snapshot();
        let status_codes = snapshot
            .status_list("\n", |code, count| format!("- **{}**: {}", code, count))
            .unwrap_or_else(|| "N/A".to_string());

        format!(
            r#"# Crawl Statistics Report

- **Duration**: {:?}
- **Average Speed**: {:.2} req/s, {:.2} resp/s

## Requests
| Metric     | Count |
|------------|-------|
| Received   | {} |
| Sent       | {} |
| Failed     | {} |
| Retried    | {} |
| Redirected | {} |
| Dropped    | {} |
| Abandoned  | {} |

## Responses
| Metric     | Count |
|------------|-------|
| Received   | {} |
| From Cache | {} |
| Downloaded | {} |

## Spider
| Metric     | Count |
|------------|-------|
| Errors     | {} |

## Status Codes
{}
"#,
            snapshot.elapsed,
            snapshot.per_second(snapshot.requests_sent),
            snapshot.per_second(snapshot.responses_received),
            snapshot.requests_received,
            snapshot.requests_sent,
            snapshot.requests_failed,
            snapshot.requests_retried,
            snapshot.requests_redirected,
            snapshot.requests_dropped,
            snapshot.requests_abandoned,
            snapshot.responses_received,
            snapshot.responses_from_cache,
            snapshot.formatted_bytes(),
            snapshot.spider_errors,
            status_codes
        )
    }
}

impl Default for StatCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StatCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();

        writeln!(f, "\nCrawl Statistics")?;
        writeln!(f, "----------------")?;
        writeln!(f, "  duration : {:?}", snapshot.elapsed)?;
        writeln!(
            f,
            "  speed    : req/s: {:.2}, resp/s: {:.2}",
            snapshot.per_second(snapshot.requests_sent),
            snapshot.per_second(snapshot.responses_received)
        )?;
        writeln!(
            f,
            "  requests : received: {}, sent: {}, fail: {}, retry: {}, redirect: {}, drop: {}, abandoned: {}",
            snapshot.requests_received,
            snapshot.requests_sent,
            snapshot.requests_failed,
            snapshot.requests_retried,
            snapshot.requests_redirected,
            snapshot.requests_dropped,
            snapshot.requests_abandoned
        )?;
        writeln!(
            f,
            "  response : received: {}, from_cache: {}, downloaded: {}",
            snapshot.responses_received,
            snapshot.responses_from_cache,
            snapshot.formatted_bytes()
        )?;
        writeln!(f, "  spider   : errors: {}", snapshot.spider_errors)?;

        let status = snapshot
            .status_list(", ", |code, count| format!("{}: {}", code, count))
            .unwrap_or_else(|| "none".to_string());
        writeln!(f, "  status   : {}\n", status)
    }
}
