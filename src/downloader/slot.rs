//! Per-partition admission gate.
//!
//! A [`Slot`] owns the requests routed to one partition (usually one host)
//! and decides when each may start transferring. It is a plain state machine:
//! the downloader feeds it the current time and acts on the returned
//! [`SlotStep`], which lists the released requests and, when the delay gate
//! closed, how long to wait before trying again.

use crate::request::Request;
use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Identifier the downloader assigns to every request it accepts.
pub type RequestId = u64;

/// Result of one drain pass over a slot.
#[derive(Debug, Default)]
pub struct SlotStep {
    /// Requests that may start transferring now, in admission order.
    pub released: Vec<(RequestId, Request)>,
    /// Set when the delay gate closed and no wake-up was pending yet.
    pub wake_after: Option<Duration>,
}

#[derive(Debug)]
pub struct Slot {
    concurrency: usize,
    delay: Duration,
    randomize_delay: bool,
    queue: VecDeque<(RequestId, Request)>,
    in_progress: HashSet<RequestId>,
    transferring: HashSet<RequestId>,
    last_download: Option<Instant>,
    wake_scheduled: bool,
}

impl Slot {
    pub fn new(concurrency: usize, delay: Duration, randomize_delay: bool) -> Self {
        Self {
            concurrency: concurrency.max(1),
            delay,
            randomize_delay,
            queue: VecDeque::new(),
            in_progress: HashSet::new(),
            transferring: HashSet::new(),
            last_download: None,
            wake_scheduled: false,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Delay to apply before the next transfer, jittered to `[0.5, 1.5] * delay` when randomized.
    pub fn effective_delay(&self) -> Duration {
        if self.randomize_delay && !self.delay.is_zero() {
            let secs = self.delay.as_secs_f64();
            Duration::from_secs_f64(rand::thread_rng().gen_range(0.5 * secs..=1.5 * secs))
        } else {
            self.delay
        }
    }

    /// Free transfer capacity.
    pub fn free_transfer_slots(&self) -> usize {
        self.concurrency.saturating_sub(self.transferring.len())
    }

    pub fn in_progress(&self) -> usize {
        self.in_progress.len()
    }

    pub fn transferring(&self) -> usize {
        self.transferring.len()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// True when the slot holds no request in any state.
    pub fn is_idle(&self) -> bool {
        self.in_progress.is_empty()
    }

    pub fn last_download(&self) -> Option<Instant> {
        self.last_download
    }

    pub fn enqueue(&mut self, id: RequestId, request: Request) {
        self.in_progress.insert(id);
        self.queue.push_back((id, request));
    }

    /// Forgets a request once its transfer ended, successfully or not.
    pub fn finish(&mut self, id: RequestId) {
        self.transferring.remove(&id);
        self.in_progress.remove(&id);
    }

    /// Marks the pending wake-up as delivered.
    pub fn wake_fired(&mut self) {
        self.wake_scheduled = false;
    }

    /// Releases as many queued requests as the delay and concurrency gates allow.
    pub fn process(&mut self, now: Instant) -> SlotStep {
        let mut step = SlotStep::default();

        while !self.queue.is_empty() {
            if !self.delay.is_zero() {
                if let Some(last) = self.last_download {
                    let ready_at = last + self.effective_delay();
                    if ready_at > now {
                        if !self.wake_scheduled {
                            self.wake_scheduled = true;
                            step.wake_after = Some(ready_at - now);
                        }
                        break;
                    }
                }
            }

            if self.transferring.len() >= self.concurrency {
                break;
            }

            let Some((id, request)) = self.queue.pop_front() else {
                break;
            };
            self.last_download = Some(now);
            self.transferring.insert(id);
            step.released.push((id, request));
        }

        step
    }

    /// Drops every queued request and returns how many were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        for (id, _) in self.queue.drain(..) {
            self.in_progress.remove(&id);
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(n: u64) -> Request {
        Request::new(&format!("http://example.com/{}", n)).unwrap()
    }

    fn ids(step: &SlotStep) -> Vec<RequestId> {
        step.released.iter().map(|(id, _)| *id).collect()
    }

    #[test]
    fn test_concurrency_gate() {
        let mut slot = Slot::new(2, Duration::ZERO, false);
        for id in 0..4 {
            slot.enqueue(id, request(id));
        }
        let now = Instant::now();

        let step = slot.process(now);
        assert_eq!(ids(&step), vec![0, 1]);
        assert_eq!(step.wake_after, None);
        assert_eq!(slot.transferring(), 2);
        assert_eq!(slot.in_progress(), 4);

        assert!(slot.process(now).released.is_empty());

        slot.finish(0);
        assert_eq!(ids(&slot.process(now)), vec![2]);
        assert!(slot.transferring() <= slot.concurrency());
    }

    #[test]
    fn test_finish_clears_both_sets() {
        let mut slot = Slot::new(1, Duration::ZERO, false);
        slot.enqueue(7, request(7));
        slot.process(Instant::now());
        assert!(!slot.is_idle());

        slot.finish(7);
        assert!(slot.is_idle());
        assert_eq!(slot.transferring(), 0);
    }

    #[test]
    fn test_delay_gate_spaces_transfers() {
        let mut slot = Slot::new(4, Duration::from_secs(2), false);
        for id in 0..3 {
            slot.enqueue(id, request(id));
        }
        let start = Instant::now();

        let first = slot.process(start);
        assert_eq!(ids(&first), vec![0]);
        assert_eq!(first.wake_after, Some(Duration::from_secs(2)));

        let early = slot.process(start + Duration::from_secs(1));
        assert!(early.released.is_empty());
        assert_eq!(early.wake_after, None, "wake-ups are coalesced");

        slot.wake_fired();
        let second = slot.process(start + Duration::from_secs(2));
        assert_eq!(ids(&second), vec![1]);
        assert_eq!(second.wake_after, Some(Duration::from_secs(2)));
        assert_eq!(slot.last_download(), Some(start + Duration::from_secs(2)));
    }

    #[test]
    fn test_randomized_delay_bounds() {
        let slot = Slot::new(1, Duration::from_secs(2), true);
        for _ in 0..100 {
            let delay = slot.effective_delay();
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(3));
        }

        let fixed = Slot::new(1, Duration::from_secs(2), false);
        assert_eq!(fixed.effective_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_clear_discards_queued_only() {
        let mut slot = Slot::new(1, Duration::ZERO, false);
        slot.enqueue(1, request(1));
        slot.enqueue(2, request(2));
        slot.process(Instant::now());

        assert_eq!(slot.clear(), 1);
        assert_eq!(slot.in_progress(), 1);
        assert_eq!(slot.transferring(), 1);
    }
}
