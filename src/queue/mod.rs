//! # Queue Module
//!
//! Container contract shared by the engine's inbound and outbound queues.
//!
//! ## Overview
//!
//! Every queue tracks its size and a closed flag. Using a closed queue in any
//! way (including closing it again) fails with [`QueueError::Closed`], and
//! taking from an empty open queue fails with [`QueueError::Empty`].
//!
//! ## Implementations
//!
//! - [`FifoQueue`]: plain first-in first-out buffer
//! - [`Heap`]: array-backed binary max-heap
//! - [`PriorityQueue`]: heap of priorities over lazily created FIFO sub-queues

mod fifo;
mod heap;
mod priority;

pub use fifo::FifoQueue;
pub use heap::Heap;
pub use priority::{PriorityQueue, SubQueueFactory};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
    #[error("queue is empty")]
    Empty,
}

/// FIFO-style container contract.
pub trait Queue<T>: Send {
    fn push(&mut self, item: T) -> Result<(), QueueError>;

    /// Returns the next item to be popped without removing it.
    fn peek(&self) -> Result<&T, QueueError>;

    fn pop(&mut self) -> Result<T, QueueError>;

    /// Closes the queue and releases its backing store.
    fn close(&mut self) -> Result<(), QueueError>;

    fn len(&self) -> Result<usize, QueueError>;

    fn is_closed(&self) -> bool;

    fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }
}

/// Size and closed-flag bookkeeping shared by the implementations.
#[derive(Debug, Default)]
pub(crate) struct QueueState {
    size: usize,
    closed: bool,
}

impl QueueState {
    pub(crate) fn check_open(&self) -> Result<(), QueueError> {
        if self.closed {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn check_readable(&self) -> Result<(), QueueError> {
        self.check_open()?;
        if self.size == 0 {
            Err(QueueError::Empty)
        } else {
            Ok(())
        }
    }

    pub(crate) fn pushed(&mut self) {
        self.size += 1;
    }

    pub(crate) fn popped(&mut self) {
        self.size -= 1;
    }

    pub(crate) fn close(&mut self) -> Result<(), QueueError> {
        self.check_open()?;
        self.closed = true;
        self.size = 0;
        Ok(())
    }

    pub(crate) fn len(&self) -> Result<usize, QueueError> {
        self.check_open()?;
        Ok(self.size)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }
}
