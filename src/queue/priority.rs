use super::{FifoQueue, Heap, Queue, QueueError, QueueState};
use std::collections::HashMap;

/// Builds the sub-queue used for a given priority.
pub type SubQueueFactory<T> = Box<dyn FnMut(i32) -> Box<dyn Queue<T>> + Send>;

/// Priority queue composed from a heap of priorities and one sub-queue per priority.
///
/// Heap work is proportional to the number of distinct priorities, not the
/// number of items. Drained sub-queues are kept in an inactive pool and reused
/// the next time their priority is pushed.
pub struct PriorityQueue<T> {
    factory: SubQueueFactory<T>,
    priorities: Heap<i32>,
    active: HashMap<i32, Box<dyn Queue<T>>>,
    inactive: HashMap<i32, Box<dyn Queue<T>>>,
    state: QueueState,
}

impl<T: Send + 'static> PriorityQueue<T> {
    pub fn new(factory: SubQueueFactory<T>) -> Self {
        Self {
            factory,
            priorities: Heap::new(),
            active: HashMap::new(),
            inactive: HashMap::new(),
            state: QueueState::default(),
        }
    }

    /// Priority queue whose sub-queues are plain FIFOs.
    pub fn fifo() -> Self {
        Self::new(Box::new(|_| Box::new(FifoQueue::new())))
    }

    pub fn push(&mut self, priority: i32, value: T) -> Result<(), QueueError> {
        self.state.check_open()?;
        if !self.active.contains_key(&priority) {
            self.priorities.push(priority)?;
            let queue = match self.inactive.remove(&priority) {
                Some(queue) => queue,
                None => (self.factory)(priority),
            };
            self.active.insert(priority, queue);
        }
        if let Some(queue) = self.active.get_mut(&priority) {
            queue.push(value)?;
        }
        self.state.pushed();
        Ok(())
    }

    pub fn peek(&self) -> Result<&T, QueueError> {
        self.state.check_readable()?;
        let priority = self.priorities.peek()?;
        self.active.get(priority).ok_or(QueueError::Empty)?.peek()
    }

    /// Priority of the item that `pop` would return.
    pub fn peek_priority(&self) -> Result<i32, QueueError> {
        self.state.check_readable()?;
        self.priorities.peek().copied()
    }

    pub fn pop(&mut self) -> Result<T, QueueError> {
        self.state.check_readable()?;
        let priority = *self.priorities.peek()?;
        let queue = self.active.get_mut(&priority).ok_or(QueueError::Empty)?;
        let value = queue.pop()?;
        if queue.is_empty()? {
            if let Some(drained) = self.active.remove(&priority) {
                self.inactive.insert(priority, drained);
            }
            self.priorities.pop()?;
        }
        self.state.popped();
        Ok(value)
    }

    pub fn close(&mut self) -> Result<(), QueueError> {
        self.state.close()?;
        for (_, mut queue) in self.active.drain().chain(self.inactive.drain()) {
            if !queue.is_closed() {
                queue.close()?;
            }
        }
        self.priorities = Heap::new();
        Ok(())
    }

    pub fn len(&self) -> Result<usize, QueueError> {
        self.state.len()
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Number of priorities that currently hold items.
    pub fn active_priorities(&self) -> usize {
        self.active.len()
    }
}
