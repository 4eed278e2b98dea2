use super::{Queue, QueueError, QueueState};
use std::collections::VecDeque;

/// Plain first-in first-out queue.
#[derive(Debug)]
pub struct FifoQueue<T> {
    items: VecDeque<T>,
    state: QueueState,
}

impl<T> FifoQueue<T> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
            state: QueueState::default(),
        }
    }
}

impl<T> Default for FifoQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Queue<T> for FifoQueue<T> {
    fn push(&mut self, item: T) -> Result<(), QueueError> {
        self.state.check_open()?;
        self.state.pushed();
        self.items.push_back(item);
        Ok(())
    }

    fn peek(&self) -> Result<&T, QueueError> {
        self.state.check_readable()?;
        self.items.front().ok_or(QueueError::Empty)
    }

    fn pop(&mut self) -> Result<T, QueueError> {
        self.state.check_readable()?;
        let item = self.items.pop_front().ok_or(QueueError::Empty)?;
        self.state.popped();
        Ok(item)
    }

    fn close(&mut self) -> Result<(), QueueError> {
        self.state.close()?;
        self.items = VecDeque::new();
        Ok(())
    }

    fn len(&self) -> Result<usize, QueueError> {
        self.state.len()
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = FifoQueue::new();
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.len(), Ok(5));
        assert_eq!(queue.peek(), Ok(&0));

        let popped: Vec<i32> = (0..5).map(|_| queue.pop().unwrap()).collect();
        assert_eq!(popped, vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.pop(), Err(QueueError::Empty));
    }
}
