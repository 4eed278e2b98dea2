use super::{Queue, QueueError, QueueState};

/// Array-backed binary max-heap.
///
/// Positions are 1-indexed so that the children of `i` sit at `2i` and
/// `2i + 1`; position `i` lives at `items[i - 1]`. Equal items keep no
/// particular relative order.
#[derive(Debug)]
pub struct Heap<T> {
    items: Vec<T>,
    state: QueueState,
}

impl<T: Ord> Heap<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            state: QueueState::default(),
        }
    }

    /// `>=` between the items at two 1-indexed positions.
    fn ge(&self, a: usize, b: usize) -> bool {
        self.items[a - 1] >= self.items[b - 1]
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.items.swap(a - 1, b - 1);
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 1 {
            let parent = index / 2;
            if self.ge(parent, index) {
                break;
            }
            self.swap(parent, index);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let last = self.items.len();
        loop {
            let left = index * 2;
            if left > last {
                break;
            }
            let right = left + 1;
            let child = if right <= last && self.ge(right, left) {
                right
            } else {
                left
            };
            if self.ge(index, child) {
                break;
            }
            self.swap(index, child);
            index = child;
        }
    }
}

impl<T: Ord> Default for Heap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord + Send> Queue<T> for Heap<T> {
    fn push(&mut self, item: T) -> Result<(), QueueError> {
        self.state.check_open()?;
        self.state.pushed();
        self.items.push(item);
        let last = self.items.len();
        self.sift_up(last);
        Ok(())
    }

    fn peek(&self) -> Result<&T, QueueError> {
        self.state.check_readable()?;
        self.items.first().ok_or(QueueError::Empty)
    }

    fn pop(&mut self) -> Result<T, QueueError> {
        self.state.check_readable()?;
        let last = self.items.len();
        self.swap(1, last);
        let top = self.items.pop().ok_or(QueueError::Empty)?;
        self.state.popped();
        if self.items.len() > 1 {
            self.sift_down(1);
        }
        Ok(top)
    }

    fn close(&mut self) -> Result<(), QueueError> {
        self.state.close()?;
        self.items = Vec::new();
        Ok(())
    }

    fn len(&self) -> Result<usize, QueueError> {
        self.state.len()
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}
