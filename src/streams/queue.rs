use super::{StreamResult, error::StreamError};
use std::collections::VecDeque;

/// FIFO of values tagged with the size their strategy assigned them.
#[derive(Debug)]
pub struct QueueWithSizes<V> {
    entries: VecDeque<(V, f64)>,
}

impl<V> Default for QueueWithSizes<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> QueueWithSizes<V> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Append `value`. Fails without touching the queue if `size` is NaN or infinite.
    pub fn enqueue(&mut self, value: V, size: f64) -> StreamResult<()> {
        if !size.is_finite() {
            return Err(StreamError::InvalidSize(size));
        }
        self.entries.push_back((value, size));
        Ok(())
    }

    /// Remove the head. Callers check for emptiness first; `None` here is a bug.
    pub fn dequeue(&mut self) -> Option<V> {
        debug_assert!(!self.entries.is_empty(), "dequeue from an empty queue");
        self.entries.pop_front().map(|(value, _)| value)
    }

    pub fn peek(&self) -> Option<&V> {
        debug_assert!(!self.entries.is_empty(), "peek at an empty queue");
        self.entries.front().map(|(value, _)| value)
    }

    pub fn peek_mut(&mut self) -> Option<&mut V> {
        self.entries.front_mut().map(|(value, _)| value)
    }

    pub fn total_size(&self) -> f64 {
        self.entries
            .iter()
            .map(|(_, size)| {
                debug_assert!(size.is_finite(), "invalid size stored in queue");
                *size
            })
            .sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Remove every entry, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = V> + '_ {
        self.entries.drain(..).map(|(value, _)| value)
    }
}
