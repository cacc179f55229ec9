//! FIFO holding area for sub-messages that cannot be written yet.
//!
//! Used for requests waiting on a service redirect and for data held by a
//! server pause. Entries leave in exactly the order they arrived.

use std::collections::VecDeque;

#[derive(Debug)]
pub struct DelayedQueue<T> {
    items: VecDeque<T>,
}

impl<T> DelayedQueue<T> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Remove every entry, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.items.drain(..)
    }
}

impl<T> Default for DelayedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
