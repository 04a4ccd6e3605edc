//! Queue-with-sizes used by stream controllers
//!
//! Invariant: `total_size` equals the sum of the sizes of the stored entries.

use std::collections::VecDeque;

#[derive(Debug)]
pub(crate) struct SizedQueue<T> {
    entries: VecDeque<(T, f64)>,
    total_size: f64,
}

impl<T> SizedQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(8),
            total_size: 0.0,
        }
    }

    pub(crate) fn enqueue(&mut self, value: T, size: f64) {
        self.entries.push_back((value, size));
        self.total_size += size;
    }

    pub(crate) fn dequeue(&mut self) -> Option<(T, f64)> {
        let (value, size) = self.entries.pop_front()?;
        // Floating point drift must never push the total below zero
        self.total_size = if self.entries.is_empty() {
            0.0
        } else {
            (self.total_size - size).max(0.0)
        };
        Some((value, size))
    }

    pub(crate) fn reset(&mut self) {
        self.entries.clear();
        self.total_size = 0.0;
    }

    pub(crate) fn total_size(&self) -> f64 {
        self.total_size
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
