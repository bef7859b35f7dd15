//! Append-only list with a fixed capacity and FIFO eviction

use std::collections::VecDeque;

/// Keeps the most recent `capacity` distinct values in insertion order.
///
/// Pushing a value that is already present is a no-op; pushing past capacity
/// evicts the oldest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedList<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: PartialEq> BoundedList<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Rebuild from persisted values, keeping only the newest `capacity`.
    pub fn from_vec(values: Vec<T>, capacity: usize) -> Self {
        let mut list = Self::new(capacity);
        list.extend(values);
        list
    }

    /// Returns true when the value was appended.
    pub fn push(&mut self, value: T) -> bool {
        if self.capacity == 0 || self.items.contains(&value) {
            return false;
        }
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(value);
        true
    }

    pub fn extend<I: IntoIterator<Item = T>>(&mut self, values: I) {
        for value in values {
            self.push(value);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    /// Newest entries first.
    pub fn newest(&self, n: usize) -> impl Iterator<Item = &T> {
        self.items.iter().rev().take(n)
    }

    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.items.iter().cloned().collect()
    }
}
