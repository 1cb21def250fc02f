//! Fixed-capacity FIFO buffer used for service and combined logs

use std::collections::VecDeque;

/// Per-service log capacity.
pub const SERVICE_LOG_CAPACITY: usize = 1000;

/// Capacity of the process-wide combined log.
pub const COMBINED_LOG_CAPACITY: usize = 2000;

/// A fixed-capacity circular buffer that evicts the oldest entry
/// when full.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    buf: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create a new ring buffer with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a value, evicting the oldest if at capacity.
    pub fn push(&mut self, value: T) {
        if self.capacity == 0 {
            return;
        }
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(value);
    }

    /// Number of items currently stored.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Maximum capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate over items from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buf.iter()
    }

    /// Get the most recently pushed item.
    pub fn latest(&self) -> Option<&T> {
        self.buf.back()
    }

    /// Get the oldest item.
    pub fn oldest(&self) -> Option<&T> {
        self.buf.front()
    }

    /// Clear all items.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Copy the contents out, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.buf.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_basic() {
        let mut buf = RingBuffer::new(3);
        buf.push(1);
        buf.push(2);
        buf.push(3);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.latest(), Some(&3));
        assert_eq!(buf.oldest(), Some(&1));
    }

    #[test]
    fn test_ring_buffer_overflow() {
        let mut buf = RingBuffer::new(3);
        buf.push(1);
        buf.push(2);
        buf.push(3);
        buf.push(4);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.oldest(), Some(&2)); // 1 was evicted
        assert_eq!(buf.latest(), Some(&4));
        assert_eq!(buf.to_vec(), vec![2, 3, 4]);
    }

    #[test]
    fn test_ring_buffer_keeps_last_capacity_entries_in_order() {
        let mut buf = RingBuffer::new(SERVICE_LOG_CAPACITY);
        let total = SERVICE_LOG_CAPACITY + 250;
        for i in 0..total {
            buf.push(i);
        }

        assert_eq!(buf.len(), SERVICE_LOG_CAPACITY);
        let expected: Vec<usize> = (total - SERVICE_LOG_CAPACITY..total).collect();
        assert_eq!(buf.to_vec(), expected);
    }

    #[test]
    fn test_ring_buffer_empty() {
        let buf: RingBuffer<i32> = RingBuffer::new(5);
        assert!(buf.is_empty());
        assert_eq!(buf.latest(), None);
    }

    #[test]
    fn test_ring_buffer_zero_capacity_stays_empty() {
        let mut buf = RingBuffer::new(0);
        buf.push("dropped");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_ring_buffer_clear() {
        let mut buf = RingBuffer::new(3);
        buf.push(1);
        buf.push(2);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 3);
    }
}
