use std::collections::VecDeque;

/// A bounded in-memory FIFO.
///
/// `push` respects the capacity and hands the item back when full so the
/// caller can spill it elsewhere. `push_front` is for items returning to the
/// head of the queue (requeues, expired deliveries) and ignores the bound:
/// those items were already admitted once.
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) -> std::result::Result<(), T> {
        if self.items.len() >= self.capacity {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    pub fn push_front(&mut self, item: T) {
        self.items.push_front(item);
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

    /// Fraction of the capacity in use (0.0 - 1.0, may exceed 1.0 after
    /// `push_front`).
    pub fn usage(&self) -> f32 {
        if self.capacity == 0 {
            return if self.items.is_empty() { 0.0 } else { 1.0 };
        }
        self.items.len() as f32 / self.capacity as f32
    }

    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.items.drain(..)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
