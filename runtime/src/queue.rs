//! Coroutine queue, a growable circular FIFO of pending coroutines
//!
//! One queue lives in every [`crate::context::ThreadContext`] and is only ever
//! touched by the worker that owns it.
//!
//! `start == end` always means empty. Fullness is detected by checking the
//! slot after `end` before writing, so one slot stays unused at all times.

/// Smallest capacity the queue grows to.
const MIN_CAPACITY: usize = 10;

/// Growth factor when the queue is full (2x)
const GROWTH_FACTOR: usize = 2;

pub struct CoroutineQueue<T> {
    slots: Vec<Option<T>>,
    // Indexes into `slots`, modulo capacity.
    start: usize,
    end: usize,
}

impl<T> Default for CoroutineQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CoroutineQueue<T> {
    /// Create an empty queue. Nothing is allocated until the first push.
    pub fn new() -> Self {
        CoroutineQueue {
            slots: Vec::new(),
            start: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        if self.end >= self.start {
            self.end - self.start
        } else {
            self.capacity() - self.start + self.end
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Append `routine` at the tail.
    pub fn push(&mut self, routine: T) {
        let mut next = self.end + 1;
        if next >= self.capacity() {
            next = 0;
        }
        if next == self.start {
            self.grow();
            next = (self.end + 1) % self.capacity();
        }
        self.slots[self.end] = Some(routine);
        self.end = next;
    }

    /// Remove and return the oldest element.
    pub fn pop(&mut self) -> Option<T> {
        if self.start == self.end {
            return None;
        }
        let routine = self.slots[self.start].take();
        self.start = (self.start + 1) % self.capacity();
        debug_assert!(routine.is_some(), "occupied slot was empty");
        routine
    }

    /// Drop every pending element. Capacity is kept.
    pub fn clear(&mut self) {
        while self.pop().is_some() {}
        self.start = 0;
        self.end = 0;
    }

    fn grow(&mut self) {
        let old_cap = self.capacity();
        let new_cap = (old_cap * GROWTH_FACTOR).max(MIN_CAPACITY);
        self.slots.resize_with(new_cap, || None);

        // Move elements wrapped around the old capacity into the new space.
        if self.end < self.start {
            let wrapped = self.end;
            // Doubling leaves at least `old_cap` new slots.
            debug_assert!(wrapped <= new_cap - old_cap);
            for i in 0..wrapped {
                self.slots[old_cap + i] = self.slots[i].take();
            }
            self.end += old_cap;
        }
        log::trace!("coroutine queue grown {} -> {}", old_cap, new_cap);
    }
}
