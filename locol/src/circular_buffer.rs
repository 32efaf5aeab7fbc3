//! Fixed-capacity ring buffer that overwrites its oldest element.
//!
//! Used for high-volume text such as log records where only the most recent
//! `capacity` entries are worth keeping. Memory is allocated once at
//! construction and never grows.

use std::{num::NonZeroUsize, ops::Index};

/// Errors produced by [`CircularBuffer`]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Index is not below the number of stored elements.
    #[error("index {index} out of bounds for buffer holding {len} elements")]
    OutOfBounds {
        /// Requested logical index
        index: usize,
        /// Number of elements stored at the time of the request
        len: usize,
    },
}

#[derive(Debug, Clone)]
/// A ring buffer of `T`, oldest element at logical index 0.
pub struct CircularBuffer<T> {
    slots: Vec<Option<T>>,
    /// Physical slot the next push lands in.
    write_cursor: usize,
    len: usize,
}

impl<T> CircularBuffer<T> {
    /// Create an empty buffer able to hold `capacity` elements.
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        let capacity = capacity.get();
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            write_cursor: 0,
            len: 0,
        }
    }

    /// Maximum number of elements held.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of elements currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `element`, overwriting the oldest element once full.
    pub fn push(&mut self, element: T) {
        let capacity = self.capacity();
        self.slots[self.write_cursor] = Some(element);
        self.write_cursor = (self.write_cursor + 1) % capacity;
        if self.len < capacity {
            self.len += 1;
        }
    }

    #[inline]
    fn physical(&self, index: usize) -> usize {
        let capacity = self.capacity();
        // write_cursor - len + index, kept non-negative by adding capacity.
        (self.write_cursor + capacity - self.len + index) % capacity
    }

    /// Element at logical `index`, 0 being the oldest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if `index >= len()`.
    pub fn get(&self, index: usize) -> Result<&T, Error> {
        if index >= self.len {
            return Err(Error::OutOfBounds {
                index,
                len: self.len,
            });
        }
        self.slots[self.physical(index)]
            .as_ref()
            .ok_or(Error::OutOfBounds {
                index,
                len: self.len,
            })
    }

    /// The most recently pushed element, if any.
    #[must_use]
    pub fn newest(&self) -> Option<&T> {
        self.len.checked_sub(1).and_then(|i| self.get(i).ok())
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            buffer: self,
            front: 0,
            back: self.len,
        }
    }

    /// Scan newest to oldest, returning the first element matching
    /// `predicate`.
    pub fn last_matching<P>(&self, mut predicate: P) -> Option<&T>
    where
        P: FnMut(&T) -> bool,
    {
        self.iter().rev().find(|e| predicate(e))
    }

    /// Drop every element. Capacity is unchanged.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.write_cursor = 0;
        self.len = 0;
    }
}

impl<T> Index<usize> for CircularBuffer<T> {
    type Output = T;

    fn index(&self, index: usize) -> &Self::Output {
        match self.get(index) {
            Ok(e) => e,
            Err(e) => panic!("{e}"),
        }
    }
}

/// Oldest-to-newest iterator over a [`CircularBuffer`].
#[derive(Debug)]
pub struct Iter<'a, T> {
    buffer: &'a CircularBuffer<T>,
    front: usize,
    back: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        let item = self.buffer.get(self.front).ok();
        self.front += 1;
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.back - self.front;
        (remaining, Some(remaining))
    }
}

impl<T> DoubleEndedIterator for Iter<'_, T> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        self.back -= 1;
        self.buffer.get(self.back).ok()
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {}

impl<'a, T> IntoIterator for &'a CircularBuffer<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
