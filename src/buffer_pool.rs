//! Fixed-size pool of stripe data buffers.
//!
//! All buffers are allocated up front. A lock-free free list hands them
//! to stripes when an active stripe is opened, and takes them back once
//! the stripe's flush completes.

use crossbeam_deque::{Injector, Steal};
use std::sync::atomic::{AtomicUsize, Ordering};

/// A pool of equally sized chunk buffers.
pub struct BufferPool {
    free_queue: Injector<Box<[u8]>>,
    available: AtomicUsize,
    capacity: usize,
    chunk_size: usize,
}

impl BufferPool {
    /// Allocate `capacity` zeroed buffers of `chunk_size` bytes each.
    pub fn new(capacity: usize, chunk_size: usize) -> Self {
        let free_queue = Injector::new();
        for _ in 0..capacity {
            free_queue.push(vec![0u8; chunk_size].into_boxed_slice());
        }
        Self {
            free_queue,
            available: AtomicUsize::new(capacity),
            capacity,
            chunk_size,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Buffers currently in the pool.
    #[inline]
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    /// Take one buffer.
    pub fn try_get(&self) -> Option<Box<[u8]>> {
        loop {
            match self.free_queue.steal() {
                Steal::Success(buffer) => {
                    self.available.fetch_sub(1, Ordering::AcqRel);
                    return Some(buffer);
                }
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    /// Take `count` buffers, or none at all.
    pub fn try_get_many(&self, count: usize) -> Option<Vec<Box<[u8]>>> {
        let mut buffers = Vec::with_capacity(count);
        for _ in 0..count {
            match self.try_get() {
                Some(buffer) => buffers.push(buffer),
                None => {
                    self.put_all(buffers);
                    return None;
                }
            }
        }
        Some(buffers)
    }

    /// Return a buffer to the pool.
    pub fn put(&self, buffer: Box<[u8]>) {
        debug_assert_eq!(buffer.len(), self.chunk_size);
        self.free_queue.push(buffer);
        self.available.fetch_add(1, Ordering::AcqRel);
    }

    /// Return several buffers to the pool.
    pub fn put_all(&self, buffers: Vec<Box<[u8]>>) {
        for buffer in buffers {
            self.put(buffer);
        }
    }
}
