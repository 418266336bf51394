//! Reusable read buffers for the pre-dispatch copy paths.
//!
//! Scoped to one server instance and injected through the options, so two
//! servers in one process never share buffers.

use std::sync::{Arc, Mutex, PoisonError};

use bytes::BytesMut;

const DEFAULT_BUFFER_CAPACITY: usize = 4096;
const DEFAULT_MAX_IDLE: usize = 64;

/// Bounded free list of `BytesMut` buffers.
#[derive(Debug, Clone)]
pub struct BufferPool {
    free: Arc<Mutex<Vec<BytesMut>>>,
    buffer_capacity: usize,
    max_idle: usize,
}

impl BufferPool {
    pub fn new(buffer_capacity: usize, max_idle: usize) -> Self {
        Self {
            free: Arc::new(Mutex::new(Vec::with_capacity(max_idle))),
            buffer_capacity,
            max_idle,
        }
    }

    /// Take an empty buffer, allocating when the free list is empty.
    pub fn get(&self) -> BytesMut {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_capacity))
    }

    /// Return a buffer. Dropped when the pool is full.
    pub fn put(&self, mut buf: BytesMut) {
        buf.clear();
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_IDLE)
    }
}
