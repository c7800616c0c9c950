//! Free-list of encode buffers for outbound messages.
//!
//! Every outbound message owns one [`PooledBuffer`]. The buffer goes back to
//! the free-list when the message is dropped, which happens on every exit
//! path of the sender: transmitted, rejected, or failed. Releasing twice is a
//! no-op because the token gives up its buffer on the first release.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::utils::lock;

const INITIAL_BUFFER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub acquired: u64,
    pub released: u64,
    /// Buffers created because the free-list was empty
    pub allocated: u64,
    pub free: usize,
}

impl PoolStats {
    /// Tokens handed out and not yet returned.
    pub fn outstanding(&self) -> u64 {
        self.acquired - self.released
    }
}

#[derive(Debug)]
pub struct MessagePool {
    free: Mutex<Vec<Vec<u8>>>,
    max_free: usize,
    acquired: AtomicU64,
    released: AtomicU64,
    allocated: AtomicU64,
}

impl MessagePool {
    pub fn new(max_free: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            max_free,
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
        })
    }

    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buf = lock(&self.free).pop().unwrap_or_else(|| {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            Vec::with_capacity(INITIAL_BUFFER_CAPACITY)
        });
        self.acquired.fetch_add(1, Ordering::Relaxed);

        PooledBuffer {
            buf: Some(buf),
            pool: Arc::downgrade(self),
        }
    }

    fn give_back(&self, mut buf: Vec<u8>) {
        self.released.fetch_add(1, Ordering::Relaxed);
        buf.clear();
        let mut free = lock(&self.free);
        if free.len() < self.max_free {
            free.push(buf);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            allocated: self.allocated.load(Ordering::Relaxed),
            free: lock(&self.free).len(),
        }
    }
}

/// Ownership token for one pooled buffer.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Weak<MessagePool>,
}

impl PooledBuffer {
    /// `None` once released.
    pub fn get_mut(&mut self) -> Option<&mut Vec<u8>> {
        self.buf.as_mut()
    }

    pub fn bytes(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    pub fn is_released(&self) -> bool {
        self.buf.is_none()
    }

    /// Returns the buffer to its pool. Returns false if it was already
    /// released.
    pub fn release(&mut self) -> bool {
        match self.buf.take() {
            Some(buf) => {
                if let Some(pool) = self.pool.upgrade() {
                    pool.give_back(buf);
                }
                true
            }
            None => false,
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.release();
    }
}
