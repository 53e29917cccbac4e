//! Object and buffer pools.
//!
//! Amortizes per-packet allocation. `put` is optional: a value that is
//! dropped instead of returned is simply reallocated later, so the pool is
//! leak-safe. Pools hold at most `cap` recycled instances; the rest drop.

use bytes::BytesMut;
use parking_lot::Mutex;

/// Implemented by types that can be recycled through a [`Pool`].
pub trait Poolable: Default + Send + 'static {
    /// Restores default field values without releasing the allocation.
    fn reset_for_pool(&mut self);
}

/// Free-list pool of packet objects.
pub struct Pool<T: Poolable> {
    slots: Mutex<Vec<T>>,
    cap: usize,
}

impl<T: Poolable> Pool<T> {
    pub fn new(cap: usize) -> Self {
        Pool {
            slots: Mutex::new(Vec::with_capacity(cap.min(64))),
            cap,
        }
    }

    /// Returns a recycled instance, or a default-constructed one.
    pub fn get(&self) -> T {
        self.slots.lock().pop().unwrap_or_default()
    }

    /// Resets `value` and makes it available again.
    ///
    /// Callers must not retain references into `value` after returning it.
    pub fn put(&self, mut value: T) {
        value.reset_for_pool();
        let mut slots = self.slots.lock();
        if slots.len() < self.cap {
            slots.push(value);
        }
    }

    pub fn idle(&self) -> usize {
        self.slots.lock().len()
    }
}

/// Pool of scratch `BytesMut` buffers for serialization and receive loops.
pub struct BufferPool {
    slots: Mutex<Vec<BytesMut>>,
    buf_capacity: usize,
    cap: usize,
}

impl BufferPool {
    /// `buf_capacity` should come from the expected average payload size of
    /// the dynamic-size packet fields in play.
    pub fn new(buf_capacity: usize, cap: usize) -> Self {
        BufferPool {
            slots: Mutex::new(Vec::new()),
            buf_capacity,
            cap,
        }
    }

    pub fn get(&self) -> BytesMut {
        self.slots
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buf_capacity))
    }

    pub fn put(&self, mut buf: BytesMut) {
        buf.clear();
        // Shrunken buffers (split off by framing) are not worth keeping.
        if buf.capacity() < self.buf_capacity {
            return;
        }
        let mut slots = self.slots.lock();
        if slots.len() < self.cap {
            slots.push(buf);
        }
    }
}
