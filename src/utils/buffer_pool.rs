//! # Buffer Pool
//!
//! Per-thread cache of reusable byte buffers, keyed by minimum capacity, to
//! avoid a fresh allocation for every bundle.
//!
//! All I/O for one connection happens on exactly one worker thread, so the
//! pool is `thread_local!` and needs no synchronization at all. A
//! [`PooledBuffer`] derefs to `Vec<u8>` and returns itself to the owning
//! thread's free list when dropped.
//!
//! ## Usage
//! ```rust
//! use bundle_transport::utils::buffer_pool;
//!
//! let mut buffer = buffer_pool::with_capacity(4096);
//! buffer.extend_from_slice(b"payload");
//! // Returned to this thread's pool on drop.
//! ```

use std::cell::RefCell;

/// Buffers larger than this go back to the allocator instead of the pool.
const MAX_POOLED_CAPACITY: usize = 1024 * 1024;

/// Bound on the free list; eviction is simply refusing returns beyond this.
const MAX_POOLED_BUFFERS: usize = 32;

thread_local! {
    static POOL: RefCell<Vec<Vec<u8>>> = const { RefCell::new(Vec::new()) };
}

/// A pooled buffer that returns itself to the current thread's pool on drop.
pub struct PooledBuffer {
    buffer: Vec<u8>,
}

impl PooledBuffer {
    /// Take the underlying buffer out, bypassing the pool.
    pub fn into_inner(mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let capacity = self.buffer.capacity();
        if capacity == 0 || capacity > MAX_POOLED_CAPACITY {
            return;
        }
        self.buffer.clear();
        POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            if pool.len() < MAX_POOLED_BUFFERS {
                pool.push(std::mem::take(&mut self.buffer));
            }
        });
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

/// Acquire a cleared buffer with at least `min_capacity` bytes of capacity,
/// reusing one from this thread's pool when a large enough buffer is free.
pub fn with_capacity(min_capacity: usize) -> PooledBuffer {
    let buffer = POOL.with(|pool| {
        let mut pool = pool.borrow_mut();
        let slot = pool
            .iter()
            .position(|buf| buf.capacity() >= min_capacity)
            .map(|idx| pool.swap_remove(idx));
        slot.unwrap_or_else(|| Vec::with_capacity(min_capacity))
    });
    PooledBuffer { buffer }
}

/// Number of buffers currently parked on this thread's free list.
pub fn available() -> usize {
    POOL.with(|pool| pool.borrow().len())
}
