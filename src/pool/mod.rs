//! Buffer pool - reusable scratch memory for argument marshaling
//!
//! Design: Two-level pooling:
//! 1. Thread-local `SimpleBufferPool` (fixed size, unsynchronized, fast path)
//! 2. Global `MultiBufferPool` (power-of-two buckets, one lock per bucket)
//!
//! Requests the thread pool cannot serve fall through to the global pool;
//! buffers it will not keep are handed back the same way.

use std::cell::RefCell;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::config;
use crate::error::Result;
use crate::memory::{MemoryRegion, Pointer};


/// Owned, zeroed native bytes on loan from a pool
pub struct ScratchBuffer {
    region: MemoryRegion,
    address: Pointer,
    capacity: usize,
}

impl ScratchBuffer {
    fn new(capacity: usize) -> Result<Self> {
        let region = MemoryRegion::allocate(capacity)?;
        let address = region.address()?;
        Ok(Self {
            region,
            address,
            capacity,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn pointer(&self) -> Pointer {
        self.address
    }

    #[inline]
    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    fn clear(&self) -> Result<()> {
        self.region.fill(0, self.capacity, 0)
    }
}

impl std::fmt::Debug for ScratchBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ScratchBuffer({:?}, {} bytes)", self.address, self.capacity)
    }
}

/// Fixed-size buffers, bounded count, no synchronization
pub struct SimpleBufferPool {
    buffer_size: usize,
    pool_size: usize,
    list: Vec<ScratchBuffer>,
    parent: Option<Arc<MultiBufferPool>>,
}

impl SimpleBufferPool {
    pub fn new(buffer_size: usize, pool_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            pool_size,
            list: Vec::with_capacity(pool_size),
            parent: None,
        }
    }

    /// Fall back to `parent` for sizes this pool does not serve
    pub fn with_parent(mut self, parent: Arc<MultiBufferPool>) -> Self {
        self.parent = Some(parent);
        self
    }

    /// A zeroed buffer of at least `min` bytes
    pub fn get(&mut self, min: usize) -> Result<ScratchBuffer> {
        if min <= self.buffer_size {
            return match self.list.pop() {
                Some(buffer) => {
                    buffer.clear()?;
                    Ok(buffer)
                }
                None => ScratchBuffer::new(self.buffer_size),
            };
        }
        match &self.parent {
            Some(parent) => parent.get(min),
            None => ScratchBuffer::new(min),
        }
    }

    pub fn put(&mut self, buffer: ScratchBuffer) {
        if buffer.capacity == self.buffer_size && self.list.len() < self.pool_size {
            self.list.push(buffer);
        } else if let Some(parent) = &self.parent {
            parent.put(buffer);
        }
    }

    /// Buffers currently held
    pub fn cached(&self) -> usize {
        self.list.len()
    }
}

/// Power-of-two buckets up to `max_size`, each behind its own lock
pub struct MultiBufferPool {
    max_size: usize,
    items_per_size: usize,
    buckets: Vec<Mutex<Vec<ScratchBuffer>>>,
}

impl MultiBufferPool {
    pub fn new(max_size: usize, items_per_size: usize) -> Self {
        let max_size = max_size.max(1).next_power_of_two();
        let count = max_size.trailing_zeros() as usize + 1;
        Self {
            max_size,
            items_per_size,
            buckets: (0..count).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// Bucket serving requests of `size` bytes
    fn bucket_index(&self, size: usize) -> Option<usize> {
        let rounded = size.max(1).checked_next_power_of_two()?;
        (rounded <= self.max_size).then(|| rounded.trailing_zeros() as usize)
    }

    /// A zeroed buffer of at least `min` bytes
    pub fn get(&self, min: usize) -> Result<ScratchBuffer> {
        let Some(index) = self.bucket_index(min) else {
            return ScratchBuffer::new(min);
        };
        if let Some(buffer) = self.buckets[index].lock().pop() {
            buffer.clear()?;
            return Ok(buffer);
        }
        ScratchBuffer::new(1 << index)
    }

    pub fn put(&self, buffer: ScratchBuffer) {
        let Some(index) = self.bucket_index(buffer.capacity) else {
            return;
        };
        // Oversized buffers from outside the bucket scheme are not kept
        if 1 << index != buffer.capacity {
            return;
        }
        let mut bucket = self.buckets[index].lock();
        if bucket.len() < self.items_per_size {
            bucket.push(buffer);
        }
        debug_assert!(bucket.len() <= self.items_per_size);
    }

    /// Buffers currently held across all buckets
    pub fn cached(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.lock().len()).sum()
    }
}

static GLOBAL_POOL: Lazy<Arc<MultiBufferPool>> = Lazy::new(|| {
    let pool = &config::current().pool;
    Arc::new(MultiBufferPool::new(pool.global_max_size, pool.global_items_per_size))
});

thread_local! {
    static THREAD_POOL: RefCell<SimpleBufferPool> = RefCell::new({
        let pool = &config::current().pool;
        SimpleBufferPool::new(pool.thread_buffer_size, pool.thread_buffer_count)
            .with_parent(GLOBAL_POOL.clone())
    });
}

/// The process-wide bucketed pool
pub fn global() -> &'static Arc<MultiBufferPool> {
    &GLOBAL_POOL
}

/// Run `f` with this thread's pool
pub fn with_thread_pool<R>(f: impl FnOnce(&mut SimpleBufferPool) -> R) -> R {
    THREAD_POOL.with(|pool| f(&mut pool.borrow_mut()))
}

/// A zeroed buffer of at least `min` bytes from this thread's pool
pub fn acquire(min: usize) -> Result<ScratchBuffer> {
    with_thread_pool(|pool| pool.get(min))
}

/// Return a buffer to this thread's pool
///
/// During thread teardown the buffer is simply freed.
pub fn release(buffer: ScratchBuffer) {
    let mut buffer = Some(buffer);
    let _ = THREAD_POOL.try_with(|pool| {
        if let (Some(buffer), Ok(mut pool)) = (buffer.take(), pool.try_borrow_mut()) {
            pool.put(buffer);
        }
    });
}
