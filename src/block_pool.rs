//! The process-global block free-list and the permanent space.
//!
//! Mirrors the shared-pool-guarded-by-a-mutex pattern used throughout this
//! codebase's ancestor for cross-thread structures (journals, the mature
//! heap): a `parking_lot::Mutex` over a free-list, growing by a configurable
//! chunk size to amortise the cost of acquiring new blocks one at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::{Block, Bucket};
use crate::value::{Object, ObjectData, Reference};

/// Default number of blocks to grow the free-list by when it is exhausted.
pub const DEFAULT_CHUNK_BLOCKS: usize = 16;

struct Inner {
    free: Vec<Block>,
    chunk_blocks: usize,
    total_blocks: u64,
}

/// The process-global pool of reusable 32 KB blocks.
pub struct BlockPool {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl BlockPool {
    #[must_use]
    pub fn new(chunk_blocks: usize) -> Arc<Self> {
        Arc::new(BlockPool {
            inner: Mutex::new(Inner {
                free: Vec::new(),
                chunk_blocks: chunk_blocks.max(1),
                total_blocks: 0,
            }),
            next_id: AtomicU64::new(1),
        })
    }

    /// Total blocks ever created (free + in use); used to verify pool size
    /// returns to its initial value once all processes terminate (S1).
    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.inner.lock().total_blocks
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Pops a block from the free-list, growing by one chunk if empty.
    pub fn acquire_block(&self, bucket: Bucket) -> Block {
        let mut inner = self.inner.lock();
        if inner.free.is_empty() {
            let chunk = inner.chunk_blocks;
            for _ in 0..chunk {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                inner.free.push(Block::new(id, bucket));
            }
            inner.total_blocks += chunk as u64;
        }
        let mut block = inner.free.pop().expect("chunk growth just populated the free-list");
        block.reset_for_reuse(bucket);
        block
    }

    /// Pushes a fully-reclaimed block back onto the free-list.
    pub fn release_block(&self, block: Block) {
        self.inner.lock().free.push(block);
    }
}

/// A VM-wide append-only arena for objects that outlive any single process.
/// Permanent allocations are never released; growth failure is the only way
/// `permanent_allocate` can fail, surfaced as an allocation error.
pub struct PermanentSpace {
    // Boxed so each object's address is stable even as the Vec grows.
    #[allow(clippy::vec_box)]
    objects: Mutex<Vec<Box<Object>>>,
    bytes_used: AtomicU64,
    limit_bytes: u64,
}

impl PermanentSpace {
    #[must_use]
    pub fn new(limit_bytes: u64) -> Arc<Self> {
        Arc::new(PermanentSpace {
            objects: Mutex::new(Vec::new()),
            bytes_used: AtomicU64::new(0),
            limit_bytes,
        })
    }

    /// Bump-allocates a permanent object. Fails with `None` (translated by
    /// the caller into an out-of-memory error) if the configured permanent
    /// space limit would be exceeded.
    pub fn allocate(&self, class: Reference, data: ObjectData) -> Option<Reference> {
        let size = data.heap_size() as u64;
        let previous = self.bytes_used.fetch_add(size, Ordering::AcqRel);
        if previous + size > self.limit_bytes {
            self.bytes_used.fetch_sub(size, Ordering::AcqRel);
            return None;
        }

        let object = Object::new(class, data, false, true);
        let ptr = Box::into_raw(Box::new(object));
        let reference = Reference::from_object_ptr(ptr);
        // SAFETY: ptr was just produced by Box::into_raw above; reclaiming it
        // into a Box here hands ownership to the arena, which outlives every
        // reference handed out to it.
        let owned = unsafe { Box::from_raw(ptr) };
        self.objects.lock().push(owned);
        Some(reference)
    }

    #[must_use]
    pub fn bytes_used(&self) -> u64 {
        self.bytes_used.load(Ordering::Relaxed)
    }
}
