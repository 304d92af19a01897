//! Request buffer pool.
//!
//! Every frame read from the kernel driver lands in a buffer big enough for the largest request
//! the kernel may send. Allocating one of those per request is wasteful, so buffers are recycled
//! through a pool. The pool never blocks: if no idle buffer is available a new one is allocated.

use crossbeam::queue::SegQueue;
use std::fmt;
use std::mem;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;


/// Unbounded pool of fixed-capacity byte buffers.
pub struct BufferPool {
    capacity: usize,
    idle: SegQueue<Vec<u8>>,
    allocated: AtomicUsize,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity)
            .field("idle", &self.idle.len())
            .field("allocated", &self.allocated())
            .finish()
    }
}

impl BufferPool {
    /// Create an empty pool handing out buffers of `capacity` bytes.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self { capacity, idle: SegQueue::new(), allocated: AtomicUsize::new(0) })
    }

    /// Fixed capacity of every buffer of this pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffers currently parked in the pool.
    pub fn idle(&self) -> usize {
        self.idle.len()
    }

    /// Number of buffers allocated over the pool's lifetime.
    ///
    /// Once every buffer has been returned this equals `idle()`.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Take a buffer out of the pool, allocating a new one if none is idle.
    ///
    /// The buffer spans the full capacity and goes back to the pool when dropped.
    pub fn acquire(self: &Arc<Self>) -> Buffer {
        let data = self.idle.pop().unwrap_or_else(|| {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            vec![0; self.capacity]
        });
        Buffer { data, len: self.capacity, pool: Arc::clone(self) }
    }

    fn release(&self, data: Vec<u8>) {
        // Contents are left as they are, only the length matters
        debug_assert_eq!(data.len(), self.capacity);
        self.idle.push(data);
    }
}


/// A buffer checked out of a `BufferPool`.
///
/// Dereferences to the first `len()` bytes, which is the full capacity until `truncate` is
/// called. Dropping the buffer returns it to its pool, whatever its logical length.
pub struct Buffer {
    data: Vec<u8>,
    len: usize,
    pool: Arc<BufferPool>,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}

impl Buffer {
    /// Total capacity, independent of the logical length.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The whole underlying storage, for filling it from a read.
    pub fn as_mut_capacity(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// Shorten the logical length to the bytes actually filled in.
    pub fn truncate(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let data = mem::take(&mut self.data);
        self.pool.release(data);
    }
}
