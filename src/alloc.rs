//! Buffer allocation for the read and write paths
//!
//! The framing core never reaches for a process-wide pool. Decoder,
//! assembler, encoder and I/O source are handed an
//! `Arc<dyn BufferAllocator>` and give every buffer they stop using back
//! to it exactly once.

use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::RECV_BUFFER_SIZE;

/// Source and sink of byte buffers
pub trait BufferAllocator: Send + Sync {
    /// Get an empty buffer with at least `capacity` bytes of room
    fn allocate(&self, capacity: usize) -> BytesMut;

    /// Return a buffer the caller no longer uses
    fn release(&self, buffer: BytesMut);
}

/// Allocator that always allocates and drops released buffers
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    #[inline]
    fn allocate(&self, capacity: usize) -> BytesMut {
        BytesMut::with_capacity(capacity)
    }

    #[inline]
    fn release(&self, _buffer: BytesMut) {}
}

/// Buffer pool for reusing I/O buffers
///
/// Maintains a free list of buffers of at least `buffer_size` bytes.
/// A released slice split off a larger buffer gets the whole allocation
/// back when it is the last owner; otherwise small buffers are dropped.
/// Requests under half of `buffer_size` never take a pooled buffer.
pub struct BufferPool {
    /// Free list of buffers
    free_list: Mutex<Vec<BytesMut>>,
    /// Minimum capacity of pooled buffers
    buffer_size: usize,
    /// Maximum number of cached buffers
    max_cached: usize,
}

impl BufferPool {
    /// Create a new buffer pool
    pub fn new(buffer_size: usize, max_cached: usize) -> Self {
        Self {
            free_list: Mutex::new(Vec::with_capacity(max_cached)),
            buffer_size,
            max_cached,
        }
    }

    /// Create a shared pool handle
    pub fn shared(buffer_size: usize, max_cached: usize) -> Arc<dyn BufferAllocator> {
        Arc::new(Self::new(buffer_size, max_cached))
    }

    /// Get number of cached buffers
    #[inline]
    pub fn cached(&self) -> usize {
        self.free_list.lock().len()
    }
}

impl BufferAllocator for BufferPool {
    fn allocate(&self, capacity: usize) -> BytesMut {
        if capacity < self.buffer_size / 2 {
            return BytesMut::with_capacity(capacity);
        }
        if capacity <= self.buffer_size {
            if let Some(buf) = self.free_list.lock().pop() {
                return buf;
            }
        }
        BytesMut::with_capacity(capacity.max(self.buffer_size))
    }

    fn release(&self, mut buffer: BytesMut) {
        buffer.clear();
        if buffer.capacity() < self.buffer_size && !buffer.try_reclaim(self.buffer_size) {
            return;
        }
        let mut free = self.free_list.lock();
        if free.len() < self.max_cached {
            free.push(buffer);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(RECV_BUFFER_SIZE, 64)
    }
}

/// Default allocator used when none is supplied
pub fn default_allocator() -> Arc<dyn BufferAllocator> {
    Arc::new(HeapAllocator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool() {
        let pool = BufferPool::new(1024, 4);

        let buf1 = pool.allocate(512);
        assert!(buf1.capacity() >= 1024);

        pool.release(buf1);
        assert_eq!(pool.cached(), 1);

        let buf2 = pool.allocate(1024);
        assert_eq!(pool.cached(), 0);
        assert!(buf2.is_empty());
    }

    #[test]
    fn test_small_buffers_not_cached() {
        let pool = BufferPool::new(1024, 4);
        pool.release(BytesMut::with_capacity(16));
        assert_eq!(pool.cached(), 0);
    }

    #[test]
    fn test_small_requests_bypass_pool() {
        let pool = BufferPool::new(4096, 4);
        pool.release(BytesMut::with_capacity(4096));

        let header = pool.allocate(14);
        assert!(header.capacity() < 4096);
        assert_eq!(pool.cached(), 1);
    }

    #[test]
    fn test_last_slice_reclaims_allocation() {
        let pool = BufferPool::new(4096, 4);
        let mut buf = pool.allocate(4096);
        buf.extend_from_slice(&[7u8; 64]);
        let head = buf.split_to(8);

        pool.release(head);
        assert_eq!(pool.cached(), 0);
        pool.release(buf);
        assert_eq!(pool.cached(), 1);
        assert!(pool.allocate(4096).capacity() >= 4096);
    }

    #[test]
    fn test_pool_limit() {
        let pool = BufferPool::new(64, 2);
        for _ in 0..5 {
            pool.release(BytesMut::with_capacity(64));
        }
        assert_eq!(pool.cached(), 2);
    }

    #[test]
    fn test_released_buffer_is_cleared() {
        let pool = BufferPool::new(8, 1);
        let mut buf = pool.allocate(8);
        buf.extend_from_slice(b"leftover");
        pool.release(buf);
        assert!(pool.allocate(8).is_empty());
    }
}
