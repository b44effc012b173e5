//! Pool of fixed-capacity byte buffers.
//!
//! Socket reads lease a buffer, hand the filled bytes to the transport and
//! release the buffer again, so steady-state traffic does not allocate.
//! Only buffers whose capacity still equals the pool's capacity are taken
//! back; a buffer that grew (or was built elsewhere) is simply dropped.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default buffer capacity in bytes.
pub const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// Thread-safe pool of `BytesMut` buffers with a fixed capacity.
#[derive(Debug)]
pub struct BufferPool {
    capacity: usize,
    free: Mutex<Vec<BytesMut>>,
    allocated: AtomicUsize,
}

impl BufferPool {
    /// Creates an empty pool handing out buffers of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Capacity of every pooled buffer.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Takes a cleared buffer from the pool, allocating one if none is free.
    pub fn lease(&self) -> BytesMut {
        if let Some(buf) = self.free.lock().pop() {
            return buf;
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        BytesMut::with_capacity(self.capacity)
    }

    /// Returns a buffer to the pool.
    ///
    /// Returns `false` (and drops the buffer) when its capacity no longer
    /// matches the pool's.
    pub fn release(&self, mut buf: BytesMut) -> bool {
        buf.clear();
        if buf.capacity() != self.capacity {
            return false;
        }
        self.free.lock().push(buf);
        true
    }

    /// Number of buffers this pool has allocated.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Number of buffers currently waiting in the pool.
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Bytes held by buffers waiting in the pool.
    pub fn free_memory(&self) -> usize {
        self.free_count() * self.capacity
    }

    /// Bytes of all buffers this pool has allocated.
    pub fn total_memory(&self) -> usize {
        self.allocated() * self.capacity
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use std::sync::Arc;

    #[test]
    fn test_lease_and_release_reuses_buffer() {
        let pool = BufferPool::default();
        let mut buf = pool.lease();
        assert_eq!(buf.capacity(), DEFAULT_BUFFER_CAPACITY);
        buf.put_slice(b"hello");

        assert!(pool.release(buf));
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.allocated(), 1);

        let again = pool.lease();
        assert!(again.is_empty());
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn test_foreign_capacity_is_dropped() {
        let pool = BufferPool::new(1024);
        assert!(!pool.release(BytesMut::with_capacity(64)));
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_memory_counters() {
        let pool = BufferPool::new(512);
        let a = pool.lease();
        let b = pool.lease();
        assert_eq!(pool.total_memory(), 1024);
        pool.release(a);
        assert_eq!(pool.free_memory(), 512);
        pool.release(b);
        assert_eq!(pool.free_memory(), 1024);
    }

    #[test]
    fn test_shared_across_threads() {
        let pool = Arc::new(BufferPool::new(256));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let buf = pool.lease();
                        pool.release(buf);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(pool.allocated() <= 4);
        assert_eq!(pool.free_count(), pool.allocated());
    }
}
