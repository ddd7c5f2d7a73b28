use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Relay buffer size
pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;

const MAX_POOL_SIZE: usize = 256;

/// Pool of fixed-size relay buffers backed by an async-aware mutex.
///
/// One pool is created at startup and handed to every listener; it holds no
/// connection data between uses because returned buffers are zeroed.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_pooled: usize,
    handed_out: AtomicUsize,
    returned: AtomicUsize,
}

impl BufferPool {
    /// Create a pool of `RELAY_BUFFER_SIZE` buffers
    pub fn new() -> Self {
        Self::with_limits(RELAY_BUFFER_SIZE, MAX_POOL_SIZE)
    }

    /// Create a pool with a custom buffer size and retention cap
    pub fn with_limits(buffer_size: usize, max_pooled: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_pooled.min(MAX_POOL_SIZE))),
            buffer_size,
            max_pooled,
            handed_out: AtomicUsize::new(0),
            returned: AtomicUsize::new(0),
        }
    }

    /// Get a buffer from the pool or allocate a new one
    pub async fn acquire(&self) -> Vec<u8> {
        self.handed_out.fetch_add(1, Ordering::Relaxed);

        let reused = self.buffers.lock().await.pop();
        match reused {
            Some(buffer) => {
                debug_assert_eq!(buffer.len(), self.buffer_size);
                buffer
            }
            None => vec![0u8; self.buffer_size],
        }
    }

    /// Return a buffer to the pool for reuse
    pub async fn release(&self, mut buffer: Vec<u8>) {
        self.returned.fetch_add(1, Ordering::Relaxed);

        // Reject buffers with the wrong capacity to avoid memory bloat
        if buffer.capacity() < self.buffer_size || buffer.capacity() > self.buffer_size * 2 {
            return;
        }

        // No bytes from one relay may be visible to the next
        buffer.clear();
        buffer.resize(self.buffer_size, 0);

        let mut pool = self.buffers.lock().await;
        if pool.len() < self.max_pooled {
            pool.push(buffer);
        }
    }

    /// Snapshot of pool counters
    pub async fn stats(&self) -> BufferPoolStats {
        let available = self.buffers.lock().await.len();
        let handed_out = self.handed_out.load(Ordering::Relaxed);
        let returned = self.returned.load(Ordering::Relaxed);

        BufferPoolStats {
            available,
            handed_out,
            returned,
            total_memory_pooled: available * self.buffer_size,
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool counters; `handed_out - returned` buffers are held by relays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub available: usize,
    pub handed_out: usize,
    pub returned: usize,
    pub total_memory_pooled: usize,
}

impl BufferPoolStats {
    /// Buffers currently held by relay loops
    pub fn in_use(&self) -> usize {
        self.handed_out.saturating_sub(self.returned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buffer_pool_basic_operations() {
        let pool = BufferPool::new();

        let buf = pool.acquire().await;
        assert_eq!(buf.len(), RELAY_BUFFER_SIZE);
        assert_eq!(pool.stats().await.in_use(), 1);

        pool.release(buf).await;

        let stats = pool.stats().await;
        assert_eq!(stats.available, 1);
        assert_eq!(stats.in_use(), 0);
        assert_eq!(stats.total_memory_pooled, RELAY_BUFFER_SIZE);

        // Second acquire reuses the pooled buffer
        let reused = pool.acquire().await;
        assert_eq!(reused.len(), RELAY_BUFFER_SIZE);
        assert_eq!(pool.stats().await.available, 0);
    }

    #[tokio::test]
    async fn test_buffer_pool_size_limit() {
        let pool = BufferPool::with_limits(1024, 4);

        let mut held = Vec::new();
        for _ in 0..10 {
            held.push(pool.acquire().await);
        }
        for buf in held {
            pool.release(buf).await;
        }

        let stats = pool.stats().await;
        assert_eq!(stats.available, 4);
        assert_eq!(stats.handed_out, 10);
        assert_eq!(stats.returned, 10);
    }

    #[tokio::test]
    async fn test_buffer_pool_wrong_size_rejection() {
        let pool = BufferPool::with_limits(8_192, 8);

        pool.release(vec![0u8; 4_096]).await;

        assert_eq!(pool.stats().await.available, 0);
    }

    #[tokio::test]
    async fn test_reused_buffer_length_and_zeroing() {
        let pool = BufferPool::with_limits(4_096, 8);

        let mut buf = pool.acquire().await;
        let capacity = buf.capacity();

        // A relay loop leaves data behind and may shrink the length
        buf.fill(0xAA);
        buf.truncate(128);

        pool.release(buf).await;

        let reused = pool.acquire().await;
        assert_eq!(reused.len(), 4_096);
        assert_eq!(reused.capacity(), capacity);
        assert!(reused.iter().all(|&b| b == 0));
    }
}
