use std::sync::Mutex;

use bytes::BytesMut;

/// Pre-warmed pool of scratch buffers for response encoding. Buffers are
/// handed out on acquire and returned (with capacity retained) on release;
/// under burst the pool grows past its pre-warm size and shrinks back as
/// buffers are dropped instead of released.
pub struct BufferPool {
    buffers: Mutex<Vec<BytesMut>>,
    buffer_capacity: usize,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(prewarm: usize, buffer_capacity: usize) -> Self {
        let buffers = (0..prewarm)
            .map(|_| BytesMut::with_capacity(buffer_capacity))
            .collect();
        Self {
            buffers: Mutex::new(buffers),
            buffer_capacity,
            max_pooled: prewarm.max(1) * 2,
        }
    }

    pub fn acquire(&self) -> BytesMut {
        let mut buffers = self.buffers.lock().expect("buffer pool poisoned");
        buffers
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_capacity))
    }

    pub fn release(&self, mut buffer: BytesMut) {
        buffer.clear();
        let mut buffers = self.buffers.lock().expect("buffer pool poisoned");
        if buffers.len() < self.max_pooled {
            buffers.push(buffer);
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.buffers.lock().expect("buffer pool poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_reuses_released_buffers() {
        let pool = BufferPool::new(2, 64);
        assert_eq!(pool.pooled(), 2);

        let mut buffer = pool.acquire();
        assert_eq!(pool.pooled(), 1);
        buffer.extend_from_slice(b"scratch");
        pool.release(buffer);
        assert_eq!(pool.pooled(), 2);

        let reused = pool.acquire();
        assert!(reused.is_empty());
        assert!(reused.capacity() >= 7);
    }

    #[test]
    fn pool_growth_is_bounded() {
        let pool = BufferPool::new(1, 16);
        for _ in 0..10 {
            pool.release(BytesMut::with_capacity(16));
        }
        assert!(pool.pooled() <= 2);
    }

    #[test]
    fn empty_pool_still_hands_out_buffers() {
        let pool = BufferPool::new(0, 32);
        let buffer = pool.acquire();
        assert!(buffer.capacity() >= 32);
    }
}
