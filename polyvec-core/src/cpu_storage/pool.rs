use std::mem;
use std::{cell::RefCell, rc::Rc};

use crate::DType;

/// Max size of all pooled chunk buffers of one worker thread, in bytes.
const MAX_BUFFERS_SIZE: usize = 64 * 1024 * 1024;
/// When total pooled bytes exceed this, trim largest buffers down to this level.
const TRIM_THRESHOLD: usize = MAX_BUFFERS_SIZE / 2;

/// Usage statistics of one pool, logged when the pool is dropped.
#[derive(Debug, Clone, Default)]
pub struct PoolMetrics {
    /// Current total capacity of all pooled buffers, in bytes.
    pub current_size: usize,
    /// Number of times a buffer was reused instead of allocated.
    pub hits: usize,
    /// Number of times a new buffer was allocated.
    pub misses: usize,
    /// Number of times a buffer was dropped due to pool size cap.
    pub drops: usize,
}

#[derive(Debug)]
/// Reuses the chunk buffers of the host evaluator across chunks on one worker thread.
pub struct BufferPool<T> {
    pool: Vec<Vec<T>>,
    /// Usage statistics for this pool.
    pub metrics: PoolMetrics,
}

/// Shared reference to a BufferPool for automatic recycling.
pub type SharedPool<T> = Rc<RefCell<BufferPool<T>>>;

#[derive(Debug)]
/// Wrapper around Vec<T> that returns its buffer to the pool on drop.
pub struct PooledBuffer<T: DType> {
    buf: Vec<T>,
    pool: Option<SharedPool<T>>,
}

impl<T: DType> PooledBuffer<T> {
    /// Wrap an existing Vec and attach it to the pool.
    pub fn new(buf: Vec<T>, pool: SharedPool<T>) -> Self {
        PooledBuffer {
            buf,
            pool: Some(pool),
        }
    }

    /// An empty buffer from `pool` with room for `capacity` elements.
    pub fn with_capacity(pool: &SharedPool<T>, capacity: usize) -> Self {
        let buf = pool.borrow_mut().get_empty_buffer(capacity);
        Self::new(buf, pool.clone())
    }
}

impl<T: DType> std::ops::Deref for PooledBuffer<T> {
    type Target = Vec<T>;
    fn deref(&self) -> &Vec<T> {
        &self.buf
    }
}

impl<T: DType> std::ops::DerefMut for PooledBuffer<T> {
    fn deref_mut(&mut self) -> &mut Vec<T> {
        &mut self.buf
    }
}

impl<T: DType> Drop for PooledBuffer<T> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let buf = std::mem::take(&mut self.buf);
            pool.borrow_mut().recycle_buffer(buf);
        }
    }
}

impl<T: DType> Default for BufferPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DType> BufferPool<T> {
    pub fn new() -> Self {
        BufferPool {
            pool: Vec::new(),
            metrics: PoolMetrics::default(),
        }
    }

    pub fn shared() -> SharedPool<T> {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Grab an empty Vec with at least `capacity`, reusing the smallest pooled one that fits.
    pub fn get_empty_buffer(&mut self, capacity: usize) -> Vec<T> {
        let smallest_fit = self
            .pool
            .iter()
            .enumerate()
            .filter(|(_, buf)| buf.capacity() >= capacity)
            .min_by_key(|(_, buf)| buf.capacity())
            .map(|(i, _)| i);

        if let Some(idx) = smallest_fit {
            self.metrics.hits += 1;
            let mut buf = self.pool.swap_remove(idx);
            self.metrics.current_size = self
                .metrics
                .current_size
                .saturating_sub(buf.capacity() * mem::size_of::<T>());
            buf.clear();

            debug_assert_eq!(
                self.metrics.current_size,
                self.pool
                    .iter()
                    .map(|b| b.capacity() * size_of::<T>())
                    .sum()
            );

            buf
        } else {
            self.metrics.misses += 1;
            Vec::with_capacity(capacity)
        }
    }

    /// Return a Vec back into the pool for reuse.
    pub fn recycle_buffer(&mut self, buf: Vec<T>) {
        let buffer_bytes = buf.capacity() * mem::size_of::<T>();
        if self.metrics.current_size + buffer_bytes <= MAX_BUFFERS_SIZE {
            self.metrics.current_size += buffer_bytes;
            self.pool.push(buf);
            self.trim_excess();
        } else {
            self.metrics.drops += 1;
        }
    }

    /// Remove largest buffers until total pooled bytes ≤ TRIM_THRESHOLD.
    fn trim_excess(&mut self) {
        while self.metrics.current_size > TRIM_THRESHOLD {
            let Some((max_idx, max_bytes)) = self
                .pool
                .iter()
                .enumerate()
                .map(|(i, buf)| (i, buf.capacity() * mem::size_of::<T>()))
                .max_by_key(|(_, bytes)| *bytes)
            else {
                break;
            };
            self.pool.swap_remove(max_idx);
            self.metrics.current_size = self.metrics.current_size.saturating_sub(max_bytes);
        }

        debug_assert_eq!(
            self.metrics.current_size,
            self.pool
                .iter()
                .map(|b| b.capacity() * size_of::<T>())
                .sum()
        );
    }

}

impl<T> Drop for BufferPool<T> {
    fn drop(&mut self) {
        let m = &self.metrics;
        if m.hits + m.misses > 0 {
            log::trace!(
                "chunk buffer pool: {} reused, {} allocated, {} dropped, {} bytes held",
                m.hits,
                m.misses,
                m.drops,
                m.current_size
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_recycled() {
        let pool = BufferPool::<f32>::shared();
        {
            let mut a = PooledBuffer::with_capacity(&pool, 128);
            a.extend(std::iter::repeat(1.0).take(128));
        }
        let b = PooledBuffer::with_capacity(&pool, 64);
        assert!(b.is_empty());
        assert!(b.capacity() >= 128);
        let metrics = pool.borrow().metrics.clone();
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.hits, 1);
    }
}
