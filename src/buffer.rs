//! Buffer reuse across connections.
//!
//! The server keeps two bounded free lists, one for read buffers and one
//! for write buffers. A connection takes a buffer from each on accept and
//! gives them back on close, unless the buffer grew past the size cap;
//! oversized buffers are discarded so a single large command cannot pin
//! memory forever. Both lists live under the server lock.

/// A bounded LIFO free list of byte buffers.
pub(crate) struct BufferPool {
    bufs: Vec<Vec<u8>>,
    max_pooled: usize,
    max_buf_len: usize,
}

impl BufferPool {
    /// An empty pool holding at most `max_pooled` buffers of at most
    /// `max_buf_len` bytes each.
    pub(crate) fn new(max_pooled: usize, max_buf_len: usize) -> Self {
        Self {
            bufs: Vec::with_capacity(max_pooled),
            max_pooled,
            max_buf_len,
        }
    }

    /// A pool pre-populated to capacity with zeroed `max_buf_len` buffers.
    pub(crate) fn prefilled(max_pooled: usize, max_buf_len: usize) -> Self {
        let mut pool = Self::new(max_pooled, max_buf_len);
        pool.bufs
            .extend((0..max_pooled).map(|_| vec![0; max_buf_len]));
        pool
    }

    /// Takes a buffer, if one is available.
    pub(crate) fn take(&mut self) -> Option<Vec<u8>> {
        self.bufs.pop()
    }

    /// Returns a buffer to the pool.
    ///
    /// Silently discards it when the pool is full or the buffer outgrew
    /// the size cap.
    pub(crate) fn put(&mut self, buf: Vec<u8>) {
        if self.bufs.len() < self.max_pooled && buf.capacity() <= self.max_buf_len {
            self.bufs.push(buf);
        }
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.bufs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_and_put_recycle() {
        let mut pool = BufferPool::prefilled(2, 16);
        assert_eq!(pool.available(), 2);

        let a = pool.take().unwrap();
        let b = pool.take().unwrap();
        assert_eq!(a.len(), 16);
        assert!(pool.take().is_none());

        pool.put(a);
        pool.put(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn full_pool_discards_returns() {
        let mut pool = BufferPool::prefilled(1, 16);
        pool.put(vec![0; 16]);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn oversized_buffers_are_discarded() {
        let mut pool = BufferPool::new(4, 16);
        pool.put(vec![0; 17]);
        assert_eq!(pool.available(), 0);
        pool.put(Vec::with_capacity(64));
        assert_eq!(pool.available(), 0);
        pool.put(vec![0; 16]);
        assert_eq!(pool.available(), 1);
    }
}
