//! Fixed-size byte buffer pool

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::Pool;

/// Panic message for a buffer returned with the wrong length
pub const INVALID_LENGTH_MESSAGE: &str = "attempted to release buffer with invalid length";

/// Pool of byte buffers that all have exactly the same length.
///
/// Buffers are never resized. Returning a buffer of any other length is a
/// programmer error and panics; release builds abort on panic.
#[derive(Debug)]
pub struct BufferPool {
    size: usize,
    inner: Pool<Vec<u8>>,
}

impl BufferPool {
    /// # Panics
    ///
    /// Panics if `size` is zero: a zero-length read is indistinguishable from
    /// end of stream.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "buffer pool size must be non-zero");
        Self {
            size,
            inner: Pool::new(move || vec![0u8; size]),
        }
    }

    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.inner = self.inner.with_max_idle(max_idle);
        self
    }

    /// Declared length of every buffer in this pool
    pub fn buffer_size(&self) -> usize {
        self.size
    }

    pub fn acquire(&self) -> Vec<u8> {
        self.inner.acquire()
    }

    /// Return a buffer.
    ///
    /// # Panics
    ///
    /// Panics if `buf.len()` differs from [`BufferPool::buffer_size`].
    pub fn release(&self, buf: Vec<u8>) {
        if buf.len() != self.size {
            tracing::error!(
                expected = self.size,
                actual = buf.len(),
                "{}",
                INVALID_LENGTH_MESSAGE
            );
            panic!("{}", INVALID_LENGTH_MESSAGE);
        }
        self.inner.release(buf);
    }

    /// Acquire a buffer that returns itself on drop
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        PooledBuffer {
            buf: Some(self.acquire()),
            pool: Arc::clone(self),
        }
    }

    pub fn idle(&self) -> usize {
        self.inner.idle()
    }

    pub fn created(&self) -> u64 {
        self.inner.created()
    }
}

/// Buffer borrowed from a [`BufferPool`]; only exposes the slice so its
/// length cannot change while it is out.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => buf,
            None => unreachable!("buffer read after release"),
        }
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.buf {
            Some(buf) => buf,
            None => unreachable!("buffer read after release"),
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
