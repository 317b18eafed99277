//! A pool of byte buffers used to reassemble chunked downloads.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct PoolInner {
    /// Buffers available for reuse.
    buffers: Mutex<Vec<Vec<u8>>>,
    /// Maximum number of idle buffers kept around.
    max_buffers: usize,
    /// Buffers currently handed out.
    outstanding: AtomicUsize,
}

impl PoolInner {
    fn put(&self, mut buffer: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);

        buffer.clear();
        if buffer.capacity() == 0 {
            return;
        }
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < self.max_buffers {
            buffers.push(buffer);
        }
    }
}

/// A shared pool of `Vec<u8>` buffers.
///
/// Buffers are returned to the pool when their [`PooledBuffer`] is dropped, which
/// also happens when a download fails halfway.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(max_buffers: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffers: Mutex::new(Vec::new()),
                max_buffers,
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Takes a zero-filled buffer of exactly `len` bytes from the pool.
    ///
    /// The smallest idle buffer that fits is reused, otherwise a new one is allocated.
    pub fn get(&self, len: usize) -> PooledBuffer {
        let reused = {
            let mut buffers = self.inner.buffers.lock().unwrap();
            let best_fit = buffers
                .iter()
                .enumerate()
                .filter(|(_, buf)| buf.capacity() >= len)
                .min_by_key(|(_, buf)| buf.capacity())
                .map(|(idx, _)| idx);
            best_fit.map(|idx| buffers.swap_remove(idx))
        };

        let mut buffer = reused.unwrap_or_else(|| Vec::with_capacity(len));
        buffer.resize(len, 0);
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);

        PooledBuffer {
            buffer,
            pool: Arc::clone(&self.inner),
        }
    }

    /// The number of buffers that were handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// The number of idle buffers ready for reuse.
    pub fn idle(&self) -> usize {
        self.inner.buffers.lock().unwrap().len()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("max_buffers", &self.inner.max_buffers)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// A buffer borrowed from a [`BufferPool`].
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buffer));
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buffer.len())
            .finish()
    }
}
