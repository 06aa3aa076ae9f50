use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024 * 1024;
const MIN_BUFFER_SIZE: usize = 64 * 1024;

/// Reusable byte buffers for fingerprinting and archive copies.
///
/// A checked-out buffer belongs to exactly one synchronous operation and goes
/// back to the pool when the guard is dropped.
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(MIN_BUFFER_SIZE),
            max_idle,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn checkout(&self) -> PooledBuffer<'_> {
        let buf = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size]);

        PooledBuffer {
            pool: self,
            buf: Some(buf),
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn give_back(&self, buf: Vec<u8>) {
        let mut idle = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, 8)
    }
}

pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: Option<Vec<u8>>,
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}
