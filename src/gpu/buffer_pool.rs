//! Shared allocator of reusable GPU buffers.
//!
//! Instead of one free list per device with a single fixed block size, this
//! pool keeps one bag of free buffers per (size class, usage bitmask) key,
//! rounding each request up to a small set of size classes so the number of
//! distinct bags stays bounded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum BufferPoolError {
    #[error("requested size {0} exceeds the largest configured size class")]
    NoSizeClass(u64),
}

bitflags::bitflags! {
    /// Usage bitmask for a GPU buffer, modeled after typical storage/copy flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const STORAGE = 1 << 0;
        const COPY_SRC = 1 << 1;
        const COPY_DST = 1 << 2;
        const MAP_READ = 1 << 3;
    }
}

/// A reusable device buffer handle. Opaque beyond size/usage/label — the
/// concrete device-memory binding is a kernel-backend concern (non-goal).
#[derive(Debug, Clone)]
pub struct GpuBuffer {
    pub id: u64,
    pub size: u64,
    pub usage: BufferUsage,
    pub label: &'static str,
}

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStats {
    pub current_bytes_allocated: u64,
    pub peak_bytes_allocated: u64,
    pub active_buffers: usize,
    pub pooled_buffers: usize,
}

type PoolKey = (u64, BufferUsage);

/// The shared buffer pool.
pub struct BufferPool {
    size_classes: Vec<u64>,
    free: HashMap<PoolKey, Vec<GpuBuffer>>,
    active: usize,
    current_bytes: u64,
    peak_bytes: u64,
}

impl BufferPool {
    /// Create a pool that rounds requests up to one of `size_classes`
    /// (sorted ascending internally).
    pub fn new(mut size_classes: Vec<u64>) -> Self {
        size_classes.sort_unstable();
        size_classes.dedup();
        Self {
            size_classes,
            free: HashMap::new(),
            active: 0,
            current_bytes: 0,
            peak_bytes: 0,
        }
    }

    fn round_up(&self, size: u64) -> Result<u64, BufferPoolError> {
        self.size_classes
            .iter()
            .copied()
            .find(|&c| c >= size)
            .ok_or(BufferPoolError::NoSizeClass(size))
    }

    /// Acquire a buffer of at least `size` bytes with the given usage.
    ///
    /// Returns a pooled buffer if one of adequate class is free, otherwise
    /// allocates a fresh one.
    pub fn acquire(
        &mut self,
        size: u64,
        usage: BufferUsage,
        label: &'static str,
    ) -> Result<GpuBuffer, BufferPoolError> {
        let class = self.round_up(size)?;
        let key = (class, usage);

        let buffer = if let Some(bag) = self.free.get_mut(&key) {
            bag.pop()
        } else {
            None
        };

        let buffer = buffer.unwrap_or_else(|| {
            let id = NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed);
            debug!(id, size = class, ?usage, label, "Allocating new GPU buffer");
            GpuBuffer {
                id,
                size: class,
                usage,
                label,
            }
        });

        self.active += 1;
        self.current_bytes += buffer.size;
        self.peak_bytes = self.peak_bytes.max(self.current_bytes);

        Ok(buffer)
    }

    /// Return a buffer to its bag for reuse.
    pub fn release(&mut self, buffer: GpuBuffer) {
        self.active = self.active.saturating_sub(1);
        self.current_bytes = self.current_bytes.saturating_sub(buffer.size);

        let key = (buffer.size, buffer.usage);
        self.free.entry(key).or_default().push(buffer);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            current_bytes_allocated: self.current_bytes,
            peak_bytes_allocated: self.peak_bytes,
            active_buffers: self.active,
            pooled_buffers: self.free.values().map(|bag| bag.len()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> BufferPool {
        BufferPool::new(vec![1024, 4096, 16384])
    }

    #[test]
    fn test_round_up_and_acquire() {
        let mut pool = pool();
        let buf = pool.acquire(500, BufferUsage::STORAGE, "test").unwrap();
        assert_eq!(buf.size, 1024);
        assert_eq!(pool.stats().active_buffers, 1);
    }

    #[test]
    fn test_release_then_reacquire_reuses_buffer() {
        let mut pool = pool();
        let buf = pool.acquire(2000, BufferUsage::STORAGE, "test").unwrap();
        let id = buf.id;
        pool.release(buf);
        assert_eq!(pool.stats().pooled_buffers, 1);

        let reused = pool.acquire(2000, BufferUsage::STORAGE, "test").unwrap();
        assert_eq!(reused.id, id);
        assert_eq!(pool.stats().pooled_buffers, 0);
    }

    #[test]
    fn test_oversized_request_errors() {
        let mut pool = pool();
        assert!(pool.acquire(1_000_000, BufferUsage::STORAGE, "test").is_err());
    }

    #[test]
    fn test_peak_bytes_tracks_high_water_mark() {
        let mut pool = pool();
        let a = pool.acquire(1024, BufferUsage::STORAGE, "a").unwrap();
        let _b = pool.acquire(1024, BufferUsage::STORAGE, "b").unwrap();
        assert_eq!(pool.stats().peak_bytes_allocated, 2048);
        pool.release(a);
        assert_eq!(pool.stats().current_bytes_allocated, 1024);
        assert_eq!(pool.stats().peak_bytes_allocated, 2048);
    }
}
