//! The port-buffer pool.
//!
//! Port buffers are equal-sized slices of SHM segments. The first buffer
//! of the first segment is the shared silence buffer: zeroed once here,
//! handed to every unconnected input, never assigned to a port. The free
//! list hands out the front and takes returns at the back, which keeps
//! buffers in memory-address order in steady state — an inherited cache
//! hint, not something anyone relies on.

use std::collections::VecDeque;
use std::ptr;

use tracing::debug;

use ruteo_core::proto::SegmentKey;
use ruteo_shm::{Segment, ShmError, ShmRegistry};

/// A buffer's address in pool terms: segment index and byte offset.
pub type BufferHandle = (i32, u32);

/// Pool of per-period buffers carved from SHM segments.
pub struct BufferPool {
    segments: Vec<Segment>,
    free: VecDeque<BufferHandle>,
    buffer_bytes: u32,
    silence: Option<BufferHandle>,
}

impl BufferPool {
    /// An empty pool; segments arrive once the driver publishes a period.
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
            free: VecDeque::new(),
            buffer_bytes: 0,
            silence: None,
        }
    }

    /// Bytes per buffer in the current configuration.
    pub fn buffer_bytes(&self) -> u32 {
        self.buffer_bytes
    }

    /// The shared silence buffer.
    ///
    /// Panics if called before the first segment exists; the engine
    /// creates one before any client can ask.
    pub fn silence(&self) -> BufferHandle {
        self.silence.expect("buffer pool not yet populated")
    }

    /// Add a segment holding `nbuffers` buffers of `buffer_bytes` each.
    ///
    /// The first segment ever added donates its first buffer as the
    /// silence buffer, zero-filled here.
    pub fn add_segment(
        &mut self,
        registry: &ShmRegistry,
        nbuffers: u32,
        buffer_bytes: u32,
    ) -> Result<SegmentKey, ShmError> {
        let seg = registry.alloc(nbuffers as usize * buffer_bytes as usize)?;
        let key = seg.key();
        let index = self.segments.len() as i32;
        self.buffer_bytes = buffer_bytes;

        for i in 0..nbuffers {
            self.free.push_back((index, i * buffer_bytes));
        }

        if self.silence.is_none() {
            let handle = self.free.pop_front().expect("nbuffers > 0");
            // Safety: fresh in-bounds buffer.
            unsafe {
                ptr::write_bytes(seg.as_ptr().add(handle.1 as usize), 0, buffer_bytes as usize);
            }
            self.silence = Some(handle);
        }

        self.segments.push(seg);
        debug!(index, nbuffers, buffer_bytes, "added port buffer segment");
        Ok(key)
    }

    /// Take a free buffer, if any.
    pub fn acquire(&mut self) -> Option<BufferHandle> {
        self.free.pop_front()
    }

    /// Return a buffer to the pool.
    pub fn release(&mut self, handle: BufferHandle) {
        debug_assert_ne!(Some(handle), self.silence, "silence buffer released");
        self.free.push_back(handle);
    }

    /// Raw pointer to a buffer. The pool outlives every use: segments are
    /// only dropped when the whole pool is rebuilt under the engine's
    /// locks with no cycle running.
    pub fn buffer_ptr(&self, handle: BufferHandle) -> *mut u8 {
        let seg = &self.segments[handle.0 as usize];
        assert!(
            handle.1 + self.buffer_bytes <= seg.len() as u32,
            "buffer handle outside segment"
        );
        // Safety: bounds asserted.
        unsafe { seg.as_ptr().add(handle.1 as usize) }
    }

    /// Drop every segment and start over with one fresh segment of
    /// `nbuffers * buffer_bytes`.
    pub fn rebuild(
        &mut self,
        registry: &ShmRegistry,
        nbuffers: u32,
        buffer_bytes: u32,
    ) -> Result<SegmentKey, ShmError> {
        self.destroy_all(registry)?;
        self.add_segment(registry, nbuffers, buffer_bytes)
    }

    /// Unmap and unlink every segment. The pool is unusable until a new
    /// segment is added.
    pub fn destroy_all(&mut self, registry: &ShmRegistry) -> Result<(), ShmError> {
        for seg in self.segments.drain(..) {
            let key = seg.key();
            drop(seg);
            registry.destroy(&key)?;
        }
        self.free.clear();
        self.silence = None;
        Ok(())
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(tag: &str) -> ShmRegistry {
        ShmRegistry::open_named(&format!("/ruteo-pool-{tag}-{}", std::process::id())).unwrap()
    }

    #[test]
    fn silence_is_reserved_and_zero() {
        let reg = registry("silence");
        let mut pool = BufferPool::new();
        pool.add_segment(&reg, 4, 64).unwrap();

        let silence = pool.silence();
        let ptr = pool.buffer_ptr(silence);
        // Safety: in-bounds read of the zeroed buffer.
        let bytes = unsafe { std::slice::from_raw_parts(ptr, 64) };
        assert!(bytes.iter().all(|&b| b == 0));

        // Silence never comes back out of the free list.
        let mut handed = Vec::new();
        while let Some(h) = pool.acquire() {
            assert_ne!(h, silence);
            handed.push(h);
        }
        assert_eq!(handed.len(), 3);

        pool.destroy_all(&reg).unwrap();
        reg.destroy_registry().unwrap();
    }

    #[test]
    fn release_keeps_address_order_in_steady_state() {
        let reg = registry("order");
        let mut pool = BufferPool::new();
        pool.add_segment(&reg, 4, 64).unwrap();

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(a.1 < b.1);
        pool.release(a);
        pool.release(b);
        // Third buffer is still ahead of the returned ones.
        let c = pool.acquire().unwrap();
        assert!(c.1 > b.1);
        assert_eq!(pool.acquire().unwrap(), a);

        pool.destroy_all(&reg).unwrap();
        reg.destroy_registry().unwrap();
    }

    #[test]
    fn rebuild_replaces_segments() {
        let reg = registry("rebuild");
        let mut pool = BufferPool::new();
        let old = pool.add_segment(&reg, 4, 64).unwrap();
        let new = pool.rebuild(&reg, 4, 128).unwrap();
        assert_ne!(old.name, new.name);
        assert_eq!(pool.buffer_bytes(), 128);
        // Silence was re-donated from the new segment.
        assert_eq!(pool.silence().0, 0);

        pool.destroy_all(&reg).unwrap();
        reg.destroy_registry().unwrap();
    }
}
