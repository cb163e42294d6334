//! Graphics buffer handles and the allocator seam.
//!
//! The queue never allocates GPU memory itself; it asks a [`BufferAllocator`]
//! for handles and gives them back when a slot is freed. [`GraphicsBuffer`] is
//! the process-local handle the queue bookkeeps; the memory behind it lives
//! with the allocator.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;

/// Pixel format tag. Values mirror the usual native-window format ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferFormat(pub u32);

impl BufferFormat {
    /// No explicit format requested; the queue default applies.
    pub const UNDEFINED: BufferFormat = BufferFormat(0);
    pub const RGBA_8888: BufferFormat = BufferFormat(1);
    pub const RGBX_8888: BufferFormat = BufferFormat(2);
    pub const RGB_565: BufferFormat = BufferFormat(4);
}

/// Usage bit constants ORed into allocation requests.
pub mod usage {
    pub const CPU_READ: u64 = 1 << 0;
    pub const CPU_WRITE: u64 = 1 << 1;
    pub const GPU_TEXTURE: u64 = 1 << 8;
    pub const GPU_RENDER_TARGET: u64 = 1 << 9;
}

/// Handle to one allocated buffer.
///
/// `generation` is stamped by the queue when the buffer enters its
/// bookkeeping; a detached buffer can only be re-attached while the stamp
/// still matches the queue's current generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GraphicsBuffer {
    pub id: u64,
    pub width: u32,
    pub height: u32,
    pub format: BufferFormat,
    pub usage: u64,
    pub generation: u32,
}

impl GraphicsBuffer {
    /// Whether this buffer can serve a request for the given geometry and
    /// usage without reallocation. Extra usage bits on the buffer are fine;
    /// missing ones are not.
    pub fn matches(&self, width: u32, height: u32, format: BufferFormat, usage: u64) -> bool {
        self.width == width
            && self.height == height
            && self.format == format
            && (self.usage & usage) == usage
    }
}

#[derive(Error, Debug, Clone)]
#[error("{width}x{height}: {reason}")]
pub struct AllocationError {
    pub width: u32,
    pub height: u32,
    pub reason: String,
}

/// External collaborator owning the actual buffer memory.
///
/// Implementations must be thread-safe: the queue calls `allocate` with its
/// lock released, so an allocator may be entered while other queue operations
/// are in flight.
pub trait BufferAllocator: Send + Sync {
    fn allocate(
        &self,
        width: u32,
        height: u32,
        format: BufferFormat,
        usage: u64,
    ) -> Result<GraphicsBuffer, AllocationError>;

    /// Give a buffer back to the allocator.
    ///
    /// The queue may release a buffer whose last [`Fence`](crate::Fence) has
    /// not signaled yet (teardown and capacity renegotiation free slots
    /// carrying pending fences). Implementations backed by memory that is
    /// still referenced by in-flight work must defer the actual reclamation
    /// until those accesses complete; the id is retired immediately either
    /// way.
    fn release(&self, buffer: GraphicsBuffer);
}

/// Allocator that mints plain handles without backing GPU memory.
///
/// Suitable for tests, demos and software-composited pipelines where the
/// handle id is enough to find the actual storage elsewhere.
#[derive(Debug, Default)]
pub struct SoftwareAllocator {
    next_id: AtomicU64,
    live: AtomicUsize,
}

impl SoftwareAllocator {
    pub fn new() -> Self {
        SoftwareAllocator::default()
    }

    /// Number of buffers currently allocated and not yet released.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

impl BufferAllocator for SoftwareAllocator {
    fn allocate(
        &self,
        width: u32,
        height: u32,
        format: BufferFormat,
        usage: u64,
    ) -> Result<GraphicsBuffer, AllocationError> {
        if width == 0 || height == 0 {
            return Err(AllocationError {
                width,
                height,
                reason: "zero-sized allocation".into(),
            });
        }
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(GraphicsBuffer {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            width,
            height,
            format,
            usage,
            generation: 0,
        })
    }

    fn release(&self, _buffer: GraphicsBuffer) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_requires_usage_superset() {
        let buffer = GraphicsBuffer {
            id: 0,
            width: 64,
            height: 64,
            format: BufferFormat::RGBA_8888,
            usage: usage::CPU_WRITE | usage::GPU_TEXTURE,
            generation: 0,
        };
        assert!(buffer.matches(64, 64, BufferFormat::RGBA_8888, usage::CPU_WRITE));
        assert!(!buffer.matches(64, 64, BufferFormat::RGBA_8888, usage::CPU_READ));
        assert!(!buffer.matches(32, 64, BufferFormat::RGBA_8888, usage::CPU_WRITE));
        assert!(!buffer.matches(64, 64, BufferFormat::RGB_565, usage::CPU_WRITE));
    }

    #[test]
    fn test_software_allocator_tracks_live_buffers() {
        let allocator = SoftwareAllocator::new();
        let a = allocator
            .allocate(16, 16, BufferFormat::RGBA_8888, usage::CPU_WRITE)
            .unwrap();
        let b = allocator
            .allocate(16, 16, BufferFormat::RGBA_8888, usage::CPU_WRITE)
            .unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(allocator.live(), 2);
        allocator.release(a);
        assert_eq!(allocator.live(), 1);
        allocator.release(b);
        assert_eq!(allocator.live(), 0);
    }

    #[test]
    fn test_software_allocator_rejects_zero_size() {
        let allocator = SoftwareAllocator::new();
        assert!(allocator
            .allocate(0, 16, BufferFormat::RGBA_8888, 0)
            .is_err());
        assert_eq!(allocator.live(), 0);
    }
}
