//! GPU backend abstraction for instance buffers
//!
//! The instancing system issues only five kinds of GPU work: create a buffer,
//! resize it (preserving contents), write a byte range, release it, and draw a
//! mesh instanced from it. [`GpuBackend`] is that surface. The system owns its
//! backend and receives it at construction, so tests substitute
//! [`RecordingBackend`] and inspect every call.

pub mod recording;

pub use recording::{GpuCall, RecordingBackend};

use crate::assets::MeshAssetId;
use std::fmt;
use thiserror::Error;

/// Result type for backend operations
pub type GpuResult<T> = Result<T, GpuError>;

/// Opaque handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Errors reported by a GPU backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GpuError {
    /// Allocation could not be satisfied
    #[error("Out of GPU memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Bytes requested
        requested: usize,
        /// Bytes still available
        available: usize,
    },

    /// Handle was never created or has been released
    #[error("Invalid buffer handle: {0}")]
    InvalidHandle(BufferHandle),

    /// Write would run past the end of the buffer
    #[error("Upload out of bounds on {handle}: offset {offset} + {len} bytes exceeds size {size}")]
    OutOfBounds {
        /// Target buffer
        handle: BufferHandle,
        /// Byte offset of the write
        offset: usize,
        /// Length of the write
        len: usize,
        /// Current buffer size
        size: usize,
    },
}

/// Backend trait for instance buffer management and instanced draws
pub trait GpuBackend {
    /// Allocate a buffer of `size_bytes`
    fn create_buffer(&mut self, size_bytes: usize) -> GpuResult<BufferHandle>;

    /// Reallocate a buffer, preserving the first `min(old, new)` bytes
    fn resize_buffer(&mut self, handle: BufferHandle, size_bytes: usize) -> GpuResult<()>;

    /// Write `data` at `byte_offset`; must stay within the buffer size
    fn upload_range(&mut self, handle: BufferHandle, byte_offset: usize, data: &[u8]) -> GpuResult<()>;

    /// Free a buffer; the handle is invalid afterwards
    fn release_buffer(&mut self, handle: BufferHandle);

    /// Draw `instance_count` instances of `mesh`, reading transforms from `buffer`
    fn draw_instanced(&mut self, mesh: MeshAssetId, buffer: BufferHandle, instance_count: u32) -> GpuResult<()>;
}
