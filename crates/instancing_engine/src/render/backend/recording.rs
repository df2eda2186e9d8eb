//! In-memory backend that records every call
//!
//! Buffers are plain byte vectors so tests can read back what a slot holds.
//! An optional memory budget makes allocation failures reproducible.

use super::{BufferHandle, GpuBackend, GpuError, GpuResult};
use crate::assets::MeshAssetId;
use std::collections::HashMap;

/// One recorded backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuCall {
    /// `create_buffer`
    Create {
        /// Returned handle
        handle: BufferHandle,
        /// Requested size
        size: usize,
    },
    /// `resize_buffer`
    Resize {
        /// Target buffer
        handle: BufferHandle,
        /// New size
        size: usize,
    },
    /// `upload_range`
    Upload {
        /// Target buffer
        handle: BufferHandle,
        /// Byte offset
        offset: usize,
        /// Byte length
        len: usize,
    },
    /// `release_buffer`
    Release {
        /// Released buffer
        handle: BufferHandle,
    },
    /// `draw_instanced`
    Draw {
        /// Mesh drawn
        mesh: MeshAssetId,
        /// Instance buffer
        buffer: BufferHandle,
        /// Instance count
        instance_count: u32,
    },
}

/// Fake GPU that keeps buffers in host memory and logs calls
#[derive(Debug, Default)]
pub struct RecordingBackend {
    buffers: HashMap<BufferHandle, Vec<u8>>,
    calls: Vec<GpuCall>,
    next_handle: u64,
    memory_budget: Option<usize>,
}

impl RecordingBackend {
    /// Create a backend with unlimited memory
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend that fails allocations past `bytes` in total
    pub fn with_memory_budget(bytes: usize) -> Self {
        Self {
            memory_budget: Some(bytes),
            ..Self::default()
        }
    }

    /// Every call since creation or the last [`take_calls`](Self::take_calls)
    pub fn calls(&self) -> &[GpuCall] {
        &self.calls
    }

    /// Take and clear the call log
    pub fn take_calls(&mut self) -> Vec<GpuCall> {
        std::mem::take(&mut self.calls)
    }

    /// Number of `upload_range` calls in the log
    pub fn upload_count(&self) -> usize {
        self.calls.iter().filter(|c| matches!(c, GpuCall::Upload { .. })).count()
    }

    /// `(offset, len)` of every upload in the log, in call order
    pub fn uploads(&self) -> Vec<(usize, usize)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                GpuCall::Upload { offset, len, .. } => Some((*offset, *len)),
                _ => None,
            })
            .collect()
    }

    /// Number of times `handle` was released
    pub fn release_count(&self, handle: BufferHandle) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, GpuCall::Release { handle: h } if *h == handle))
            .count()
    }

    /// Contents of a live buffer
    pub fn buffer(&self, handle: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&handle).map(Vec::as_slice)
    }

    /// Number of live buffers
    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Total bytes held by live buffers
    pub fn bytes_allocated(&self) -> usize {
        self.buffers.values().map(Vec::len).sum()
    }

    fn check_budget(&self, extra: usize) -> GpuResult<()> {
        if let Some(budget) = self.memory_budget {
            let available = budget.saturating_sub(self.bytes_allocated());
            if extra > available {
                return Err(GpuError::OutOfMemory {
                    requested: extra,
                    available,
                });
            }
        }
        Ok(())
    }
}

impl GpuBackend for RecordingBackend {
    fn create_buffer(&mut self, size_bytes: usize) -> GpuResult<BufferHandle> {
        self.check_budget(size_bytes)?;

        self.next_handle += 1;
        let handle = BufferHandle(self.next_handle);
        self.buffers.insert(handle, vec![0; size_bytes]);
        self.calls.push(GpuCall::Create { handle, size: size_bytes });
        Ok(handle)
    }

    fn resize_buffer(&mut self, handle: BufferHandle, size_bytes: usize) -> GpuResult<()> {
        let current = self.buffers.get(&handle).ok_or(GpuError::InvalidHandle(handle))?.len();
        self.check_budget(size_bytes.saturating_sub(current))?;

        if let Some(buffer) = self.buffers.get_mut(&handle) {
            buffer.resize(size_bytes, 0);
        }
        self.calls.push(GpuCall::Resize { handle, size: size_bytes });
        Ok(())
    }

    fn upload_range(&mut self, handle: BufferHandle, byte_offset: usize, data: &[u8]) -> GpuResult<()> {
        let buffer = self.buffers.get_mut(&handle).ok_or(GpuError::InvalidHandle(handle))?;
        let end = byte_offset + data.len();
        if end > buffer.len() {
            return Err(GpuError::OutOfBounds {
                handle,
                offset: byte_offset,
                len: data.len(),
                size: buffer.len(),
            });
        }

        buffer[byte_offset..end].copy_from_slice(data);
        self.calls.push(GpuCall::Upload {
            handle,
            offset: byte_offset,
            len: data.len(),
        });
        Ok(())
    }

    fn release_buffer(&mut self, handle: BufferHandle) {
        if self.buffers.remove(&handle).is_none() {
            log::warn!("Release of unknown {}", handle);
        }
        self.calls.push(GpuCall::Release { handle });
    }

    fn draw_instanced(&mut self, mesh: MeshAssetId, buffer: BufferHandle, instance_count: u32) -> GpuResult<()> {
        if !self.buffers.contains_key(&buffer) {
            return Err(GpuError::InvalidHandle(buffer));
        }
        self.calls.push(GpuCall::Draw {
            mesh,
            buffer,
            instance_count,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_preserves_prefix() {
        let mut backend = RecordingBackend::new();
        let handle = backend.create_buffer(8).unwrap();
        backend.upload_range(handle, 0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        backend.resize_buffer(handle, 12).unwrap();
        assert_eq!(backend.buffer(handle).unwrap(), &[1, 2, 3, 4, 5, 6, 7, 8, 0, 0, 0, 0]);

        backend.resize_buffer(handle, 4).unwrap();
        assert_eq!(backend.buffer(handle).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_upload_bounds_checked() {
        let mut backend = RecordingBackend::new();
        let handle = backend.create_buffer(8).unwrap();

        let result = backend.upload_range(handle, 4, &[0; 8]);
        assert!(matches!(result, Err(GpuError::OutOfBounds { size: 8, .. })));
        assert_eq!(backend.upload_count(), 0);
    }

    #[test]
    fn test_released_handle_is_invalid() {
        let mut backend = RecordingBackend::new();
        let handle = backend.create_buffer(8).unwrap();
        backend.release_buffer(handle);

        assert_eq!(backend.upload_range(handle, 0, &[1]), Err(GpuError::InvalidHandle(handle)));
        assert_eq!(backend.release_count(handle), 1);
        assert_eq!(backend.live_buffer_count(), 0);
    }

    #[test]
    fn test_memory_budget() {
        let mut backend = RecordingBackend::with_memory_budget(100);
        let handle = backend.create_buffer(64).unwrap();

        assert!(matches!(
            backend.resize_buffer(handle, 128),
            Err(GpuError::OutOfMemory { requested: 64, available: 36 })
        ));
        assert!(backend.create_buffer(64).is_err());
        assert!(backend.create_buffer(36).is_ok());
    }
}
