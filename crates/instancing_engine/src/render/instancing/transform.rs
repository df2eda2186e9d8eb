//! GPU layout of one instance slot

use crate::foundation::math::Mat4;
use bytemuck::{Pod, Zeroable};

/// One column-major 4x4 world matrix as the vertex shader reads it
///
/// Slot `i` of a group buffer lives at byte offset `i * TRANSFORM_STRIDE`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuTransform {
    /// Matrix columns
    pub columns: [[f32; 4]; 4],
}

/// Size in bytes of one slot
pub const TRANSFORM_STRIDE: usize = std::mem::size_of::<GpuTransform>();

impl GpuTransform {
    /// All-zero matrix; collapses every vertex onto the origin so a tombstoned
    /// slot rasterizes nothing
    pub const DEGENERATE: Self = Self { columns: [[0.0; 4]; 4] };

    /// True for the zero-scale tombstone transform
    pub fn is_degenerate(&self) -> bool {
        *self == Self::DEGENERATE
    }

    /// Read a slot back from raw buffer bytes
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytes
            .get(..TRANSFORM_STRIDE)
            .map(bytemuck::pod_read_unaligned::<Self>)
    }
}

impl From<Mat4> for GpuTransform {
    fn from(matrix: Mat4) -> Self {
        Self::from(&matrix)
    }
}

impl From<&Mat4> for GpuTransform {
    fn from(matrix: &Mat4) -> Self {
        let mut columns = [[0.0; 4]; 4];
        for (c, column) in columns.iter_mut().enumerate() {
            for (r, value) in column.iter_mut().enumerate() {
                *value = matrix[(r, c)];
            }
        }
        Self { columns }
    }
}

impl From<GpuTransform> for Mat4 {
    fn from(transform: GpuTransform) -> Self {
        Mat4::from_fn(|r, c| transform.columns[c][r])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::{Transform, Vec3};
    use approx::assert_relative_eq;

    #[test]
    fn test_stride_is_one_mat4() {
        assert_eq!(TRANSFORM_STRIDE, 64);
    }

    #[test]
    fn test_column_major_layout() {
        let matrix = Transform::from_position(Vec3::new(1.0, 2.0, 3.0)).to_matrix();
        let gpu = GpuTransform::from(matrix);

        assert_eq!(gpu.columns[3], [1.0, 2.0, 3.0, 1.0]);
        assert_relative_eq!(Mat4::from(gpu), matrix);
    }

    #[test]
    fn test_bytes_round_trip() {
        let gpu = GpuTransform::from(Mat4::identity());
        let bytes = bytemuck::bytes_of(&gpu);

        assert_eq!(GpuTransform::from_bytes(bytes), Some(gpu));
        assert_eq!(GpuTransform::from_bytes(&bytes[..10]), None);
        assert!(GpuTransform::from_bytes(&[0; 64]).unwrap().is_degenerate());
    }
}
