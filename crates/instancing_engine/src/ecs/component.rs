//! Components consumed by the instancing system

use crate::assets::{MaterialId, MeshAssetId, ShaderVariantId};

/// Marks an entity as drawable with a mesh, a shader variant and one material
/// per submesh
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MeshComponent {
    /// Mesh asset to draw
    pub mesh: MeshAssetId,
    /// Shader permutation used for the draw
    pub shader: ShaderVariantId,
    /// Materials, ordered by submesh
    pub materials: Vec<MaterialId>,
}

impl MeshComponent {
    /// Create a mesh component with the default shader variant
    pub fn new(mesh: MeshAssetId, materials: Vec<MaterialId>) -> Self {
        Self {
            mesh,
            shader: ShaderVariantId::default(),
            materials,
        }
    }

    /// Use a specific shader variant
    pub fn with_shader(mut self, shader: ShaderVariantId) -> Self {
        self.shader = shader;
        self
    }
}
