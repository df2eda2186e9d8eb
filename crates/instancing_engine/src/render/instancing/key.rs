//! Instance compatibility key

use crate::assets::{AssetCatalog, MaterialId, MeshAssetId, ShaderVariantId};
use crate::ecs::MeshComponent;
use std::fmt;

/// Identity of an instance group
///
/// Two entities can share one instanced draw exactly when their keys are
/// equal. Material order matters: it follows the mesh's submeshes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    /// Mesh asset
    pub mesh: MeshAssetId,
    /// Shader permutation
    pub shader: ShaderVariantId,
    /// Materials ordered by submesh
    pub materials: Vec<MaterialId>,
}

impl InstanceKey {
    /// Create a key
    pub fn new(mesh: MeshAssetId, shader: ShaderVariantId, materials: Vec<MaterialId>) -> Self {
        Self { mesh, shader, materials }
    }

    /// Key a mesh component draws under, with missing assets swapped for the
    /// catalog's fallbacks
    pub fn resolve(component: &MeshComponent, assets: &AssetCatalog) -> Self {
        Self {
            mesh: assets.resolve_mesh(component.mesh),
            shader: component.shader,
            materials: component
                .materials
                .iter()
                .map(|&material| assets.resolve_material(material))
                .collect(),
        }
    }

    /// True if the key draws with `material`
    pub fn uses_material(&self, material: MaterialId) -> bool {
        self.materials.contains(&material)
    }

    /// Copy of this key with every use of `from` replaced by `to`
    pub fn with_material_replaced(&self, from: MaterialId, to: MaterialId) -> Self {
        Self {
            materials: self
                .materials
                .iter()
                .map(|&m| if m == from { to } else { m })
                .collect(),
            ..self.clone()
        }
    }

    /// Copy of this key drawing `mesh` instead
    pub fn with_mesh(&self, mesh: MeshAssetId) -> Self {
        Self { mesh, ..self.clone() }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/[", self.mesh, self.shader)?;
        for (i, material) in self.materials.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", material)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{MeshAsset, MISSING_MATERIAL, MISSING_MESH};

    #[test]
    fn test_material_order_is_significant() {
        let mesh = MeshAssetId::new(1);
        let a = InstanceKey::new(mesh, ShaderVariantId::default(), vec![MaterialId::new(1), MaterialId::new(2)]);
        let b = InstanceKey::new(mesh, ShaderVariantId::default(), vec![MaterialId::new(2), MaterialId::new(1)]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_resolve_substitutes_fallbacks() {
        let mut assets = AssetCatalog::new();
        let rock = MeshAssetId::new(4);
        let granite = MaterialId::new(8);
        assets.insert_material(granite);

        let component = MeshComponent::new(rock, vec![granite, MaterialId::new(99)]);
        let key = InstanceKey::resolve(&component, &assets);
        assert_eq!(key.mesh, MISSING_MESH);
        assert_eq!(key.materials, vec![granite, MISSING_MATERIAL]);

        assets.insert_mesh(MeshAsset::new(rock, "rock", 12, 0));
        assert_eq!(InstanceKey::resolve(&component, &assets).mesh, rock);
    }

    #[test]
    fn test_material_replacement() {
        let key = InstanceKey::new(
            MeshAssetId::new(1),
            ShaderVariantId::new(2),
            vec![MaterialId::new(5), MaterialId::new(6), MaterialId::new(5)],
        );
        let replaced = key.with_material_replaced(MaterialId::new(5), MISSING_MATERIAL);

        assert!(!replaced.uses_material(MaterialId::new(5)));
        assert_eq!(replaced.materials, vec![MISSING_MATERIAL, MaterialId::new(6), MISSING_MATERIAL]);
        assert_eq!(key.to_string(), "mesh#1/shader#2/[material#5,material#6,material#5]");
    }
}
