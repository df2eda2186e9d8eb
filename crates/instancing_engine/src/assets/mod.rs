//! Asset identifiers and the catalog of drawable assets
//!
//! The instancing system never loads geometry. It only needs to know which
//! meshes and materials currently exist, how many vertices a mesh renders per
//! instance (to size the tombstone budget), and which fallback assets stand in
//! for anything missing. [`AssetCatalog`] answers those questions and produces
//! the [`AssetEvent`]s that announce changes.

use crate::events::AssetEvent;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Identifier of a mesh asset (its vertex array on the GPU)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshAssetId(u64);

impl MeshAssetId {
    /// Wrap a raw identifier
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw identifier
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MeshAssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mesh#{}", self.0)
    }
}

/// Identifier of a material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialId(u64);

impl MaterialId {
    /// Wrap a raw identifier
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw identifier
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MaterialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "material#{}", self.0)
    }
}

/// Identifier of a compiled shader permutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ShaderVariantId(u32);

impl ShaderVariantId {
    /// Wrap a raw identifier
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw identifier
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ShaderVariantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shader#{}", self.0)
    }
}

/// Mesh drawn in place of a deleted or not-yet-loaded mesh
pub const MISSING_MESH: MeshAssetId = MeshAssetId::new(0);

/// Material bound in place of a deleted material
pub const MISSING_MATERIAL: MaterialId = MaterialId::new(0);

/// Geometry footprint of a loaded mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshAsset {
    /// Asset identifier
    pub id: MeshAssetId,
    /// Human-readable name
    pub name: String,
    /// Number of vertices in the vertex buffer
    pub vertex_count: u32,
    /// Number of indices, zero for non-indexed meshes
    pub index_count: u32,
}

impl MeshAsset {
    /// Create a mesh footprint
    pub fn new(id: MeshAssetId, name: impl Into<String>, vertex_count: u32, index_count: u32) -> Self {
        Self {
            id,
            name: name.into(),
            vertex_count,
            index_count,
        }
    }

    /// Vertices the vertex shader runs for one instance of this mesh
    pub fn vertices_per_instance(&self) -> u32 {
        if self.index_count > 0 {
            self.index_count
        } else {
            self.vertex_count
        }
    }
}

/// Registry of live meshes and materials with fallback resolution
#[derive(Debug)]
pub struct AssetCatalog {
    meshes: HashMap<MeshAssetId, MeshAsset>,
    materials: HashSet<MaterialId>,
}

impl AssetCatalog {
    /// Create a catalog holding only the fallback cube and material
    pub fn new() -> Self {
        let mut meshes = HashMap::new();
        meshes.insert(MISSING_MESH, MeshAsset::new(MISSING_MESH, "missing_cube", 24, 36));

        let mut materials = HashSet::new();
        materials.insert(MISSING_MATERIAL);

        Self { meshes, materials }
    }

    /// Register a loaded mesh, announcing it to waiting entities
    pub fn insert_mesh(&mut self, mesh: MeshAsset) -> AssetEvent {
        let id = mesh.id;
        log::debug!("Mesh {} ({}) ready: {} vertices, {} indices", id, mesh.name, mesh.vertex_count, mesh.index_count);
        self.meshes.insert(id, mesh);
        AssetEvent::MeshReady(id)
    }

    /// Unload a mesh
    ///
    /// Returns `None` for unknown meshes and for the fallback mesh, which
    /// cannot be removed.
    pub fn remove_mesh(&mut self, id: MeshAssetId) -> Option<AssetEvent> {
        if id == MISSING_MESH {
            log::warn!("Refusing to remove the fallback mesh");
            return None;
        }
        self.meshes.remove(&id).map(|_| AssetEvent::MeshDeleted(id))
    }

    /// Register a material
    pub fn insert_material(&mut self, id: MaterialId) {
        self.materials.insert(id);
    }

    /// Delete a material
    ///
    /// Returns `None` for unknown materials and for the fallback material.
    pub fn remove_material(&mut self, id: MaterialId) -> Option<AssetEvent> {
        if id == MISSING_MATERIAL {
            log::warn!("Refusing to remove the fallback material");
            return None;
        }
        self.materials.remove(&id).then_some(AssetEvent::MaterialDeleted(id))
    }

    /// Look up a loaded mesh
    pub fn mesh(&self, id: MeshAssetId) -> Option<&MeshAsset> {
        self.meshes.get(&id)
    }

    /// True when the mesh is loaded
    pub fn contains_mesh(&self, id: MeshAssetId) -> bool {
        self.meshes.contains_key(&id)
    }

    /// True when the material exists
    pub fn contains_material(&self, id: MaterialId) -> bool {
        self.materials.contains(&id)
    }

    /// The mesh to draw for `id`: itself when loaded, otherwise the fallback
    pub fn resolve_mesh(&self, id: MeshAssetId) -> MeshAssetId {
        if self.contains_mesh(id) {
            id
        } else {
            MISSING_MESH
        }
    }

    /// The material to bind for `id`: itself when it exists, otherwise the fallback
    pub fn resolve_material(&self, id: MaterialId) -> MaterialId {
        if self.contains_material(id) {
            id
        } else {
            MISSING_MATERIAL
        }
    }

    /// Per-instance vertex count of a mesh, using the fallback for unknown ids
    pub fn vertices_per_instance(&self, id: MeshAssetId) -> u32 {
        self.mesh(self.resolve_mesh(id))
            .map_or(1, MeshAsset::vertices_per_instance)
    }
}

impl Default for AssetCatalog {
    fn default() -> Self {
        Self::new()
    }
}
