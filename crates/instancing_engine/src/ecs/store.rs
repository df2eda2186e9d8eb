//! Read-only views of ECS data used by the instancing system
//!
//! The instancing system does not own component storage. It reads world
//! matrices when it serializes slots and reads mesh components when it
//! resolves instance keys. Anything that can answer those two questions can
//! drive it; [`World`](super::World) is the in-crate implementation.

use super::{Entity, MeshComponent};
use crate::foundation::math::Mat4;

/// Stable accessor for per-entity world transforms
pub trait TransformStore {
    /// World matrix of `entity`, or `None` if it has no transform
    fn world_matrix(&self, entity: Entity) -> Option<Mat4>;
}

/// Accessor for mesh components
pub trait MeshComponentStore {
    /// Mesh component of `entity`, or `None` if it has none
    fn mesh_component(&self, entity: Entity) -> Option<&MeshComponent>;
}

/// Everything the instancing system reads from the scene
pub trait SceneView: TransformStore + MeshComponentStore {}

impl<T: TransformStore + MeshComponentStore + ?Sized> SceneView for T {}
