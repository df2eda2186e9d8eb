//! Draw batches
//!
//! One batch per drawable instance group. Batches are ordered by shader, then
//! mesh, then materials so consecutive draws share as much bound state as
//! possible.

use crate::assets::{MaterialId, MeshAssetId, ShaderVariantId};
use crate::foundation::collections::GroupId;
use crate::render::backend::{BufferHandle, GpuBackend, GpuResult};
use crate::render::instancing::InstanceGroup;

/// Everything the renderer needs for one instanced draw
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawBatch {
    /// Group the batch was built from
    pub group: GroupId,
    /// Shader permutation to bind
    pub shader: ShaderVariantId,
    /// Mesh to draw
    pub mesh: MeshAssetId,
    /// Materials by submesh
    pub materials: Vec<MaterialId>,
    /// Instance transform buffer
    pub buffer: BufferHandle,
    /// Instances to draw, tombstones included
    pub instance_count: u32,
}

impl DrawBatch {
    /// Batch for `group`, or `None` when there is nothing to draw yet
    pub fn from_group(id: GroupId, group: &InstanceGroup) -> Option<Self> {
        let buffer = group.buffer_handle()?;
        let instance_count = group.draw_instance_count();
        if instance_count == 0 {
            return None;
        }
        Some(Self {
            group: id,
            shader: group.shader_variant(),
            mesh: group.mesh_asset(),
            materials: group.materials().to_vec(),
            buffer,
            instance_count,
        })
    }

    fn sort_key(&self) -> (ShaderVariantId, MeshAssetId, &[MaterialId]) {
        (self.shader, self.mesh, self.materials.as_slice())
    }
}

/// Build the sorted batch list for a set of groups
pub fn collect_batches<'a>(groups: impl IntoIterator<Item = (GroupId, &'a InstanceGroup)>) -> Vec<DrawBatch> {
    let mut batches: Vec<DrawBatch> = groups
        .into_iter()
        .filter_map(|(id, group)| DrawBatch::from_group(id, group))
        .collect();
    batches.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    batches
}

/// Issue one `draw_instanced` per batch, returning the number of draws
pub fn submit<B: GpuBackend + ?Sized>(backend: &mut B, batches: &[DrawBatch]) -> GpuResult<usize> {
    for batch in batches {
        backend.draw_instanced(batch.mesh, batch.buffer, batch.instance_count)?;
    }
    log::trace!("Submitted {} instanced draws", batches.len());
    Ok(batches.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstancingConfig;
    use crate::ecs::{Entity, TransformStore};
    use crate::foundation::collections::SlotMap;
    use crate::foundation::math::Mat4;
    use crate::render::backend::{GpuCall, RecordingBackend};
    use crate::render::instancing::InstanceKey;

    struct Origin;

    impl TransformStore for Origin {
        fn world_matrix(&self, _entity: Entity) -> Option<Mat4> {
            Some(Mat4::identity())
        }
    }

    fn key(mesh: u64, shader: u32) -> InstanceKey {
        InstanceKey::new(MeshAssetId::new(mesh), ShaderVariantId::new(shader), vec![MaterialId::new(1)])
    }

    #[test]
    fn test_batches_skip_undrawable_groups_and_sort() {
        let config = InstancingConfig::default();
        let mut backend = RecordingBackend::new();
        let mut groups: SlotMap<GroupId, InstanceGroup> = SlotMap::with_key();

        let late = groups.insert(InstanceGroup::new(key(1, 2), 4, &config));
        let early = groups.insert(InstanceGroup::new(key(3, 1), 4, &config));
        let unflushed = groups.insert(InstanceGroup::new(key(2, 0), 4, &config));

        groups[late].add_instance(Entity::new(1));
        groups[early].add_instance(Entity::new(2));
        groups[early].add_instance(Entity::new(3));
        groups[late].process_updates(&mut backend, &Origin).unwrap();
        groups[early].process_updates(&mut backend, &Origin).unwrap();
        groups[unflushed].add_instance(Entity::new(4));

        let batches = collect_batches(groups.iter());
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].group, early);
        assert_eq!(batches[0].instance_count, 2);
        assert_eq!(batches[1].group, late);

        backend.take_calls();
        assert_eq!(submit(&mut backend, &batches).unwrap(), 2);
        assert_eq!(
            backend.calls()[0],
            GpuCall::Draw {
                mesh: MeshAssetId::new(3),
                buffer: batches[0].buffer,
                instance_count: 2,
            }
        );
    }
}
