//! Instancing System
//!
//! Routes scene events to instance groups and drives the once-per-frame flush.
//!
//! # Architecture
//!
//! - Groups live in a generation-checked [`SlotMap`] keyed by [`GroupId`]
//! - `group_by_key` finds the group for a resolved [`InstanceKey`]
//! - `entity_group` is the side index that makes removal O(1); an entity is in
//!   at most one group
//! - The GPU backend is owned here and lent to groups for each operation
//!
//! # Frame flow
//!
//! ```text
//! events ──handle_event──► group pending lists ──on_update──► GPU buffers ──submit_draws──► draws
//! ```
//!
//! # Usage
//!
//! ```rust
//! use instancing_engine::prelude::*;
//!
//! let mut world = World::new();
//! let mut assets = AssetCatalog::new();
//! let rock = MeshAssetId::new(7);
//! assets.insert_mesh(MeshAsset::new(rock, "rock", 120, 360));
//! assets.insert_material(MaterialId::new(1));
//!
//! let mut instancing = InstancingSystem::new(RecordingBackend::new(), InstancingConfig::default());
//! world.spawn(Transform::identity(), MeshComponent::new(rock, vec![MaterialId::new(1)]));
//!
//! let events = world.drain_events();
//! instancing.run_frame(events, &world, &assets)?;
//! assert_eq!(instancing.submit_draws()?, 1);
//! # Ok::<(), InstancingError>(())
//! ```

use super::group::{GroupStats, InstanceGroup, Removal};
use super::key::InstanceKey;
use super::stats::InstancingStats;
use crate::assets::{AssetCatalog, MaterialId, MeshAssetId, MISSING_MATERIAL, MISSING_MESH};
use crate::config::InstancingConfig;
use crate::ecs::{Entity, MeshComponent, SceneView, TransformStore};
use crate::events::{AssetEvent, ComponentEvent, ComponentEventKind, SceneEvent};
use crate::foundation::collections::{GroupId, SlotMap};
use crate::foundation::math::Transform;
use crate::render::backend::{GpuBackend, GpuError};
use crate::render::draw::{self, DrawBatch};
use std::collections::HashMap;
use thiserror::Error;

/// Errors surfaced to the frame driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstancingError {
    /// The GPU backend failed; the frame cannot continue
    #[error("GPU backend failure: {0}")]
    Gpu(#[from] GpuError),
}

/// Result type for instancing operations
pub type InstancingResult<T> = Result<T, InstancingError>;

/// Owner of every instance group
pub struct InstancingSystem<B: GpuBackend> {
    backend: B,
    config: InstancingConfig,
    groups: SlotMap<GroupId, InstanceGroup>,
    group_by_key: HashMap<InstanceKey, GroupId>,
    entity_group: HashMap<Entity, GroupId>,
    retired_work: GroupStats,
    groups_created: u64,
    groups_destroyed: u64,
}

impl<B: GpuBackend> InstancingSystem<B> {
    /// Create a system drawing through `backend`
    pub fn new(backend: B, config: InstancingConfig) -> Self {
        log::info!(
            "Instancing system ready ({} min slots, {:?} compaction)",
            config.min_buffer_slots,
            config.compaction
        );
        Self {
            backend,
            config,
            groups: SlotMap::with_key(),
            group_by_key: HashMap::new(),
            entity_group: HashMap::new(),
            retired_work: GroupStats::default(),
            groups_created: 0,
            groups_destroyed: 0,
        }
    }

    /// Handle every event in order, then flush
    pub fn run_frame<S>(
        &mut self,
        events: impl IntoIterator<Item = SceneEvent>,
        scene: &S,
        assets: &AssetCatalog,
    ) -> InstancingResult<()>
    where
        S: SceneView + ?Sized,
    {
        for event in events {
            self.handle_event(&event, scene, assets)?;
        }
        self.on_update(scene)
    }

    /// Dispatch one scene event
    pub fn handle_event<S>(&mut self, event: &SceneEvent, scene: &S, assets: &AssetCatalog) -> InstancingResult<()>
    where
        S: SceneView + ?Sized,
    {
        match event {
            SceneEvent::Mesh(event) => self.on_mesh_event(*event, scene, assets),
            SceneEvent::Transform(event) => {
                self.on_transform_event(*event);
                Ok(())
            }
            SceneEvent::Asset(AssetEvent::MeshReady(mesh)) => self.on_mesh_ready(*mesh, scene, assets),
            SceneEvent::Asset(AssetEvent::MeshDeleted(mesh)) => self.on_mesh_asset_deletion(*mesh, scene, assets),
            SceneEvent::Asset(AssetEvent::MaterialDeleted(material)) => {
                self.on_material_deletion(*material, scene, assets)
            }
        }
    }

    /// Mesh component added, changed, or removed
    ///
    /// Added and updated components are sorted into the group for their
    /// resolved key; an entity whose key changed leaves its old group first.
    /// A component that is gone by the time the event is handled counts as
    /// deleted.
    pub fn on_mesh_event<S>(
        &mut self,
        event: ComponentEvent<MeshComponent>,
        scene: &S,
        assets: &AssetCatalog,
    ) -> InstancingResult<()>
    where
        S: SceneView + ?Sized,
    {
        let entity = event.entity;
        match event.kind {
            ComponentEventKind::Added | ComponentEventKind::Updated => match scene.mesh_component(entity) {
                Some(component) => {
                    let key = InstanceKey::resolve(component, assets);
                    self.sort_entity(entity, key, scene, assets)
                }
                None => {
                    log::debug!("{} has no mesh component, removing from instancing", entity);
                    self.remove_entity(entity, scene)
                }
            },
            ComponentEventKind::Deleted => self.remove_entity(entity, scene),
        }
    }

    /// Transform changed; the owning group re-uploads it at the next flush
    pub fn on_transform_event(&mut self, event: ComponentEvent<Transform>) {
        if event.kind == ComponentEventKind::Deleted {
            return;
        }
        let Some(&id) = self.entity_group.get(&event.entity) else {
            return;
        };
        if let Some(group) = self.groups.get_mut(id) {
            group.flag_instance_transform_update(event.entity);
        }
    }

    /// A mesh asset was unloaded
    ///
    /// Every group drawing it is torn down and its buffer released; its
    /// entities are re-sorted under the fallback mesh with the same shader and
    /// materials.
    pub fn on_mesh_asset_deletion<T>(
        &mut self,
        mesh: MeshAssetId,
        transforms: &T,
        assets: &AssetCatalog,
    ) -> InstancingResult<()>
    where
        T: TransformStore + ?Sized,
    {
        if mesh == MISSING_MESH {
            log::warn!("Ignoring deletion of the fallback mesh");
            return Ok(());
        }

        let affected: Vec<GroupId> = self
            .groups
            .iter()
            .filter(|(_, group)| group.mesh_asset() == mesh)
            .map(|(id, _)| id)
            .collect();

        for id in affected {
            let Some(group) = self.groups.get(id) else {
                continue;
            };
            let fallback = group.key().with_mesh(MISSING_MESH);
            let entities = self.dissolve_group(id);
            log::info!("{} deleted, moving {} entities to {}", mesh, entities.len(), fallback);

            for entity in entities {
                self.sort_entity(entity, fallback.clone(), transforms, assets)?;
            }
        }
        Ok(())
    }

    /// A material was deleted
    ///
    /// Groups using it are re-keyed in place with the fallback material. When
    /// a group with the re-keyed identity already exists, the entities merge
    /// into it and the old group is destroyed.
    pub fn on_material_deletion<T>(
        &mut self,
        material: MaterialId,
        transforms: &T,
        assets: &AssetCatalog,
    ) -> InstancingResult<()>
    where
        T: TransformStore + ?Sized,
    {
        if material == MISSING_MATERIAL {
            log::warn!("Ignoring deletion of the fallback material");
            return Ok(());
        }

        let affected: Vec<GroupId> = self
            .groups
            .iter()
            .filter(|(_, group)| group.key().uses_material(material))
            .map(|(id, _)| id)
            .collect();

        for id in affected {
            let Some(group) = self.groups.get_mut(id) else {
                continue;
            };
            let old_key = group.key().clone();
            let new_key = old_key.with_material_replaced(material, MISSING_MATERIAL);

            match self.group_by_key.get(&new_key).copied() {
                Some(target) if target != id => {
                    let entities = self.dissolve_group(id);
                    log::info!("{} deleted, merging {} entities into {}", material, entities.len(), new_key);
                    for entity in entities {
                        self.sort_entity(entity, new_key.clone(), transforms, assets)?;
                    }
                }
                _ => {
                    log::info!("{} deleted, group {} now draws as {}", material, old_key, new_key);
                    group.rekey(new_key.clone());
                    self.group_by_key.remove(&old_key);
                    self.group_by_key.insert(new_key, id);
                }
            }
        }
        Ok(())
    }

    /// A mesh finished loading
    ///
    /// Entities that name it but were drawn with the fallback mesh move to
    /// their real group.
    pub fn on_mesh_ready<S>(&mut self, mesh: MeshAssetId, scene: &S, assets: &AssetCatalog) -> InstancingResult<()>
    where
        S: SceneView + ?Sized,
    {
        let waiting: Vec<Entity> = self
            .groups
            .values()
            .filter(|group| group.mesh_asset() == MISSING_MESH)
            .flat_map(|group| group.entities())
            .filter(|&entity| scene.mesh_component(entity).is_some_and(|c| c.mesh == mesh))
            .collect();

        if !waiting.is_empty() {
            log::debug!("{} ready, re-sorting {} entities", mesh, waiting.len());
        }

        for entity in waiting {
            if let Some(component) = scene.mesh_component(entity) {
                let key = InstanceKey::resolve(component, assets);
                self.sort_entity(entity, key, scene, assets)?;
            }
        }
        Ok(())
    }

    /// Flush every group, then destroy the ones left empty
    pub fn on_update<T>(&mut self, transforms: &T) -> InstancingResult<()>
    where
        T: TransformStore + ?Sized,
    {
        for (_, group) in self.groups.iter_mut() {
            group.process_updates(&mut self.backend, transforms)?;
        }

        let empty: Vec<GroupId> = self
            .groups
            .iter()
            .filter(|(_, group)| group.is_empty())
            .map(|(id, _)| id)
            .collect();
        for id in empty {
            self.destroy_group(id);
        }
        Ok(())
    }

    /// Release every buffer and forget every entity
    pub fn clear(&mut self) {
        let ids: Vec<GroupId> = self.groups.keys().collect();
        log::info!("Clearing {} instance groups", ids.len());
        for id in ids {
            self.destroy_group(id);
        }
        self.group_by_key.clear();
        self.entity_group.clear();
    }

    /// Draw batches for every group with something to draw
    pub fn draw_batches(&self) -> Vec<DrawBatch> {
        draw::collect_batches(self.groups.iter())
    }

    /// Issue one instanced draw per drawable group, returning the draw count
    pub fn submit_draws(&mut self) -> InstancingResult<usize> {
        let batches = self.draw_batches();
        Ok(draw::submit(&mut self.backend, &batches)?)
    }

    fn sort_entity<T>(
        &mut self,
        entity: Entity,
        key: InstanceKey,
        transforms: &T,
        assets: &AssetCatalog,
    ) -> InstancingResult<()>
    where
        T: TransformStore + ?Sized,
    {
        if let Some(&current) = self.entity_group.get(&entity) {
            if self.groups.get(current).is_some_and(|group| *group.key() == key) {
                return Ok(());
            }
            self.remove_entity(entity, transforms)?;
        }

        let id = self.group_for_key(key, assets);
        if let Some(group) = self.groups.get_mut(id) {
            let added = group.add_instance(entity);
            debug_assert!(added, "{} already queued in {}", entity, group.key());
            self.entity_group.insert(entity, id);
        }
        Ok(())
    }

    fn remove_entity<T>(&mut self, entity: Entity, transforms: &T) -> InstancingResult<()>
    where
        T: TransformStore + ?Sized,
    {
        let Some(id) = self.entity_group.remove(&entity) else {
            return Ok(());
        };
        let Some(group) = self.groups.get_mut(id) else {
            log::debug!("{} pointed at a destroyed group", entity);
            return Ok(());
        };

        let removal = group.remove_instance(entity, &mut self.backend, transforms)?;
        debug_assert_ne!(removal, Removal::Absent, "{} missing from {}", entity, group.key());

        if group.is_empty() {
            self.destroy_group(id);
        }
        Ok(())
    }

    fn group_for_key(&mut self, key: InstanceKey, assets: &AssetCatalog) -> GroupId {
        if let Some(&id) = self.group_by_key.get(&key) {
            if self.groups.contains_key(id) {
                return id;
            }
        }

        let limit = self.config.tombstone_limit_for(assets.vertices_per_instance(key.mesh));
        log::info!("Created instance group {} (tombstone limit {})", key, limit);
        let id = self.groups.insert(InstanceGroup::new(key.clone(), limit, &self.config));
        self.group_by_key.insert(key, id);
        self.groups_created += 1;
        id
    }

    /// Destroy a group and detach its entities, returning them in slot order
    fn dissolve_group(&mut self, id: GroupId) -> Vec<Entity> {
        let entities = match self.groups.get_mut(id) {
            Some(group) => group.take_entities(),
            None => return Vec::new(),
        };
        for entity in &entities {
            self.entity_group.remove(entity);
        }
        self.destroy_group(id);
        entities
    }

    fn destroy_group(&mut self, id: GroupId) {
        let Some(mut group) = self.groups.remove(id) else {
            return;
        };

        if self.group_by_key.get(group.key()) == Some(&id) {
            self.group_by_key.remove(group.key());
        }
        for entity in group.entities() {
            if self.entity_group.get(&entity) == Some(&id) {
                self.entity_group.remove(&entity);
            }
        }

        let released = group.release_buffer(&mut self.backend);
        self.retired_work += group.stats();
        self.groups_destroyed += 1;
        match released {
            Some(handle) => log::info!("Destroyed instance group {} and released {}", group.key(), handle),
            None => log::info!("Destroyed instance group {}", group.key()),
        }
    }

    /// Group currently holding `entity`
    pub fn group_of(&self, entity: Entity) -> Option<GroupId> {
        self.entity_group.get(&entity).copied()
    }

    /// Group drawing `key`, if one exists
    pub fn group_for(&self, key: &InstanceKey) -> Option<GroupId> {
        self.group_by_key.get(key).copied()
    }

    /// Look up a group
    pub fn group(&self, id: GroupId) -> Option<&InstanceGroup> {
        self.groups.get(id)
    }

    /// Every live group
    pub fn groups(&self) -> impl Iterator<Item = (GroupId, &InstanceGroup)> {
        self.groups.iter()
    }

    /// Number of live groups
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Configuration in use
    pub fn config(&self) -> &InstancingConfig {
        &self.config
    }

    /// The GPU backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The GPU backend, mutably
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Current state and cumulative GPU work
    pub fn stats(&self) -> InstancingStats {
        let mut stats = InstancingStats {
            active_groups: self.groups.len(),
            groups_created: self.groups_created,
            groups_destroyed: self.groups_destroyed,
            ..InstancingStats::default()
        };
        stats.add_gpu_work(self.retired_work);
        for group in self.groups.values() {
            stats.live_instances += group.live_instance_count();
            stats.tombstones += u64::from(group.tombstone_count());
            stats.drawn_instances += u64::from(group.draw_instance_count());
            stats.add_gpu_work(group.stats());
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{MeshAsset, ShaderVariantId};
    use crate::config::CompactionPolicy;
    use crate::ecs::World;
    use crate::foundation::math::Vec3;
    use crate::render::backend::{GpuCall, RecordingBackend};
    use crate::render::instancing::{GpuTransform, TRANSFORM_STRIDE};
    use approx::assert_relative_eq;
    use std::collections::HashSet;

    const ROCK: MeshAssetId = MeshAssetId::new(1);
    const SHIP: MeshAssetId = MeshAssetId::new(2);
    const STONE: MaterialId = MaterialId::new(10);
    const METAL: MaterialId = MaterialId::new(11);

    struct Scene {
        world: World,
        assets: AssetCatalog,
        instancing: InstancingSystem<RecordingBackend>,
    }

    impl Scene {
        fn new() -> Self {
            Self::with_config(InstancingConfig::default())
        }

        fn with_config(config: InstancingConfig) -> Self {
            let mut assets = AssetCatalog::new();
            assets.insert_mesh(MeshAsset::new(ROCK, "rock", 100, 300));
            assets.insert_mesh(MeshAsset::new(SHIP, "ship", 500, 0));
            assets.insert_material(STONE);
            assets.insert_material(METAL);
            Self {
                world: World::new(),
                assets,
                instancing: InstancingSystem::new(RecordingBackend::new(), config),
            }
        }

        fn spawn(&mut self, mesh: MeshAssetId, material: MaterialId, x: f32) -> Entity {
            self.world.spawn(
                Transform::from_position(Vec3::new(x, 0.0, 0.0)),
                MeshComponent::new(mesh, vec![material]),
            )
        }

        fn frame(&mut self) -> InstancingResult<()> {
            let events = self.world.drain_events();
            self.instancing.run_frame(events, &self.world, &self.assets)
        }

        fn group_of(&self, entity: Entity) -> &InstanceGroup {
            let id = self.instancing.group_of(entity).unwrap();
            self.instancing.group(id).unwrap()
        }

        fn slot_transform(&self, entity: Entity) -> GpuTransform {
            let group = self.group_of(entity);
            let slot = group.slot_of(entity).unwrap() as usize;
            let bytes = self.instancing.backend().buffer(group.buffer_handle().unwrap()).unwrap();
            GpuTransform::from_bytes(&bytes[slot * TRANSFORM_STRIDE..]).unwrap()
        }

        fn assert_invariants(&self) {
            let mut seen = HashSet::new();
            for (id, group) in self.instancing.groups() {
                group.assert_invariants();
                assert_eq!(self.instancing.group_for(group.key()), Some(id));
                for entity in group.entities() {
                    assert!(seen.insert(entity), "{} in two groups", entity);
                    assert_eq!(self.instancing.group_of(entity), Some(id));
                }
            }
        }
    }

    #[test]
    fn test_spawn_groups_by_key() {
        let mut scene = Scene::new();
        let a = scene.spawn(ROCK, STONE, 0.0);
        let b = scene.spawn(ROCK, STONE, 1.0);
        let c = scene.spawn(ROCK, METAL, 2.0);
        let d = scene.spawn(SHIP, STONE, 3.0);
        scene.frame().unwrap();

        assert_eq!(scene.instancing.group_count(), 3);
        assert_eq!(scene.instancing.group_of(a), scene.instancing.group_of(b));
        assert_ne!(scene.instancing.group_of(a), scene.instancing.group_of(c));
        assert_ne!(scene.group_of(a).buffer_handle(), scene.group_of(c).buffer_handle());
        assert_ne!(scene.instancing.group_of(a), scene.instancing.group_of(d));
        assert_eq!(scene.group_of(b).slot_of(b), Some(1));
        assert_relative_eq!(scene.slot_transform(c).columns[3][0], 2.0);
        scene.assert_invariants();
    }

    #[test]
    fn test_group_count_matches_distinct_keys() {
        let mut scene = Scene::new();
        let mut keys = HashSet::new();
        for i in 0..24u32 {
            let mesh = if i % 2 == 0 { ROCK } else { SHIP };
            let material = if i % 3 == 0 { STONE } else { METAL };
            let shader = ShaderVariantId::new(i % 4 / 2);
            keys.insert((mesh, material, shader));
            scene.world.spawn(
                Transform::identity(),
                MeshComponent::new(mesh, vec![material]).with_shader(shader),
            );
        }
        scene.frame().unwrap();

        assert_eq!(scene.instancing.group_count(), keys.len());
        assert_eq!(scene.instancing.stats().live_instances, 24);
        scene.assert_invariants();
    }

    #[test]
    fn test_tombstone_limit_follows_mesh_size() {
        let mut scene = Scene::new();
        let rock = scene.spawn(ROCK, STONE, 0.0);
        let ship = scene.spawn(SHIP, STONE, 0.0);
        scene.frame().unwrap();

        // 10_000 / 300 indices and 10_000 / 500 vertices
        assert_eq!(scene.group_of(rock).tombstone_limit(), 33);
        assert_eq!(scene.group_of(ship).tombstone_limit(), 20);
    }

    #[test]
    fn test_transform_update_reaches_buffer() {
        let mut scene = Scene::new();
        let entities: Vec<Entity> = (0..4).map(|i| scene.spawn(ROCK, STONE, i as f32)).collect();
        scene.frame().unwrap();
        scene.instancing.backend_mut().take_calls();

        scene.world.update_transform(entities[2], |t| t.translate(Vec3::new(0.0, 5.0, 0.0)));
        scene.frame().unwrap();

        assert_eq!(scene.instancing.backend().uploads(), vec![(2 * TRANSFORM_STRIDE, TRANSFORM_STRIDE)]);
        assert_relative_eq!(scene.slot_transform(entities[2]).columns[3][1], 5.0);
    }

    #[test]
    fn test_idle_frame_does_nothing() {
        let mut scene = Scene::new();
        scene.spawn(ROCK, STONE, 0.0);
        scene.frame().unwrap();
        scene.instancing.backend_mut().take_calls();

        scene.frame().unwrap();
        assert!(scene.instancing.backend().calls().is_empty());
    }

    #[test]
    fn test_despawn_last_entity_destroys_group() {
        let mut scene = Scene::new();
        let a = scene.spawn(ROCK, STONE, 0.0);
        scene.frame().unwrap();
        let handle = scene.group_of(a).buffer_handle().unwrap();

        scene.world.despawn(a);
        scene.frame().unwrap();

        assert_eq!(scene.instancing.group_count(), 0);
        assert_eq!(scene.instancing.group_of(a), None);
        assert_eq!(scene.instancing.backend().release_count(handle), 1);
        assert_eq!(scene.instancing.stats().groups_destroyed, 1);
    }

    #[test]
    fn test_spawn_and_despawn_in_same_frame() {
        let mut scene = Scene::new();
        let a = scene.spawn(ROCK, STONE, 0.0);
        scene.world.despawn(a);
        scene.frame().unwrap();

        assert_eq!(scene.instancing.group_count(), 0);
        assert!(scene.instancing.backend().calls().is_empty());
    }

    #[test]
    fn test_mesh_change_moves_entity() {
        let mut scene = Scene::new();
        let a = scene.spawn(ROCK, STONE, 0.0);
        let b = scene.spawn(ROCK, STONE, 1.0);
        scene.frame().unwrap();
        let rock_group = scene.instancing.group_of(a).unwrap();

        scene.world.insert_mesh(b, MeshComponent::new(ROCK, vec![METAL]));
        scene.frame().unwrap();

        assert_ne!(scene.instancing.group_of(b), Some(rock_group));
        assert_eq!(scene.group_of(b).materials(), &[METAL]);
        assert_eq!(scene.instancing.group(rock_group).unwrap().tombstone_count(), 1);
        scene.assert_invariants();
    }

    #[test]
    fn test_unchanged_key_update_is_noop() {
        let mut scene = Scene::new();
        let a = scene.spawn(ROCK, STONE, 0.0);
        scene.frame().unwrap();
        scene.instancing.backend_mut().take_calls();

        scene.world.insert_mesh(a, MeshComponent::new(ROCK, vec![STONE]));
        scene.frame().unwrap();

        assert_eq!(scene.group_of(a).slot_of(a), Some(0));
        assert!(scene.instancing.backend().calls().is_empty());
    }

    #[test]
    fn test_removing_mesh_component_removes_instance() {
        let mut scene = Scene::new();
        let a = scene.spawn(ROCK, STONE, 0.0);
        let b = scene.spawn(ROCK, STONE, 1.0);
        scene.frame().unwrap();

        scene.world.remove_mesh(a);
        scene.frame().unwrap();

        assert_eq!(scene.instancing.group_of(a), None);
        assert_eq!(scene.group_of(b).live_instance_count(), 1);
        scene.assert_invariants();
    }

    #[test]
    fn test_mesh_asset_deletion_releases_buffer_once() {
        let mut scene = Scene::new();
        let rocks: Vec<Entity> = (0..3).map(|i| scene.spawn(ROCK, STONE, i as f32)).collect();
        let ship = scene.spawn(SHIP, STONE, 9.0);
        scene.frame().unwrap();
        let old_group = scene.instancing.group_of(rocks[0]).unwrap();
        let handle = scene.group_of(rocks[0]).buffer_handle().unwrap();

        let event = scene.assets.remove_mesh(ROCK).unwrap();
        scene.world.emit_asset_event(event);
        scene.frame().unwrap();

        assert!(scene.instancing.group(old_group).is_none());
        let backend = scene.instancing.backend();
        assert_eq!(backend.release_count(handle), 1);
        let release_at = backend
            .calls()
            .iter()
            .position(|c| *c == GpuCall::Release { handle })
            .unwrap();
        assert!(backend.calls()[release_at + 1..].iter().all(|call| match call {
            GpuCall::Create { handle: h, .. }
            | GpuCall::Resize { handle: h, .. }
            | GpuCall::Upload { handle: h, .. }
            | GpuCall::Release { handle: h } => *h != handle,
            GpuCall::Draw { buffer, .. } => *buffer != handle,
        }));

        for &rock in &rocks {
            assert_eq!(scene.group_of(rock).mesh_asset(), MISSING_MESH);
            assert_eq!(scene.group_of(rock).materials(), &[STONE]);
        }
        assert_relative_eq!(scene.slot_transform(rocks[2]).columns[3][0], 2.0);
        assert_eq!(scene.group_of(ship).mesh_asset(), SHIP);

        scene.instancing.submit_draws().unwrap();
        assert!(!scene
            .instancing
            .backend()
            .calls()
            .iter()
            .any(|c| matches!(c, GpuCall::Draw { buffer, .. } if *buffer == handle)));
        scene.assert_invariants();
    }

    #[test]
    fn test_fallback_entities_despawn_cleanly() {
        let mut scene = Scene::new();
        let rock = scene.spawn(ROCK, STONE, 0.0);
        scene.frame().unwrap();
        let event = scene.assets.remove_mesh(ROCK).unwrap();
        scene.world.emit_asset_event(event);
        scene.frame().unwrap();

        scene.world.despawn(rock);
        scene.frame().unwrap();

        assert_eq!(scene.instancing.group_count(), 0);
        assert_eq!(scene.instancing.backend().live_buffer_count(), 0);
    }

    #[test]
    fn test_mesh_ready_moves_entities_off_fallback() {
        let mut scene = Scene::new();
        let crate_mesh = MeshAssetId::new(30);
        let boxed = scene.spawn(crate_mesh, STONE, 4.0);
        let rock = scene.spawn(ROCK, STONE, 0.0);
        scene.frame().unwrap();
        assert_eq!(scene.group_of(boxed).mesh_asset(), MISSING_MESH);

        let event = scene.assets.insert_mesh(MeshAsset::new(crate_mesh, "crate", 24, 36));
        scene.world.emit_asset_event(event);
        scene.frame().unwrap();

        assert_eq!(scene.group_of(boxed).mesh_asset(), crate_mesh);
        assert_relative_eq!(scene.slot_transform(boxed).columns[3][0], 4.0);
        assert_eq!(scene.group_of(rock).mesh_asset(), ROCK);
        // The fallback group emptied and was pruned
        assert_eq!(scene.instancing.group_count(), 2);
        scene.assert_invariants();
    }

    #[test]
    fn test_material_deletion_rekeys_in_place() {
        let mut scene = Scene::new();
        let a = scene.spawn(ROCK, METAL, 0.0);
        let b = scene.spawn(ROCK, METAL, 1.0);
        scene.frame().unwrap();
        let id = scene.instancing.group_of(a).unwrap();
        let handle = scene.group_of(a).buffer_handle();
        scene.instancing.backend_mut().take_calls();

        let event = scene.assets.remove_material(METAL).unwrap();
        scene.world.emit_asset_event(event);
        scene.frame().unwrap();

        assert_eq!(scene.instancing.group_of(a), Some(id));
        assert_eq!(scene.group_of(b).materials(), &[MISSING_MATERIAL]);
        assert_eq!(scene.group_of(a).buffer_handle(), handle);
        assert!(scene.instancing.backend().calls().is_empty());
        scene.assert_invariants();
    }

    #[test]
    fn test_material_deletion_merges_into_existing_group() {
        let mut scene = Scene::new();
        let metal = scene.spawn(ROCK, METAL, 0.0);
        let missing = scene.spawn(ROCK, MaterialId::new(99), 1.0);
        scene.frame().unwrap();
        let metal_group = scene.instancing.group_of(metal).unwrap();
        let missing_group = scene.instancing.group_of(missing).unwrap();
        let metal_handle = scene.group_of(metal).buffer_handle().unwrap();

        let event = scene.assets.remove_material(METAL).unwrap();
        scene.world.emit_asset_event(event);
        scene.frame().unwrap();

        assert_eq!(scene.instancing.group_count(), 1);
        assert!(scene.instancing.group(metal_group).is_none());
        assert_eq!(scene.instancing.group_of(metal), Some(missing_group));
        assert_eq!(scene.group_of(metal).slot_of(metal), Some(1));
        assert_eq!(scene.instancing.backend().release_count(metal_handle), 1);
        scene.assert_invariants();
    }

    #[test]
    fn test_compaction_through_system() {
        let config = InstancingConfig {
            wasted_vertex_budget: 900,
            ..InstancingConfig::default()
        };
        let mut scene = Scene::with_config(config);
        let rocks: Vec<Entity> = (0..10).map(|i| scene.spawn(ROCK, STONE, i as f32)).collect();
        scene.frame().unwrap();
        assert_eq!(scene.group_of(rocks[0]).tombstone_limit(), 3);

        for &rock in rocks.iter().take(3) {
            scene.world.despawn(rock);
        }
        scene.frame().unwrap();

        let group = scene.group_of(rocks[3]);
        assert_eq!(group.tombstone_count(), 0);
        assert_eq!(group.used_slot_count(), 7);
        assert_eq!(group.slot_of(rocks[3]), Some(0));
        assert_relative_eq!(scene.slot_transform(rocks[9]).columns[3][0], 9.0);
        assert_eq!(scene.instancing.stats().compactions, 1);
    }

    #[test]
    fn test_deferred_compaction_through_system() {
        let config = InstancingConfig {
            wasted_vertex_budget: 600,
            ..InstancingConfig::default()
        }
        .with_compaction(CompactionPolicy::Deferred);
        let mut scene = Scene::with_config(config);
        let rocks: Vec<Entity> = (0..5).map(|i| scene.spawn(ROCK, STONE, i as f32)).collect();
        scene.frame().unwrap();

        scene.world.despawn(rocks[1]);
        scene.world.despawn(rocks[2]);
        scene.frame().unwrap();

        let group = scene.group_of(rocks[0]);
        assert_eq!(group.tombstone_count(), 0);
        assert_eq!(group.slot_of(rocks[4]), Some(2));
        scene.assert_invariants();
    }

    #[test]
    fn test_out_of_memory_halts_frame() {
        let mut scene = Scene::new();
        scene.instancing = InstancingSystem::new(
            RecordingBackend::with_memory_budget(16 * TRANSFORM_STRIDE),
            InstancingConfig::default(),
        );
        for i in 0..17 {
            scene.spawn(ROCK, STONE, i as f32);
        }

        let result = scene.frame();
        assert!(matches!(result, Err(InstancingError::Gpu(GpuError::OutOfMemory { .. }))));
    }

    #[test]
    fn test_draw_submission_covers_tombstones() {
        let mut scene = Scene::new();
        let rocks: Vec<Entity> = (0..4).map(|i| scene.spawn(ROCK, STONE, i as f32)).collect();
        scene.spawn(SHIP, METAL, 0.0);
        scene.frame().unwrap();
        scene.world.despawn(rocks[1]);
        scene.frame().unwrap();
        scene.instancing.backend_mut().take_calls();

        assert_eq!(scene.instancing.submit_draws().unwrap(), 2);
        let rock_draw = scene
            .instancing
            .backend()
            .calls()
            .iter()
            .find_map(|c| match c {
                GpuCall::Draw { mesh, instance_count, .. } if *mesh == ROCK => Some(*instance_count),
                _ => None,
            });
        assert_eq!(rock_draw, Some(4));
    }

    #[test]
    fn test_clear_releases_everything() {
        let mut scene = Scene::new();
        let rock = scene.spawn(ROCK, STONE, 0.0);
        scene.spawn(SHIP, METAL, 0.0);
        scene.frame().unwrap();

        scene.instancing.clear();

        assert_eq!(scene.instancing.group_count(), 0);
        assert_eq!(scene.instancing.group_of(rock), None);
        assert_eq!(scene.instancing.backend().live_buffer_count(), 0);
        assert_eq!(scene.instancing.stats().groups_destroyed, 2);
        assert!(scene.instancing.stats().range_uploads >= 2);
    }

    #[test]
    fn test_churn_keeps_side_index_consistent() {
        let mut scene = Scene::new();
        let materials = [STONE, METAL];
        let meshes = [ROCK, SHIP];
        let mut live: Vec<Entity> = Vec::new();
        let mut seed = 0x9e37_79b9u32;

        for frame in 0..40 {
            for _ in 0..6 {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                let pick = seed as usize;
                match seed % 4 {
                    0 | 1 => live.push(scene.spawn(meshes[pick % 2], materials[(pick >> 3) % 2], frame as f32)),
                    2 if !live.is_empty() => {
                        let entity = live.swap_remove(pick % live.len());
                        scene.world.despawn(entity);
                    }
                    _ if !live.is_empty() => {
                        let entity = live[pick % live.len()];
                        scene.world.insert_mesh(entity, MeshComponent::new(meshes[(pick >> 5) % 2], vec![materials[pick % 2]]));
                        scene.world.update_transform(entity, |t| t.translate(Vec3::new(1.0, 0.0, 0.0)));
                    }
                    _ => {}
                }
            }
            scene.frame().unwrap();
            scene.assert_invariants();

            for &entity in &live {
                let expected = GpuTransform::from(scene.world.transform(entity).unwrap().to_matrix());
                assert_eq!(scene.slot_transform(entity), expected);
            }
        }
        assert_eq!(scene.instancing.stats().live_instances, live.len());
    }
}
