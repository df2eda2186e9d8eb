//! Instance Group
//!
//! One packed GPU transform buffer shared by every entity with the same
//! [`InstanceKey`], plus the bookkeeping that keeps it consistent without
//! touching the GPU on every event.
//!
//! # Slot lifecycle
//!
//! ```text
//! add_instance ──► pending_appends ──process_updates──► slot_of[e] = next slot
//!                        │                                   │
//!                  remove (free)                remove: degenerate write,
//!                                                   tombstone_count += 1
//!                                                            │
//!                                    tombstone_count >= limit ──► reallocate_instances
//! ```
//!
//! # Upload cost per flush
//!
//! - Appends: one range write covering every new slot
//! - Transform updates: one range write per run of consecutive slots
//! - Compaction: one write of the whole live prefix
//!
//! Slots below `used_slot_count` that belong to nobody are tombstones. They
//! hold [`GpuTransform::DEGENERATE`], so drawing `used_slot_count` instances is
//! always safe.

use super::key::InstanceKey;
use super::transform::{GpuTransform, TRANSFORM_STRIDE};
use crate::assets::{MaterialId, MeshAssetId, ShaderVariantId};
use crate::config::{CompactionPolicy, InstancingConfig};
use crate::ecs::{Entity, TransformStore};
use crate::foundation::math::Mat4;
use crate::render::backend::{BufferHandle, GpuBackend, GpuResult};
use std::collections::{HashMap, HashSet};
use std::ops::{AddAssign, Range};

/// Cumulative GPU work done by one group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupStats {
    /// `upload_range` calls issued
    pub range_uploads: u64,
    /// Bytes written by those calls
    pub bytes_uploaded: u64,
    /// Compactions run
    pub compactions: u64,
    /// Buffer resizes
    pub resizes: u64,
}

impl AddAssign for GroupStats {
    fn add_assign(&mut self, other: Self) {
        self.range_uploads += other.range_uploads;
        self.bytes_uploaded += other.bytes_uploaded;
        self.compactions += other.compactions;
        self.resizes += other.resizes;
    }
}

/// What [`InstanceGroup::remove_instance`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// Entity was not in the group
    Absent,
    /// Entity was still waiting for a slot; nothing reached the GPU
    DroppedPending,
    /// Entity's slot became a tombstone
    Tombstoned {
        /// Slot the entity occupied
        slot: u32,
        /// Whether the removal triggered compaction
        compacted: bool,
    },
}

/// Summary of one [`InstanceGroup::process_updates`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Entities that received a slot
    pub appended: u32,
    /// Slots rewritten because their transform changed
    pub updated: u32,
    /// Range writes issued for the updates
    pub update_runs: u32,
    /// A deferred compaction ran first
    pub compacted: bool,
}

/// Entities sharing one instanced draw and the buffer backing it
#[derive(Debug)]
pub struct InstanceGroup {
    key: InstanceKey,

    slot_of: HashMap<Entity, u32>,
    used_slot_count: u32,
    tombstone_count: u32,
    tombstone_limit: u32,

    pending_appends: Vec<Entity>,
    pending_append_set: HashSet<Entity>,
    pending_updates: HashSet<Entity>,

    buffer: Option<BufferHandle>,
    capacity_slots: u32,

    config: InstancingConfig,
    stats: GroupStats,
}

impl InstanceGroup {
    /// Create an empty group; no GPU buffer exists until the first flush with
    /// pending appends
    pub fn new(key: InstanceKey, tombstone_limit: u32, config: &InstancingConfig) -> Self {
        Self {
            key,
            slot_of: HashMap::new(),
            used_slot_count: 0,
            tombstone_count: 0,
            tombstone_limit: tombstone_limit.max(1),
            pending_appends: Vec::new(),
            pending_append_set: HashSet::new(),
            pending_updates: HashSet::new(),
            buffer: None,
            capacity_slots: 0,
            config: config.clone(),
            stats: GroupStats::default(),
        }
    }

    /// Queue an entity for a slot at the next flush
    ///
    /// Returns false (and does nothing) if the entity already has a slot or is
    /// already queued.
    pub fn add_instance(&mut self, entity: Entity) -> bool {
        if self.slot_of.contains_key(&entity) || !self.pending_append_set.insert(entity) {
            log::trace!("{} already in group {}", entity, self.key);
            return false;
        }
        self.pending_appends.push(entity);
        true
    }

    /// Remove an entity from the group
    ///
    /// A queued entity is simply dropped. A slotted entity's slot is
    /// overwritten with a degenerate transform right away and becomes a
    /// tombstone; reaching the tombstone limit compacts the buffer (eagerly or
    /// at the next flush, depending on the compaction policy).
    pub fn remove_instance<B, T>(&mut self, entity: Entity, backend: &mut B, transforms: &T) -> GpuResult<Removal>
    where
        B: GpuBackend + ?Sized,
        T: TransformStore + ?Sized,
    {
        if self.pending_append_set.remove(&entity) {
            self.pending_appends.retain(|e| *e != entity);
            return Ok(Removal::DroppedPending);
        }

        let Some(slot) = self.slot_of.remove(&entity) else {
            return Ok(Removal::Absent);
        };
        self.pending_updates.remove(&entity);

        if let Some(handle) = self.buffer {
            self.upload(backend, handle, slot, bytemuck::bytes_of(&GpuTransform::DEGENERATE))?;
        }
        self.tombstone_count += 1;

        let mut compacted = false;
        if self.tombstone_count >= self.tombstone_limit && self.config.compaction == CompactionPolicy::Eager {
            self.reallocate_instances(backend, transforms)?;
            compacted = true;
        }

        Ok(Removal::Tombstoned { slot, compacted })
    }

    /// Mark a slotted entity's transform as stale
    ///
    /// Queued entities are ignored: their first upload reads the latest
    /// transform anyway. Repeated flags collapse into one.
    pub fn flag_instance_transform_update(&mut self, entity: Entity) -> bool {
        if self.slot_of.contains_key(&entity) {
            self.pending_updates.insert(entity);
            true
        } else {
            false
        }
    }

    /// Flush everything recorded since the last call to the GPU buffer
    ///
    /// Does nothing, not even allocate, when no work is pending.
    pub fn process_updates<B, T>(&mut self, backend: &mut B, transforms: &T) -> GpuResult<FlushReport>
    where
        B: GpuBackend + ?Sized,
        T: TransformStore + ?Sized,
    {
        let mut report = FlushReport::default();

        if self.tombstone_count >= self.tombstone_limit {
            self.reallocate_instances(backend, transforms)?;
            report.compacted = true;
        }

        if !self.pending_appends.is_empty() {
            report.appended = self.flush_appends(backend, transforms)?;
        }

        if !self.pending_updates.is_empty() {
            let (updated, runs) = self.flush_updates(backend, transforms)?;
            report.updated = updated;
            report.update_runs = runs;
        }

        if report != FlushReport::default() {
            log::trace!(
                "Group {}: {} appended, {} updated in {} writes",
                self.key,
                report.appended,
                report.updated,
                report.update_runs
            );
        }
        Ok(report)
    }

    /// Rebuild the buffer densely: live entities take slots `0..count` in their
    /// current slot order and the whole prefix is uploaded in one write
    pub fn reallocate_instances<B, T>(&mut self, backend: &mut B, transforms: &T) -> GpuResult<()>
    where
        B: GpuBackend + ?Sized,
        T: TransformStore + ?Sized,
    {
        let mut live: Vec<(u32, Entity)> = self.slot_of.iter().map(|(&e, &s)| (s, e)).collect();
        live.sort_unstable();

        let staging: Vec<GpuTransform> = live
            .iter()
            .map(|&(_, entity)| self.transform_of(transforms, entity))
            .collect();

        if let Some(handle) = self.buffer.filter(|_| !staging.is_empty()) {
            self.upload(backend, handle, 0, bytemuck::cast_slice(&staging))?;
        }

        for (new_slot, &(_, entity)) in (0u32..).zip(live.iter()) {
            self.slot_of.insert(entity, new_slot);
        }

        log::debug!(
            "Compacted group {}: {} live slots, {} tombstones reclaimed",
            self.key,
            live.len(),
            self.tombstone_count
        );

        self.used_slot_count = self.slot_of.len() as u32;
        self.tombstone_count = 0;
        // Every slotted transform was just re-read and uploaded
        self.pending_updates.clear();
        self.stats.compactions += 1;
        Ok(())
    }

    fn flush_appends<B, T>(&mut self, backend: &mut B, transforms: &T) -> GpuResult<u32>
    where
        B: GpuBackend + ?Sized,
        T: TransformStore + ?Sized,
    {
        let first_slot = self.used_slot_count;
        let count = self.pending_appends.len() as u32;
        let handle = self.ensure_capacity(backend, first_slot + count)?;

        let appends = std::mem::take(&mut self.pending_appends);
        self.pending_append_set.clear();

        let staging: Vec<GpuTransform> = appends
            .iter()
            .map(|&entity| self.transform_of(transforms, entity))
            .collect();
        self.upload(backend, handle, first_slot, bytemuck::cast_slice(&staging))?;

        for (slot, entity) in (first_slot..).zip(appends) {
            self.slot_of.insert(entity, slot);
        }
        self.used_slot_count = first_slot + count;
        Ok(count)
    }

    fn flush_updates<B, T>(&mut self, backend: &mut B, transforms: &T) -> GpuResult<(u32, u32)>
    where
        B: GpuBackend + ?Sized,
        T: TransformStore + ?Sized,
    {
        let flagged = std::mem::take(&mut self.pending_updates);
        let Some(handle) = self.buffer else {
            return Ok((0, 0));
        };

        let mut targets: Vec<(u32, Entity)> = flagged
            .into_iter()
            .filter_map(|entity| self.slot_of.get(&entity).map(|&slot| (slot, entity)))
            .collect();
        targets.sort_unstable();
        targets.dedup_by_key(|&mut (slot, _)| slot);

        let slots: Vec<u32> = targets.iter().map(|&(slot, _)| slot).collect();
        let runs = slot_runs(&slots);
        for run in &runs {
            let staging: Vec<GpuTransform> = targets[run.clone()]
                .iter()
                .map(|&(_, entity)| self.transform_of(transforms, entity))
                .collect();
            self.upload(backend, handle, slots[run.start], bytemuck::cast_slice(&staging))?;
        }

        Ok((targets.len() as u32, runs.len() as u32))
    }

    fn ensure_capacity<B>(&mut self, backend: &mut B, required_slots: u32) -> GpuResult<BufferHandle>
    where
        B: GpuBackend + ?Sized,
    {
        let handle = match self.buffer {
            Some(handle) => handle,
            None => {
                let slots = self.config.min_buffer_slots;
                let handle = backend.create_buffer(slot_bytes(slots))?;
                log::debug!("Group {} allocated {} with {} slots", self.key, handle, slots);
                self.buffer = Some(handle);
                self.capacity_slots = slots;
                handle
            }
        };

        if required_slots > self.capacity_slots {
            let grown = self.config.grown_capacity(required_slots);
            backend.resize_buffer(handle, slot_bytes(grown))?;
            log::debug!(
                "Group {} grew {} from {} to {} slots",
                self.key,
                handle,
                self.capacity_slots,
                grown
            );
            self.capacity_slots = grown;
            self.stats.resizes += 1;
        }

        Ok(handle)
    }

    fn upload<B>(&mut self, backend: &mut B, handle: BufferHandle, first_slot: u32, bytes: &[u8]) -> GpuResult<()>
    where
        B: GpuBackend + ?Sized,
    {
        backend.upload_range(handle, slot_bytes(first_slot), bytes)?;
        self.stats.range_uploads += 1;
        self.stats.bytes_uploaded += bytes.len() as u64;
        Ok(())
    }

    fn transform_of<T>(&self, transforms: &T, entity: Entity) -> GpuTransform
    where
        T: TransformStore + ?Sized,
    {
        match transforms.world_matrix(entity) {
            Some(matrix) => GpuTransform::from(&matrix),
            None => {
                log::warn!("{} in group {} has no transform, using identity", entity, self.key);
                GpuTransform::from(Mat4::identity())
            }
        }
    }

    /// Give the GPU buffer back to the backend
    ///
    /// Returns the released handle, or `None` if no buffer was ever allocated.
    pub fn release_buffer<B>(&mut self, backend: &mut B) -> Option<BufferHandle>
    where
        B: GpuBackend + ?Sized,
    {
        let handle = self.buffer.take()?;
        backend.release_buffer(handle);
        self.capacity_slots = 0;
        Some(handle)
    }

    /// Remove every entity, slotted ones first in slot order, then queued ones
    ///
    /// Slot bookkeeping resets; the buffer is kept.
    pub fn take_entities(&mut self) -> Vec<Entity> {
        let mut slotted: Vec<(u32, Entity)> = self.slot_of.drain().map(|(e, s)| (s, e)).collect();
        slotted.sort_unstable();

        let mut entities: Vec<Entity> = slotted.into_iter().map(|(_, e)| e).collect();
        entities.append(&mut self.pending_appends);

        self.pending_append_set.clear();
        self.pending_updates.clear();
        self.used_slot_count = 0;
        self.tombstone_count = 0;
        entities
    }

    /// Change the group's key without touching its slots or buffer
    ///
    /// Only valid when the new key draws the same mesh, so the transform
    /// layout stays meaningful.
    pub fn rekey(&mut self, key: InstanceKey) {
        debug_assert_eq!(self.key.mesh, key.mesh, "rekey must keep the mesh");
        self.key = key;
    }

    /// Key shared by every entity in this group
    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    /// GPU buffer holding the transforms, once allocated
    pub fn buffer_handle(&self) -> Option<BufferHandle> {
        self.buffer
    }

    /// Entities in the group, slotted or queued
    pub fn live_instance_count(&self) -> usize {
        self.slot_of.len() + self.pending_appends.len()
    }

    /// Instances a draw must cover: every slot up to the high-water mark,
    /// tombstones included
    pub fn draw_instance_count(&self) -> u32 {
        self.used_slot_count
    }

    /// Mesh drawn by this group
    pub fn mesh_asset(&self) -> MeshAssetId {
        self.key.mesh
    }

    /// Materials bound for this group's draw
    pub fn materials(&self) -> &[MaterialId] {
        &self.key.materials
    }

    /// Shader permutation used for this group's draw
    pub fn shader_variant(&self) -> ShaderVariantId {
        self.key.shader
    }

    /// Slot assigned to `entity`, if it has one
    pub fn slot_of(&self, entity: Entity) -> Option<u32> {
        self.slot_of.get(&entity).copied()
    }

    /// True if `entity` is slotted or queued here
    pub fn contains(&self, entity: Entity) -> bool {
        self.slot_of.contains_key(&entity) || self.pending_append_set.contains(&entity)
    }

    /// True if `entity` is waiting for a slot
    pub fn is_pending(&self, entity: Entity) -> bool {
        self.pending_append_set.contains(&entity)
    }

    /// Slotted and queued entities
    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.slot_of.keys().chain(self.pending_appends.iter()).copied()
    }

    /// True when the group holds no entity at all
    pub fn is_empty(&self) -> bool {
        self.live_instance_count() == 0
    }

    /// True when the next flush would touch the GPU
    pub fn has_pending_work(&self) -> bool {
        !self.pending_appends.is_empty()
            || !self.pending_updates.is_empty()
            || self.tombstone_count >= self.tombstone_limit
    }

    /// Slots handed out since the last compaction, tombstones included
    pub fn used_slot_count(&self) -> u32 {
        self.used_slot_count
    }

    /// Dead slots below the high-water mark
    pub fn tombstone_count(&self) -> u32 {
        self.tombstone_count
    }

    /// Tombstones tolerated before compaction
    pub fn tombstone_limit(&self) -> u32 {
        self.tombstone_limit
    }

    /// Allocated buffer size in slots
    pub fn capacity_slots(&self) -> u32 {
        self.capacity_slots
    }

    /// Cumulative GPU work
    pub fn stats(&self) -> GroupStats {
        self.stats
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let mut seen = HashSet::new();
        for (&entity, &slot) in &self.slot_of {
            assert!(slot < self.used_slot_count, "{} at slot {} >= used {}", entity, slot, self.used_slot_count);
            assert!(seen.insert(slot), "slot {} assigned twice", slot);
            assert!(!self.pending_append_set.contains(&entity), "{} both slotted and queued", entity);
        }
        assert_eq!(self.tombstone_count as usize, self.used_slot_count as usize - self.slot_of.len());
        assert_eq!(self.pending_appends.len(), self.pending_append_set.len());
        assert!(self.used_slot_count <= self.capacity_slots || (self.buffer.is_none() && self.used_slot_count == 0));
    }
}

fn slot_bytes(slots: u32) -> usize {
    slots as usize * TRANSFORM_STRIDE
}

/// Split sorted, distinct slots into maximal runs of consecutive values,
/// returned as index ranges into `slots`
pub(crate) fn slot_runs(slots: &[u32]) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    if slots.is_empty() {
        return runs;
    }
    let mut start = 0;
    for i in 1..=slots.len() {
        if i == slots.len() || slots[i] != slots[i - 1] + 1 {
            runs.push(start..i);
            start = i;
        }
    }
    runs
}
