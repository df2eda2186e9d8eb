//! ECS World implementation
//!
//! A deliberately small component store: entities carry at most one
//! [`Transform`] and one [`MeshComponent`]. Every mutation that the instancing
//! system cares about is recorded as a [`SceneEvent`] and kept until the frame
//! driver drains it.

use super::{Entity, MeshComponent, MeshComponentStore, TransformStore};
use crate::events::{AssetEvent, ComponentEvent, EventQueue, SceneEvent};
use crate::foundation::math::{Mat4, Transform};
use std::collections::HashMap;

/// ECS World containing all entities and components
pub struct World {
    next_entity_id: u32,
    entities: Vec<Entity>,
    transforms: HashMap<Entity, Transform>,
    meshes: HashMap<Entity, MeshComponent>,
    events: EventQueue<SceneEvent>,
}

impl World {
    /// Create a new world
    pub fn new() -> Self {
        Self {
            next_entity_id: 0,
            entities: Vec::new(),
            transforms: HashMap::new(),
            meshes: HashMap::new(),
            events: EventQueue::new(),
        }
    }

    /// Create a new entity
    pub fn create_entity(&mut self) -> Entity {
        let entity = Entity::new(self.next_entity_id);
        self.next_entity_id += 1;
        self.entities.push(entity);
        entity
    }

    /// Create an entity with a transform and a mesh
    pub fn spawn(&mut self, transform: Transform, mesh: MeshComponent) -> Entity {
        let entity = self.create_entity();
        self.set_transform(entity, transform);
        self.insert_mesh(entity, mesh);
        entity
    }

    /// Destroy an entity and all of its components
    pub fn despawn(&mut self, entity: Entity) -> bool {
        let Some(position) = self.entities.iter().position(|e| *e == entity) else {
            return false;
        };
        self.entities.swap_remove(position);

        if self.meshes.remove(&entity).is_some() {
            self.events.send(ComponentEvent::<MeshComponent>::deleted(entity));
        }
        if self.transforms.remove(&entity).is_some() {
            self.events.send(ComponentEvent::<Transform>::deleted(entity));
        }
        true
    }

    /// Set or replace an entity's transform
    pub fn set_transform(&mut self, entity: Entity, transform: Transform) {
        let event = if self.transforms.insert(entity, transform).is_some() {
            ComponentEvent::<Transform>::updated(entity)
        } else {
            ComponentEvent::<Transform>::added(entity)
        };
        self.events.send(event);
    }

    /// Modify an entity's transform in place
    ///
    /// Returns false if the entity has no transform.
    pub fn update_transform(&mut self, entity: Entity, update: impl FnOnce(&mut Transform)) -> bool {
        match self.transforms.get_mut(&entity) {
            Some(transform) => {
                update(transform);
                self.events.send(ComponentEvent::<Transform>::updated(entity));
                true
            }
            None => false,
        }
    }

    /// Get an entity's transform
    pub fn transform(&self, entity: Entity) -> Option<&Transform> {
        self.transforms.get(&entity)
    }

    /// Attach or replace an entity's mesh component
    pub fn insert_mesh(&mut self, entity: Entity, mesh: MeshComponent) {
        let event = if self.meshes.insert(entity, mesh).is_some() {
            ComponentEvent::<MeshComponent>::updated(entity)
        } else {
            ComponentEvent::<MeshComponent>::added(entity)
        };
        self.events.send(event);
    }

    /// Detach an entity's mesh component
    pub fn remove_mesh(&mut self, entity: Entity) -> Option<MeshComponent> {
        let removed = self.meshes.remove(&entity);
        if removed.is_some() {
            self.events.send(ComponentEvent::<MeshComponent>::deleted(entity));
        }
        removed
    }

    /// Forward an asset notification to this frame's event stream
    pub fn emit_asset_event(&mut self, event: AssetEvent) {
        self.events.send(event);
    }

    /// Take every event recorded since the last drain
    pub fn drain_events(&mut self) -> Vec<SceneEvent> {
        self.events.drain()
    }

    /// Get an iterator over all entities
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter()
    }

    /// Number of live entities
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformStore for World {
    fn world_matrix(&self, entity: Entity) -> Option<Mat4> {
        self.transforms.get(&entity).map(Transform::to_matrix)
    }
}

impl MeshComponentStore for World {
    fn mesh_component(&self, entity: Entity) -> Option<&MeshComponent> {
        self.meshes.get(&entity)
    }
}
