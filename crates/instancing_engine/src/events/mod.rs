//! Scene event types and the per-frame event queue
//!
//! Lifecycle notifications are a closed set: mesh component changes, transform
//! changes, and asset invalidation. The world pushes them into an
//! [`EventQueue`] as they happen and the frame driver drains the queue once,
//! in emission order, before the instancing flush.

use crate::assets::{MaterialId, MeshAssetId};
use crate::ecs::{Entity, MeshComponent};
use crate::foundation::math::Transform;
use std::marker::PhantomData;

/// What happened to a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentEventKind {
    /// Component was attached to the entity
    Added,
    /// Component data changed
    Updated,
    /// Component was detached or the entity destroyed
    Deleted,
}

/// Lifecycle notification for one component of type `C`
#[derive(Debug)]
pub struct ComponentEvent<C> {
    /// Kind of change
    pub kind: ComponentEventKind,
    /// Entity owning the component
    pub entity: Entity,
    _component: PhantomData<fn() -> C>,
}

impl<C> ComponentEvent<C> {
    /// Create a new component event
    pub fn new(kind: ComponentEventKind, entity: Entity) -> Self {
        Self {
            kind,
            entity,
            _component: PhantomData,
        }
    }

    /// Shorthand for an `Added` event
    pub fn added(entity: Entity) -> Self {
        Self::new(ComponentEventKind::Added, entity)
    }

    /// Shorthand for an `Updated` event
    pub fn updated(entity: Entity) -> Self {
        Self::new(ComponentEventKind::Updated, entity)
    }

    /// Shorthand for a `Deleted` event
    pub fn deleted(entity: Entity) -> Self {
        Self::new(ComponentEventKind::Deleted, entity)
    }
}

// Manual impls: `C` is only a tag and need not be `Copy` or `Eq` itself.
impl<C> Clone for ComponentEvent<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for ComponentEvent<C> {}

impl<C> PartialEq for ComponentEvent<C> {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.entity == other.entity
    }
}

impl<C> Eq for ComponentEvent<C> {}

/// Asset lifecycle notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetEvent {
    /// Mesh asset finished loading and can be drawn
    MeshReady(MeshAssetId),
    /// Mesh asset was unloaded
    MeshDeleted(MeshAssetId),
    /// Material was deleted
    MaterialDeleted(MaterialId),
}

/// Every event the instancing system consumes
#[derive(Debug, Clone, PartialEq)]
pub enum SceneEvent {
    /// Mesh component lifecycle
    Mesh(ComponentEvent<MeshComponent>),
    /// Transform component lifecycle
    Transform(ComponentEvent<Transform>),
    /// Asset lifecycle
    Asset(AssetEvent),
}

impl From<ComponentEvent<MeshComponent>> for SceneEvent {
    fn from(event: ComponentEvent<MeshComponent>) -> Self {
        Self::Mesh(event)
    }
}

impl From<ComponentEvent<Transform>> for SceneEvent {
    fn from(event: ComponentEvent<Transform>) -> Self {
        Self::Transform(event)
    }
}

impl From<AssetEvent> for SceneEvent {
    fn from(event: AssetEvent) -> Self {
        Self::Asset(event)
    }
}

/// FIFO queue of events awaiting the next drain
#[derive(Debug)]
pub struct EventQueue<E> {
    pending: Vec<E>,
}

impl<E> EventQueue<E> {
    /// Create a new empty queue
    pub fn new() -> Self {
        Self { pending: Vec::new() }
    }

    /// Queue an event for this frame
    pub fn send(&mut self, event: impl Into<E>) {
        self.pending.push(event.into());
    }

    /// Take every queued event in emission order
    pub fn drain(&mut self) -> Vec<E> {
        std::mem::take(&mut self.pending)
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop all queued events (useful for state transitions)
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_preserves_emission_order() {
        let mut queue: EventQueue<SceneEvent> = EventQueue::new();
        let entity = Entity::new(7);

        queue.send(ComponentEvent::<MeshComponent>::added(entity));
        queue.send(ComponentEvent::<Transform>::updated(entity));
        queue.send(AssetEvent::MeshDeleted(MeshAssetId::new(3)));

        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        assert!(matches!(drained[0], SceneEvent::Mesh(e) if e.kind == ComponentEventKind::Added));
        assert!(matches!(drained[1], SceneEvent::Transform(e) if e.entity == entity));
        assert_eq!(drained[2], SceneEvent::Asset(AssetEvent::MeshDeleted(MeshAssetId::new(3))));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut queue: EventQueue<SceneEvent> = EventQueue::new();
        queue.send(AssetEvent::MaterialDeleted(MaterialId::new(1)));
        assert_eq!(queue.len(), 1);

        queue.clear();
        assert!(queue.drain().is_empty());
    }
}
