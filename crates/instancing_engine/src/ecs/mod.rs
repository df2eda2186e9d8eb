//! Entity-Component-System collaborator
//!
//! Only the slice of the ECS that instancing depends on: entities, the mesh
//! component, read-only store traits, and a world that records lifecycle
//! events.

pub mod component;
pub mod entity;
pub mod store;
pub mod world;

pub use component::MeshComponent;
pub use entity::Entity;
pub use store::{MeshComponentStore, SceneView, TransformStore};
pub use world::World;
