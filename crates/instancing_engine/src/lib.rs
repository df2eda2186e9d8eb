//! # Instancing Engine
//!
//! GPU-resident mesh instancing for a real-time 3D engine. Entities that share
//! a mesh, shader variant, and material list are drawn with one instanced draw
//! call from a packed transform buffer that is kept up to date incrementally.
//!
//! ## Features
//!
//! - **Slot allocation**: O(1) amortized insert and remove on a live GPU buffer
//! - **Tombstones**: removed slots are zeroed in place and reclaimed by
//!   periodic compaction
//! - **Coalesced uploads**: one range write per run of changed slots
//! - **Asset fallbacks**: deleted meshes and materials rebind to "missing"
//!   assets instead of breaking draws
//! - **Pluggable GPU**: all buffer traffic goes through [`render::backend::GpuBackend`]
//!
//! ## Quick Start
//!
//! ```rust
//! use instancing_engine::prelude::*;
//!
//! let mut world = World::new();
//! let assets = AssetCatalog::new();
//! let mut instancing = InstancingSystem::new(RecordingBackend::new(), InstancingConfig::default());
//!
//! for x in 0..3 {
//!     world.spawn(
//!         Transform::from_position(Vec3::new(x as f32, 0.0, 0.0)),
//!         MeshComponent::new(MISSING_MESH, vec![MISSING_MATERIAL]),
//!     );
//! }
//!
//! instancing.run_frame(world.drain_events(), &world, &assets)?;
//! assert_eq!(instancing.group_count(), 1);
//! assert_eq!(instancing.stats().live_instances, 3);
//! # Ok::<(), InstancingError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]
#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

pub mod assets;
pub mod config;
pub mod ecs;
pub mod events;
pub mod foundation;
pub mod render;

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        assets::{AssetCatalog, MaterialId, MeshAsset, MeshAssetId, ShaderVariantId, MISSING_MATERIAL, MISSING_MESH},
        config::{CompactionPolicy, Config, InstancingConfig},
        ecs::{Entity, MeshComponent, SceneView, TransformStore, World},
        events::{AssetEvent, ComponentEvent, ComponentEventKind, EventQueue, SceneEvent},
        foundation::math::{Mat4, Transform, Vec3},
        render::{
            backend::{BufferHandle, GpuBackend, GpuError, RecordingBackend},
            draw::DrawBatch,
            instancing::{InstanceGroup, InstanceKey, InstancingError, InstancingStats, InstancingSystem},
        },
    };
}
