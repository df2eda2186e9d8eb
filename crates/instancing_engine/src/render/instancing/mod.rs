//! Mesh instancing
//!
//! Entities are bucketed by [`InstanceKey`]. Each bucket is an
//! [`InstanceGroup`] with its own transform buffer, and the
//! [`InstancingSystem`] routes scene events to the right bucket.

pub mod group;
pub mod key;
pub mod stats;
pub mod system;
pub mod transform;

pub use group::{FlushReport, GroupStats, InstanceGroup, Removal};
pub use key::InstanceKey;
pub use stats::InstancingStats;
pub use system::{InstancingError, InstancingResult, InstancingSystem};
pub use transform::{GpuTransform, TRANSFORM_STRIDE};
