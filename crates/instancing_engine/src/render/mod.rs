//! Rendering side of instancing
//!
//! The GPU abstraction, the instance groups that own transform buffers, and
//! the draw batches built from them.

pub mod backend;
pub mod draw;
pub mod instancing;

pub use draw::DrawBatch;
