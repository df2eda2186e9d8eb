//! Specialized collection types

pub use slotmap::SlotMap;

slotmap::new_key_type! {
    /// Generation-checked handle to an instance group owned by the instancing system
    pub struct GroupId;
}
