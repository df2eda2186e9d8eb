//! Instancing statistics

use super::group::GroupStats;
use std::fmt;

/// Snapshot of instancing state and cumulative GPU work
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstancingStats {
    /// Groups currently alive
    pub active_groups: usize,
    /// Entities across all groups, slotted or queued
    pub live_instances: usize,
    /// Tombstoned slots across all groups
    pub tombstones: u64,
    /// Instances covered by this frame's draws
    pub drawn_instances: u64,
    /// Groups created since start
    pub groups_created: u64,
    /// Groups destroyed since start
    pub groups_destroyed: u64,
    /// Compactions since start
    pub compactions: u64,
    /// Buffer resizes since start
    pub resizes: u64,
    /// Range writes since start
    pub range_uploads: u64,
    /// Bytes written since start
    pub bytes_uploaded: u64,
}

impl InstancingStats {
    pub(crate) fn add_gpu_work(&mut self, work: GroupStats) {
        self.compactions += work.compactions;
        self.resizes += work.resizes;
        self.range_uploads += work.range_uploads;
        self.bytes_uploaded += work.bytes_uploaded;
    }

    /// Fraction of drawn instances that are tombstones
    pub fn waste_ratio(&self) -> f32 {
        if self.drawn_instances == 0 {
            0.0
        } else {
            self.tombstones as f32 / self.drawn_instances as f32
        }
    }
}

impl fmt::Display for InstancingStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} groups, {} instances ({} tombstones), {} uploads / {} bytes, {} compactions, {} resizes",
            self.active_groups,
            self.live_instances,
            self.tombstones,
            self.range_uploads,
            self.bytes_uploaded,
            self.compactions,
            self.resizes
        )
    }
}
