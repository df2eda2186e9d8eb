//! Configuration system
//!
//! The [`Config`] trait loads and saves any serde type as TOML or RON depending
//! on the file extension. [`InstancingConfig`] holds the tuning knobs for the
//! instance groups: initial buffer size, growth factor, the vertex budget that
//! derives each group's tombstone limit, and the compaction policy.

pub use serde::{Deserialize, Serialize};

/// Configuration trait
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;

        if path.ends_with(".toml") {
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else if path.ends_with(".ron") {
            ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else {
            Err(ConfigError::UnsupportedFormat(path.to_string()))
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = if path.ends_with(".toml") {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else if path.ends_with(".ron") {
            ron::ser::to_string_pretty(self, Default::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else {
            return Err(ConfigError::UnsupportedFormat(path.to_string()));
        };

        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Values parsed but out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// When a group that crossed its tombstone limit gets compacted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompactionPolicy {
    /// Compact inside the removal that reaches the limit
    #[default]
    Eager,
    /// Mark the group and compact at the start of the next flush
    Deferred,
}

/// Tuning parameters for instance groups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstancingConfig {
    /// Capacity, in slots, of a freshly allocated transform buffer
    pub min_buffer_slots: u32,

    /// Capacity multiplier applied to the required slot count on resize
    pub growth_factor: f32,

    /// Rendered vertices a group may waste on tombstones before compacting
    pub wasted_vertex_budget: u32,

    /// Lower bound for a derived tombstone limit
    pub min_tombstone_limit: u32,

    /// Upper bound for a derived tombstone limit
    pub max_tombstone_limit: u32,

    /// Compaction scheduling
    pub compaction: CompactionPolicy,
}

impl Default for InstancingConfig {
    fn default() -> Self {
        Self {
            min_buffer_slots: 16,
            growth_factor: 1.5,
            wasted_vertex_budget: 10_000,
            min_tombstone_limit: 1,
            max_tombstone_limit: 4096,
            compaction: CompactionPolicy::Eager,
        }
    }
}

impl Config for InstancingConfig {}

impl InstancingConfig {
    /// Set the compaction policy
    pub fn with_compaction(mut self, compaction: CompactionPolicy) -> Self {
        self.compaction = compaction;
        self
    }

    /// Set the initial buffer capacity in slots
    pub fn with_min_buffer_slots(mut self, slots: u32) -> Self {
        self.min_buffer_slots = slots;
        self
    }

    /// Check that every value is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_buffer_slots == 0 {
            return Err(ConfigError::Invalid("min_buffer_slots must be at least 1".to_string()));
        }
        if self.growth_factor.is_nan() || self.growth_factor <= 1.0 {
            return Err(ConfigError::Invalid(format!(
                "growth_factor must be greater than 1.0, got {}",
                self.growth_factor
            )));
        }
        if self.min_tombstone_limit == 0 {
            return Err(ConfigError::Invalid("min_tombstone_limit must be at least 1".to_string()));
        }
        if self.min_tombstone_limit > self.max_tombstone_limit {
            return Err(ConfigError::Invalid(format!(
                "min_tombstone_limit ({}) exceeds max_tombstone_limit ({})",
                self.min_tombstone_limit, self.max_tombstone_limit
            )));
        }
        Ok(())
    }

    /// Derive how many dead slots a group tolerates for a mesh that renders
    /// `vertices_per_instance` vertices per instance
    ///
    /// Small meshes waste little per tombstone and so tolerate more of them.
    pub fn tombstone_limit_for(&self, vertices_per_instance: u32) -> u32 {
        let per_instance = vertices_per_instance.max(1);
        (self.wasted_vertex_budget / per_instance)
            .clamp(self.min_tombstone_limit, self.max_tombstone_limit)
    }

    /// Grow `required` slots by the growth factor, never below `required`
    pub fn grown_capacity(&self, required: u32) -> u32 {
        let grown = (f64::from(required) * f64::from(self.growth_factor)).ceil();
        // Saturating float-to-int cast
        (grown as u32).max(required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(InstancingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_non_growing_factor() {
        let config = InstancingConfig {
            growth_factor: 1.0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_limits() {
        let config = InstancingConfig {
            min_tombstone_limit: 10,
            max_tombstone_limit: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tombstone_limit_scales_with_mesh_size() {
        let config = InstancingConfig::default();

        assert_eq!(config.tombstone_limit_for(2_500), 4);
        assert_eq!(config.tombstone_limit_for(100), 100);
        // Huge meshes still get one tombstone before compacting
        assert_eq!(config.tombstone_limit_for(1_000_000), 1);
        // Tiny meshes hit the ceiling
        assert_eq!(config.tombstone_limit_for(1), 4096);
        assert_eq!(config.tombstone_limit_for(0), 4096);
    }

    #[test]
    fn test_grown_capacity() {
        let config = InstancingConfig::default();

        assert_eq!(config.grown_capacity(20), 30);
        assert_eq!(config.grown_capacity(17), 26);
        assert_eq!(config.grown_capacity(1), 2);
    }

    #[test]
    fn test_toml_round_trip_keeps_policy() {
        let config = InstancingConfig::default().with_compaction(CompactionPolicy::Deferred);
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: InstancingConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_ron_uses_defaults() {
        let parsed: InstancingConfig = ron::from_str("(min_buffer_slots: 64)").unwrap();
        assert_eq!(parsed.min_buffer_slots, 64);
        assert_eq!(parsed.compaction, CompactionPolicy::Eager);
    }

    #[test]
    fn test_unsupported_extension() {
        let result = InstancingConfig::default().save_to_file("instancing.json");
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }
}
