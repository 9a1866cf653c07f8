//! Engine configuration.
//!
//! Defaults can be overridden from a YAML document or from the
//! environment (`MESH_POLICY_PARALLEL`, `MESH_POLICY_PARALLEL_THRESHOLD`,
//! `MESH_POLICY_MAX_TREE_DEPTH`).

use std::env;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Tunables for loading and checking rule sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fan rule evaluation out over the rayon pool.
    #[serde(default = "default_parallel")]
    pub parallel: bool,

    /// Rule sets smaller than this are checked on the calling thread.
    #[serde(default = "default_parallel_threshold")]
    pub parallel_threshold: usize,

    /// Deepest conditions tree the parser accepts.
    #[serde(default = "default_max_tree_depth")]
    pub max_tree_depth: usize,
}

fn default_parallel() -> bool {
    true
}

fn default_parallel_threshold() -> usize {
    8
}

fn default_max_tree_depth() -> usize {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
            parallel_threshold: default_parallel_threshold(),
            max_tree_depth: default_max_tree_depth(),
        }
    }
}

impl EngineConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a config from YAML; missing keys take their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Defaults overridden by environment variables.
    ///
    /// Values that do not parse are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = env::var("MESH_POLICY_PARALLEL") {
            match v.to_lowercase().as_str() {
                "true" | "1" => config.parallel = true,
                "false" | "0" => config.parallel = false,
                _ => log::warn!("Ignoring MESH_POLICY_PARALLEL={}", v),
            }
        }
        if let Ok(v) = env::var("MESH_POLICY_PARALLEL_THRESHOLD") {
            match v.parse() {
                Ok(n) => config.parallel_threshold = n,
                Err(_) => log::warn!("Ignoring MESH_POLICY_PARALLEL_THRESHOLD={}", v),
            }
        }
        if let Ok(v) = env::var("MESH_POLICY_MAX_TREE_DEPTH") {
            match v.parse() {
                Ok(n) => config.max_tree_depth = n,
                Err(_) => log::warn!("Ignoring MESH_POLICY_MAX_TREE_DEPTH={}", v),
            }
        }

        config
    }

    /// Builder: enable or disable parallel checking.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Whether a rule set of `rule_count` rules should be fanned out.
    pub fn use_parallel(&self, rule_count: usize) -> bool {
        self.parallel && rule_count >= self.parallel_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.parallel);
        assert_eq!(config.parallel_threshold, 8);
        assert_eq!(config.max_tree_depth, 64);
    }

    #[test]
    fn test_from_yaml_partial() {
        let config = EngineConfig::from_yaml("parallel: false\n").unwrap();
        assert!(!config.parallel);
        assert_eq!(config.max_tree_depth, 64);
    }

    #[test]
    fn test_use_parallel_threshold() {
        let config = EngineConfig::default();
        assert!(!config.use_parallel(3));
        assert!(config.use_parallel(8));
        assert!(!config.with_parallel(false).use_parallel(100));
    }
}
