//! Tree Configuration
//!
//! Each tree type declares, once, which strategy indexes it and how. Configs are
//! plain serde values so they can be built in code or read from a JSON document,
//! and they are validated eagerly before any strategy is constructed.
//!
//! ```rust
//! use arbor_core::config::{StrategyConfig, TreeConfig};
//!
//! let config: TreeConfig = serde_json::from_str(
//!     r#"{ "tree_type": "menu", "strategy": "materializedPath", "path_source": "slug" }"#,
//! ).unwrap();
//!
//! assert!(config.validate().is_ok());
//! assert!(matches!(config.strategy, StrategyConfig::MaterializedPath(_)));
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Default locking timeout for materialized-path trees
const DEFAULT_LOCKING_TIMEOUT_SECS: u64 = 3;

/// Longest accepted locking timeout (one day)
pub const MAX_LOCKING_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Configuration errors, raised before any tree is touched
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Tree type cannot be empty")]
    EmptyTreeType,

    #[error("Invalid option '{option}' for tree type '{tree_type}': {reason}")]
    InvalidOption {
        tree_type: String,
        option: &'static str,
        reason: String,
    },

    #[error("Tree type '{0}' is configured more than once")]
    DuplicateTreeType(String),

    #[error("Failed to parse tree configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    fn invalid(tree_type: &str, option: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            tree_type: tree_type.to_string(),
            option,
            reason: reason.into(),
        }
    }
}

/// Which indexing strategy a tree type uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    Nested,
    Closure,
    MaterializedPath,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::Nested => "nested",
            StrategyKind::Closure => "closure",
            StrategyKind::MaterializedPath => "materializedPath",
        };
        f.write_str(name)
    }
}

/// Configuration for one tree type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Tree type the configuration applies to
    pub tree_type: String,

    /// Strategy and its options
    #[serde(flatten)]
    pub strategy: StrategyConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy")]
pub enum StrategyConfig {
    #[serde(rename = "nested")]
    Nested(NestedSetConfig),

    #[serde(rename = "closure")]
    Closure(ClosureConfig),

    #[serde(rename = "materializedPath")]
    MaterializedPath(MaterializedPathConfig),
}

/// Nested-set options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NestedSetConfig {
    /// Every node records its root id and intervals restart at 1 per root.
    /// When false the whole forest shares one interval space.
    pub root_scoped: bool,
}

impl Default for NestedSetConfig {
    fn default() -> Self {
        Self { root_scoped: true }
    }
}

/// Closure-table options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosureConfig {
    /// Name of the closure table holding this tree's rows
    pub closure_table: String,
}

/// Materialized-path options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterializedPathConfig {
    /// Property the path segment is read from (`"id"` uses the node id)
    pub path_source: String,

    pub path_separator: String,

    pub path_starts_with_separator: bool,

    pub path_ends_with_separator: bool,

    /// Append `-<id>` to segments read from a property
    pub path_append_id: bool,

    /// Maintain a digest of the path for indexed lookups
    pub track_hash: bool,

    pub activate_locking: bool,

    /// Seconds after which a lock is considered stale
    pub locking_timeout: u64,
}

impl Default for MaterializedPathConfig {
    fn default() -> Self {
        Self {
            path_source: "id".to_string(),
            path_separator: ",".to_string(),
            path_starts_with_separator: false,
            path_ends_with_separator: true,
            path_append_id: false,
            track_hash: false,
            activate_locking: false,
            locking_timeout: DEFAULT_LOCKING_TIMEOUT_SECS,
        }
    }
}

impl TreeConfig {
    pub fn nested(tree_type: impl Into<String>) -> Self {
        Self {
            tree_type: tree_type.into(),
            strategy: StrategyConfig::Nested(NestedSetConfig::default()),
        }
    }

    pub fn closure(tree_type: impl Into<String>, closure_table: impl Into<String>) -> Self {
        Self {
            tree_type: tree_type.into(),
            strategy: StrategyConfig::Closure(ClosureConfig {
                closure_table: closure_table.into(),
            }),
        }
    }

    pub fn materialized_path(
        tree_type: impl Into<String>,
        options: MaterializedPathConfig,
    ) -> Self {
        Self {
            tree_type: tree_type.into(),
            strategy: StrategyConfig::MaterializedPath(options),
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self.strategy {
            StrategyConfig::Nested(_) => StrategyKind::Nested,
            StrategyConfig::Closure(_) => StrategyKind::Closure,
            StrategyConfig::MaterializedPath(_) => StrategyKind::MaterializedPath,
        }
    }

    /// Closure table name, for closure trees
    pub fn closure_table(&self) -> Option<&str> {
        match &self.strategy {
            StrategyConfig::Closure(closure) => Some(&closure.closure_table),
            _ => None,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tree_type.trim().is_empty() {
            return Err(ConfigError::EmptyTreeType);
        }

        match &self.strategy {
            StrategyConfig::Nested(_) => Ok(()),
            StrategyConfig::Closure(closure) => {
                if closure.closure_table.trim().is_empty() {
                    return Err(ConfigError::invalid(
                        &self.tree_type,
                        "closure_table",
                        "closure table name cannot be empty",
                    ));
                }
                Ok(())
            }
            StrategyConfig::MaterializedPath(path) => path.validate(&self.tree_type),
        }
    }
}

impl MaterializedPathConfig {
    fn validate(&self, tree_type: &str) -> Result<(), ConfigError> {
        if self.path_source.trim().is_empty() {
            return Err(ConfigError::invalid(
                tree_type,
                "path_source",
                "path source cannot be empty",
            ));
        }

        if self.path_separator.is_empty() {
            return Err(ConfigError::invalid(
                tree_type,
                "path_separator",
                "separator cannot be empty",
            ));
        }

        if self.path_separator.trim().is_empty() {
            return Err(ConfigError::invalid(
                tree_type,
                "path_separator",
                "separator cannot be whitespace",
            ));
        }

        if self.path_append_id && self.path_separator.contains('-') {
            return Err(ConfigError::invalid(
                tree_type,
                "path_separator",
                "'-' is reserved for appended ids",
            ));
        }

        if self.activate_locking && self.locking_timeout == 0 {
            return Err(ConfigError::invalid(
                tree_type,
                "locking_timeout",
                "must be greater than 0 when locking is active",
            ));
        }

        if self.locking_timeout > MAX_LOCKING_TIMEOUT_SECS {
            return Err(ConfigError::invalid(
                tree_type,
                "locking_timeout",
                format!("must not exceed {} seconds", MAX_LOCKING_TIMEOUT_SECS),
            ));
        }

        Ok(())
    }
}

/// Validated configurations, keyed by tree type
#[derive(Debug, Clone, Default)]
pub struct TreeRegistry {
    configs: HashMap<String, TreeConfig>,
}

impl TreeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configurations, validating each one
    pub fn from_configs(
        configs: impl IntoIterator<Item = TreeConfig>,
    ) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for config in configs {
            registry.register(config)?;
        }
        Ok(registry)
    }

    /// Parse a JSON array of tree configurations
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let configs: Vec<TreeConfig> = serde_json::from_str(json)?;
        Self::from_configs(configs)
    }

    pub fn register(&mut self, config: TreeConfig) -> Result<(), ConfigError> {
        config.validate()?;
        if self.configs.contains_key(&config.tree_type) {
            return Err(ConfigError::DuplicateTreeType(config.tree_type));
        }
        self.configs.insert(config.tree_type.clone(), config);
        Ok(())
    }

    pub fn get(&self, tree_type: &str) -> Option<&TreeConfig> {
        self.configs.get(tree_type)
    }

    pub fn tree_types(&self) -> impl Iterator<Item = &str> {
        self.configs.keys().map(|key| key.as_str())
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}
