//! Tree configuration module.
//!
//! This module provides configuration loading for a tree from environment
//! variables.
//!
//! # Environment Variables
//!
//! - `BTREE_ORDER`: Branching parameter `m` of the tree (default: `2`)
//! - `BTREE_STORAGE_DIRECTORY`: Directory holding one record file per node
//!   (default: unset, meaning the tree is memory-only)
//!
//! # Invariants
//!
//! - `order` is always at least [`TreeConfig::MIN_ORDER`] once validated
//! - `storage_directory`, when present, is non-empty (it may not exist yet)

use std::path::PathBuf;

/// Tree configuration.
///
/// The comparison function is not part of the configuration; it is supplied
/// in code when the tree is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeConfig {
    /// Branching parameter `m`. Non-root nodes hold between `m - 1` and
    /// `2m - 1` keys.
    pub order: usize,
    /// Directory where node records are stored.
    /// `None` means the tree is memory-only and persistence is a no-op.
    pub storage_directory: Option<PathBuf>,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A configuration value is invalid.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            order: Self::DEFAULT_ORDER,
            storage_directory: None,
        }
    }
}

impl TreeConfig {
    /// Default branching parameter.
    pub const DEFAULT_ORDER: usize = 2;
    /// Smallest branching parameter for which split and merge are defined.
    pub const MIN_ORDER: usize = 2;

    const ORDER_VAR: &'static str = "BTREE_ORDER";
    const DIRECTORY_VAR: &'static str = "BTREE_STORAGE_DIRECTORY";

    /// Memory-only configuration with the given order.
    #[must_use]
    pub const fn memory(order: usize) -> Self {
        Self {
            order,
            storage_directory: None,
        }
    }

    /// Disk-backed configuration with the given order and directory.
    #[must_use]
    pub fn on_disk(order: usize, directory: impl Into<PathBuf>) -> Self {
        Self {
            order,
            storage_directory: Some(directory.into()),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `BTREE_ORDER` is set but not an integer, or smaller than 2
    /// - `BTREE_STORAGE_DIRECTORY` is set but empty
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            order: Self::load_order()?,
            storage_directory: Self::load_storage_directory()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants listed at module level.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_order(self.order)?;
        if self
            .storage_directory
            .as_ref()
            .is_some_and(|dir| dir.as_os_str().is_empty())
        {
            return Err(ConfigError::InvalidValue {
                name: Self::DIRECTORY_VAR.to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Load the order from environment.
    ///
    /// Returns the default if not set.
    fn load_order() -> Result<usize, ConfigError> {
        match std::env::var(Self::ORDER_VAR) {
            Ok(value) => value
                .trim()
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidValue {
                    name: Self::ORDER_VAR.to_string(),
                    message: format!("'{value}' is not a valid order"),
                }),
            Err(_) => Ok(Self::DEFAULT_ORDER),
        }
    }

    /// Load the storage directory from environment.
    fn load_storage_directory() -> Result<Option<PathBuf>, ConfigError> {
        match std::env::var(Self::DIRECTORY_VAR) {
            Ok(value) if value.is_empty() => Err(ConfigError::InvalidValue {
                name: Self::DIRECTORY_VAR.to_string(),
                message: "must not be empty".to_string(),
            }),
            Ok(value) => Ok(Some(PathBuf::from(value))),
            Err(_) => Ok(None),
        }
    }
}

/// Reject orders for which the occupancy bounds are meaningless.
pub(crate) fn validate_order(order: usize) -> Result<(), ConfigError> {
    if order < TreeConfig::MIN_ORDER {
        return Err(ConfigError::InvalidValue {
            name: TreeConfig::ORDER_VAR.to_string(),
            message: format!(
                "order {order} is below the minimum of {}",
                TreeConfig::MIN_ORDER
            ),
        });
    }
    Ok(())
}
