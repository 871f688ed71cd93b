//! # Minnesvakt Configuration
//!
//! Hierarchical configuration for the allocation subsystem: pool geometry
//! and ledger reserve sizing with validated defaults.
//!
//! ## Features
//! - **Unified Configuration**: single source of truth for all components
//! - **Validation**: runtime validation of critical parameters
//! - **Environment Awareness**: `MINNESVAKT_*` variables override files

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

mod error;
mod validation;

pub use error::ConfigError;

/// Fixed-block pool geometry.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
#[validate(schema(function = validation::validate_pool_geometry))]
pub struct PoolConfig {
    /// Size of one block in bytes (power of two).
    #[serde(default = "default_block_size")]
    #[validate(range(min = 16, max = 65536))]
    #[validate(custom(function = validation::validate_power_of_two))]
    pub block_size: usize,

    /// Total arena size in bytes.
    #[serde(default = "default_pool_size")]
    #[validate(range(min = 1024, max = 1073741824))]
    pub pool_size: usize,
}

fn default_block_size() -> usize {
    1024
}

fn default_pool_size() -> usize {
    1024 * 1024
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            pool_size: default_pool_size(),
        }
    }
}

/// Allocation ledger settings.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct LedgerConfig {
    /// Emergency reserve capacity in bytes, released once on exhaustion.
    #[serde(default = "default_reserve_size")]
    #[validate(range(min = 4096, max = 16777216))]
    pub reserve_size: usize,
}

fn default_reserve_size() -> usize {
    1024 * 1024
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            reserve_size: default_reserve_size(),
        }
    }
}

/// Top-level configuration container for all minnesvakt components.
#[derive(Debug, Serialize, Deserialize, Validate, Default)]
pub struct MinnesvaktConfig {
    /// Fixed-block pool geometry used by the driver scenarios.
    #[validate(nested)]
    pub pool: PoolConfig,

    /// Ledger reserve sizing.
    #[validate(nested)]
    pub ledger: LedgerConfig,
}

impl MinnesvaktConfig {
    /// Load configuration from default files and environment.
    ///
    /// Hierarchy:
    /// 1. Default values
    /// 2. `config/minnesvakt.yaml` - base settings. If missing, defaults are used.
    /// 3. `MINNESVAKT_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(MinnesvaktConfig::default()));

        if Path::new("config/minnesvakt.yaml").exists() {
            figment = figment.merge(Yaml::file("config/minnesvakt.yaml"));
        }

        figment
            .merge(Env::prefixed("MINNESVAKT_").split("__"))
            .extract()
            .map_err(ConfigError::from)
            .and_then(|config: Self| {
                config.validate()?;
                Ok(config)
            })
    }

    /// Load configuration from a specific path.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(PathBuf::from(path)));
        }

        Figment::from(Serialized::defaults(MinnesvaktConfig::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed("MINNESVAKT_").split("__"))
            .extract()
            .map_err(ConfigError::from)
            .and_then(|config: Self| {
                config.validate()?;
                Ok(config)
            })
    }
}
