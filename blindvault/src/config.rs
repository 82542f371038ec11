//! Application configuration, read from `blindvault.toml`.
//!
//! ```toml
//! [rotation]
//! batch_size = 100
//! commit_retries = 1
//!
//! [search]
//! default_limit = 50
//!
//! [[fields]]
//! entity_type = "client"
//! field_name = "name"
//! indexed = true
//! ```

use crate::error::Error;
use crate::schema::{FieldRegistry, FieldSpec};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default number of records per rotation batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default maximum number of results returned by a search.
pub const DEFAULT_SEARCH_LIMIT: usize = 50;

/// Tuning for the key rotation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationOptions {
    /// Records read, re-encrypted and committed together.
    pub batch_size: usize,
    /// Extra commit attempts for a batch before it is counted as failed.
    pub commit_retries: u32,
}

impl Default for RotationOptions {
    fn default() -> Self {
        Self { batch_size: DEFAULT_BATCH_SIZE, commit_retries: 0 }
    }
}

impl RotationOptions {
    /// Checks the options for values the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `batch_size` is zero.
    pub fn validate(&self) -> Result<(), Error> {
        if self.batch_size == 0 {
            return Err(Error::Config("rotation batch_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Search behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    pub default_limit: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { default_limit: DEFAULT_SEARCH_LIMIT }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rotation: RotationOptions,
    #[serde(default)]
    pub search: SearchOptions,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl Config {
    /// Parses configuration from TOML text and validates it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the text is not valid TOML, does not match
    /// the expected shape, or fails validation.
    pub fn from_toml_str(text: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.rotation.validate()?;
        config.registry()?;
        Ok(config)
    }

    /// Reads and parses a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be read, or see
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Builds the field registry declared by `[[fields]]`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a field entry is invalid.
    pub fn registry(&self) -> Result<FieldRegistry, Error> {
        FieldRegistry::from_specs(&self.fields)
    }
}
