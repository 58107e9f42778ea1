//! Configuration loading and validation.

mod types;
mod validation;

pub use crate::channel::tls::SslMode;
pub use types::*;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Smallest batch size accepted.
pub const MIN_BATCH_SIZE: usize = 10;

/// Largest batch size accepted.
pub const MAX_BATCH_SIZE: usize = 500;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// SHA256 fingerprint of the configuration, password excluded.
    pub fn hash(&self) -> String {
        let mut redacted = self.clone();
        redacted.connection.password.clear();
        let yaml = serde_yaml::to_string(&redacted).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl ImportOptions {
    /// Validate the options on their own.
    pub fn validate(&self) -> Result<()> {
        validation::validate_options(self)
    }
}
