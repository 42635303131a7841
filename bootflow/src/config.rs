//! Simulation configuration
//!
//! Loaded from TOML, e.g.:
//!
//! ```toml
//! max_steps = 5000
//! supported_algorithms = ["sha1", "sha256"]
//! tpm_pcr_count = 24
//! ```

use crate::hash::HashAlgorithm;
use crate::tpm::{Tpm, PCR_COUNT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Knobs of a simulation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Maximum number of steps the driver executes before giving up
    pub max_steps: usize,
    /// PCR banks of the simulated TPM
    pub supported_algorithms: Vec<HashAlgorithm>,
    pub tpm_pcr_count: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            max_steps: 10_000,
            supported_algorithms: vec![HashAlgorithm::Sha1, HashAlgorithm::Sha256],
            tpm_pcr_count: PCR_COUNT,
        }
    }
}

impl SimulationConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_steps == 0 {
            return Err(ConfigError::Invalid("max_steps must be positive".into()));
        }
        if self.supported_algorithms.is_empty() {
            return Err(ConfigError::Invalid("at least one PCR bank is required".into()));
        }
        if self.tpm_pcr_count == 0 || self.tpm_pcr_count > PCR_COUNT {
            return Err(ConfigError::Invalid(format!(
                "tpm_pcr_count must be within 1..={}",
                PCR_COUNT
            )));
        }
        Ok(())
    }

    /// A fresh, uninitialised TPM with the configured banks
    pub fn new_tpm(&self) -> Tpm {
        Tpm::new(self.supported_algorithms.clone(), self.tpm_pcr_count)
    }
}
