//! Search bounds for PCR reproduction
//!
//! ```toml
//! max_bit_distance = 2
//! max_disabled_measurements = 1
//! max_reorders = 1
//! localities = [0, 3]
//! parallel = true
//!
//! [correction]
//! kind = "artifact"
//! artifact = "registers"
//! range = { offset = 0, length = 8 }
//! ```

use bootflow::tpm::MAX_LOCALITY;
use bootflow::{ArtifactKind, ConfigError, Range};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Byte window whose bits the search may flip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorrectionTarget {
    /// Range inside the pre-image of one command-log entry
    Window { entry: usize, range: Range },
    /// Native range of an artifact, located through pre-image segments
    Artifact { artifact: ArtifactKind, range: Range },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReproduceSettings {
    /// Maximum number of bits flipped inside the correction window
    pub max_bit_distance: usize,
    /// Maximum number of measurements treated as never having happened
    pub max_disabled_measurements: usize,
    /// Maximum number of adjacent extend swaps
    pub max_reorders: usize,
    /// Startup localities tried besides the recorded one
    pub localities: Vec<u8>,
    pub correction: Option<CorrectionTarget>,
    /// Evaluate bit-flip candidates on the rayon thread pool
    pub parallel: bool,
}

impl Default for ReproduceSettings {
    fn default() -> Self {
        Self {
            max_bit_distance: 2,
            max_disabled_measurements: 1,
            max_reorders: 1,
            localities: vec![0, 3],
            correction: None,
            parallel: false,
        }
    }
}

impl ReproduceSettings {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(bad) = self.localities.iter().find(|l| **l > MAX_LOCALITY) {
            return Err(ConfigError::Invalid(format!(
                "locality {} out of range 0..={}",
                bad, MAX_LOCALITY
            )));
        }
        let window = match &self.correction {
            Some(CorrectionTarget::Window { range, .. }) | Some(CorrectionTarget::Artifact { range, .. }) => {
                Some(range)
            }
            None => None,
        };
        if window.is_some_and(|r| r.is_empty()) {
            return Err(ConfigError::Invalid("correction window is empty".into()));
        }
        Ok(())
    }
}
