use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use larder_core::CategoryConfig;
use larder_vision::RecognizerConfig;
use serde::{Deserialize, Serialize};

/// Deployment settings shared by the service and the CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LarderConfig {
    pub categories: CategoryConfig,
    pub recognizer: RecognizerConfig,
}

impl LarderConfig {
    /// Load settings from an optional YAML file; absent file or sections fall back to defaults.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, is not valid YAML, or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_yaml(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error when the YAML does not parse or the settings are inconsistent.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config = if raw.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str::<Self>(raw).context("failed to parse YAML")?
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error when the category list or fallback category is unusable.
    pub fn validate(&self) -> Result<()> {
        self.categories.validate()?;
        Ok(())
    }
}
