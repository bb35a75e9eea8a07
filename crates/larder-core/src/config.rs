use serde::{Deserialize, Serialize};

use crate::LarderError;

const DEFAULT_CATEGORIES: [&str; 15] = [
    "produce",
    "dairy",
    "meat",
    "drinks",
    "leftovers",
    "condiments",
    "frozen",
    "bakery",
    "snacks",
    "beverages",
    "seafood",
    "poultry",
    "grains",
    "spices",
    "other",
];

/// Supported item categories for one deployment plus the fallback for anything else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CategoryConfig {
    pub supported: Vec<String>,
    pub default_category: String,
}

impl Default for CategoryConfig {
    fn default() -> Self {
        Self {
            supported: DEFAULT_CATEGORIES.iter().map(ToString::to_string).collect(),
            default_category: "other".to_string(),
        }
    }
}

impl CategoryConfig {
    /// # Errors
    /// Returns [`LarderError::Validation`] when the list is empty or the fallback is not listed.
    pub fn validate(&self) -> Result<(), LarderError> {
        if self.supported.iter().all(|category| category.trim().is_empty()) {
            return Err(LarderError::Validation(
                "category list MUST contain at least one entry".to_string(),
            ));
        }
        if !self.is_supported(&self.default_category) {
            return Err(LarderError::Validation(format!(
                "default category `{}` MUST be one of the supported categories",
                self.default_category
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn is_supported(&self, category: &str) -> bool {
        let wanted = category.trim().to_lowercase();
        self.supported.iter().any(|candidate| candidate.trim().to_lowercase() == wanted)
    }

    /// Lower-case a raw category and fall back to the configured default when unknown.
    #[must_use]
    pub fn normalize(&self, raw: Option<&str>) -> String {
        let lowered = raw.map(|value| value.trim().to_lowercase()).unwrap_or_default();
        if !lowered.is_empty() && self.is_supported(&lowered) {
            lowered
        } else {
            self.default_category.trim().to_lowercase()
        }
    }
}
