use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

pub mod canonical;
pub mod compare;
pub mod config;
pub mod extract;
pub mod merge;
pub mod recipes;

pub use canonical::{canonicalize, display_name, generate_variants};
pub use compare::{compare_grocery_list, GroceryComparison, GroceryStatus};
pub use config::CategoryConfig;
pub use extract::parse_recognition_response;
pub use merge::{merge_observation, select_match, MergeAction, MergePlan};
pub use recipes::{
    classify_recipes, match_recipe, names_on_hand, MissingIngredient, RecipeFeasibility, RecipeMatch,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LarderError {
    #[error("malformed recognition response: {0}")]
    MalformedResponse(String),
    #[error("empty recognition response: {0}")]
    EmptyResponse(String),
    #[error("recognition service timed out: {0}")]
    UpstreamTimeout(String),
    #[error("recognition service returned HTTP {status}: {detail}")]
    UpstreamError { status: u16, detail: String },
    #[error("validation error: {0}")]
    Validation(String),
}

impl LarderError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedResponse(_) => "malformed_response",
            Self::EmptyResponse(_) => "empty_response",
            Self::UpstreamTimeout(_) => "upstream_timeout",
            Self::UpstreamError { .. } => "upstream_error",
            Self::Validation(_) => "validation",
        }
    }

    /// Only deadline overruns are worth retrying; every other kind will fail the same way.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamTimeout(_))
    }
}

macro_rules! ulid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(ItemId);
ulid_id!(GroceryId);
ulid_id!(RecipeId);

/// Normalized rectangle `[x, y, width, height]`, every component in `[0, 1]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    /// Build a box from four raw components, rejecting anything outside the unit square
    /// or with a non-positive extent.
    #[must_use]
    pub fn from_components(values: [f64; 4]) -> Option<Self> {
        if values.iter().any(|value| !value.is_finite() || !(0.0..=1.0).contains(value)) {
            return None;
        }
        let [x, y, width, height] = values;
        if width <= 0.0 || height <= 0.0 {
            return None;
        }
        Some(Self { x, y, width, height })
    }
}

/// One item extracted from a single recognition response, before canonicalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemObservation {
    pub name: String,
    pub quantity: u32,
    pub expires_in_days: u32,
    pub category: String,
    pub bounding_box: Option<BoundingBox>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventoryRecord {
    pub item_id: ItemId,
    pub display_name: String,
    /// `None` only for rows written before canonical keys existed.
    pub canonical_key: Option<String>,
    pub quantity: u32,
    pub expires_in_days: u32,
    pub category: String,
    pub image_ref: Option<String>,
    pub bounding_box: Option<BoundingBox>,
    #[serde(with = "time::serde::rfc3339")]
    pub detected_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroceryEntry {
    pub entry_id: GroceryId,
    pub display_name: String,
    pub quantity_needed: u32,
    pub category: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl GroceryEntry {
    /// Check the invariants enforced on user-created entries.
    ///
    /// # Errors
    /// Returns [`LarderError::Validation`] for a blank name or a zero quantity.
    pub fn validate(&self) -> Result<(), LarderError> {
        if self.display_name.trim().is_empty() {
            return Err(LarderError::Validation(
                "grocery display_name MUST be non-empty".to_string(),
            ));
        }
        if self.quantity_needed == 0 {
            return Err(LarderError::Validation(
                "grocery quantity_needed MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ingredient {
    pub name: String,
    #[serde(default)]
    pub quantity: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipe {
    pub recipe_id: RecipeId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub ingredients: Vec<Ingredient>,
}

impl Recipe {
    /// # Errors
    /// Returns [`LarderError::Validation`] when the title (the upsert key) or any ingredient
    /// name is blank.
    pub fn validate(&self) -> Result<(), LarderError> {
        if self.title.trim().is_empty() {
            return Err(LarderError::Validation("recipe title MUST be non-empty".to_string()));
        }
        if self.ingredients.iter().any(|ingredient| ingredient.name.trim().is_empty()) {
            return Err(LarderError::Validation(
                "recipe ingredient names MUST be non-empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lower-cased, trimmed form used by the comparison and recipe classifiers.
///
/// Deliberately looser than [`canonicalize`]: no punctuation stripping, no singularization.
#[must_use]
pub fn loose_name_key(name: &str) -> String {
    name.trim().to_lowercase()
}
