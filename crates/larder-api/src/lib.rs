use std::path::PathBuf;

use anyhow::Result;
use larder_core::{
    canonicalize, classify_recipes, compare_grocery_list, match_recipe, names_on_hand,
    parse_recognition_response, GroceryComparison, GroceryEntry, GroceryId, Ingredient,
    InventoryRecord, ItemId, ItemObservation, MergeAction, MissingIngredient, Recipe,
    RecipeFeasibility, RecipeId,
};
use larder_store_sqlite::{SchemaStatus, SqliteStore};
use larder_vision::Recognizer;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod config;

pub use config::LarderConfig;

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Lookup miss on an explicit id or title.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{entity} not found: {id}")]
pub struct NotFound {
    pub entity: &'static str,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// How a scan relates to what is already stored.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Merge into the existing inventory.
    #[default]
    Accumulate,
    /// Clear the inventory first, then merge.
    Replace,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestScanRequest {
    pub raw_response: String,
    #[serde(default)]
    pub image_ref: Option<String>,
    #[serde(default)]
    pub mode: ScanMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanOutcome {
    pub action: MergeAction,
    pub item: InventoryRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanReport {
    pub mode: ScanMode,
    /// Rows removed before merging; always zero in accumulate mode.
    pub cleared_items: usize,
    pub observations: Vec<ItemObservation>,
    pub outcomes: Vec<ScanOutcome>,
    pub dropped_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageScan {
    pub image: Vec<u8>,
    pub mime_type: String,
    pub image_ref: Option<String>,
    pub mode: ScanMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddGroceryRequest {
    pub display_name: String,
    pub quantity_needed: u32,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpsertRecipeRequest {
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

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetQuantityRequest {
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MissingToGroceryRequest {
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MissingToGroceryResult {
    pub recipe_title: String,
    pub missing_ingredients: Vec<MissingIngredient>,
    pub added: Vec<GroceryEntry>,
    /// Missing ingredients already on the grocery list.
    pub skipped_names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LarderApi {
    db_path: PathBuf,
    config: LarderConfig,
}

impl LarderApi {
    #[must_use]
    pub fn new(db_path: PathBuf, config: LarderConfig) -> Self {
        Self { db_path, config }
    }

    #[must_use]
    pub fn config(&self) -> &LarderConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = SqliteStore::open(&self.db_path)?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = SqliteStore::open(&self.db_path)?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Parse one recognition response and merge every observation into the inventory.
    ///
    /// The response is validated before anything is written, so a malformed body leaves the
    /// inventory untouched even in replace mode. In accumulate mode each observation is merged
    /// in its own transaction, in response order; replace mode clears and merges the whole
    /// batch in one transaction.
    ///
    /// # Errors
    /// Returns a wrapped [`larder_core::LarderError::MalformedResponse`] for an unusable body,
    /// or a store error when a merge fails.
    pub fn ingest_scan(&self, request: &IngestScanRequest) -> Result<ScanReport> {
        let observations =
            parse_recognition_response(&request.raw_response, &self.config.categories)
                .inspect_err(|err| {
                    tracing::warn!(error = %err, "rejected recognition response");
                })?;

        let mut keyed = Vec::with_capacity(observations.len());
        let mut dropped_names = Vec::new();
        for observation in &observations {
            match canonicalize(&observation.name) {
                Some(canonical_key) => keyed.push((observation.clone(), canonical_key)),
                None => {
                    tracing::warn!(name = %observation.name, "dropping item without a usable name");
                    dropped_names.push(observation.name.clone());
                }
            }
        }

        let mut store = self.open_store()?;
        let image_ref = request.image_ref.as_deref();
        let (cleared_items, plans) = match request.mode {
            ScanMode::Accumulate => {
                let mut plans = Vec::with_capacity(keyed.len());
                for (observation, canonical_key) in &keyed {
                    plans.push(store.merge_observation(observation, canonical_key, image_ref)?);
                }
                (0, plans)
            }
            ScanMode::Replace => store.replace_inventory(&keyed, image_ref)?,
        };
        let outcomes = plans
            .into_iter()
            .map(|plan| ScanOutcome { action: plan.action, item: plan.record })
            .collect::<Vec<_>>();

        let inserted =
            outcomes.iter().filter(|outcome| outcome.action == MergeAction::Inserted).count();
        tracing::info!(
            observations = observations.len(),
            inserted,
            updated = outcomes.len() - inserted,
            dropped = dropped_names.len(),
            cleared = cleared_items,
            "ingested scan"
        );

        Ok(ScanReport {
            mode: request.mode,
            cleared_items,
            observations,
            outcomes,
            dropped_names,
        })
    }

    /// Recognize one photo, then ingest the answer.
    ///
    /// # Errors
    /// Returns the recognizer's error unchanged (wrapped) or any [`Self::ingest_scan`] error.
    pub fn scan_image(&self, recognizer: &dyn Recognizer, scan: &ImageScan) -> Result<ScanReport> {
        tracing::debug!(bytes = scan.image.len(), mime_type = %scan.mime_type, "scanning image");
        let raw_response = recognizer.recognize(&scan.image, &scan.mime_type).inspect_err(|err| {
            tracing::warn!(error_kind = err.kind(), error = %err, "recognizer failed");
        })?;

        self.ingest_scan(&IngestScanRequest {
            raw_response,
            image_ref: scan.image_ref.clone(),
            mode: scan.mode,
        })
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_inventory(&self) -> Result<Vec<InventoryRecord>> {
        self.open_store()?.list_inventory()
    }

    /// Overwrite one item's quantity.
    ///
    /// # Errors
    /// Returns [`NotFound`] when the item does not exist.
    pub fn set_quantity(&self, item_id: ItemId, quantity: u32) -> Result<InventoryRecord> {
        let mut store = self.open_store()?;
        store
            .set_quantity(item_id, quantity)?
            .ok_or_else(|| NotFound { entity: "inventory item", id: item_id.to_string() }.into())
    }

    /// # Errors
    /// Returns [`NotFound`] when the item does not exist.
    pub fn delete_item(&self, item_id: ItemId) -> Result<()> {
        let mut store = self.open_store()?;
        if store.delete_item(item_id)? {
            Ok(())
        } else {
            Err(NotFound { entity: "inventory item", id: item_id.to_string() }.into())
        }
    }

    /// Remove every inventory row, returning how many were deleted.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn reset_inventory(&self) -> Result<usize> {
        let cleared = self.open_store()?.reset_inventory()?;
        tracing::info!(cleared, "reset inventory");
        Ok(cleared)
    }

    /// # Errors
    /// Returns a wrapped [`larder_core::LarderError::Validation`] for a blank name or zero
    /// quantity.
    pub fn add_grocery_entry(&self, request: &AddGroceryRequest) -> Result<GroceryEntry> {
        let entry = GroceryEntry {
            entry_id: GroceryId::new(),
            display_name: request.display_name.trim().to_string(),
            quantity_needed: request.quantity_needed,
            category: self.config.categories.normalize(request.category.as_deref()),
            created_at: OffsetDateTime::now_utc(),
        };
        self.open_store()?.add_grocery_entry(&entry)?;
        Ok(entry)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_grocery_entries(&self) -> Result<Vec<GroceryEntry>> {
        self.open_store()?.list_grocery_entries()
    }

    /// # Errors
    /// Returns [`NotFound`] when the entry does not exist.
    pub fn delete_grocery_entry(&self, entry_id: GroceryId) -> Result<()> {
        let mut store = self.open_store()?;
        if store.delete_grocery_entry(entry_id)? {
            Ok(())
        } else {
            Err(NotFound { entity: "grocery entry", id: entry_id.to_string() }.into())
        }
    }

    /// Compare the stored grocery list against the stored inventory.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn compare_grocery_list(&self) -> Result<GroceryComparison> {
        let store = self.open_store()?;
        let inventory = store.list_inventory()?;
        let groceries = store.list_grocery_entries()?;
        Ok(compare_grocery_list(&inventory, &groceries))
    }

    /// Insert a recipe, or replace the one with the same title while keeping its id.
    ///
    /// # Errors
    /// Returns a wrapped [`larder_core::LarderError::Validation`] for a blank title or a blank
    /// ingredient name.
    pub fn upsert_recipe(&self, request: UpsertRecipeRequest) -> Result<Recipe> {
        let recipe = Recipe {
            recipe_id: RecipeId::new(),
            title: request.title,
            description: request.description,
            instructions: request.instructions,
            category: request.category,
            image_url: request.image_url,
            ingredients: request.ingredients,
        };
        self.open_store()?.upsert_recipe(&recipe)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_recipes(&self) -> Result<Vec<Recipe>> {
        self.open_store()?.list_recipes()
    }

    /// # Errors
    /// Returns [`NotFound`] when no recipe carries this title.
    pub fn recipe_by_title(&self, title: &str) -> Result<Recipe> {
        self.open_store()?
            .get_recipe_by_title(title)?
            .ok_or_else(|| NotFound { entity: "recipe", id: title.trim().to_string() }.into())
    }

    /// Sort stored recipes into fully and almost makeable against the stored inventory.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn recipe_feasibility(&self) -> Result<RecipeFeasibility> {
        let store = self.open_store()?;
        let inventory = store.list_inventory()?;
        let recipes = store.list_recipes()?;
        Ok(classify_recipes(&inventory, &recipes))
    }

    /// Put every ingredient one recipe is missing onto the grocery list.
    ///
    /// Names already on the list are skipped, compared case- and whitespace-insensitively.
    ///
    /// # Errors
    /// Returns [`NotFound`] for an unknown title, or a store error.
    pub fn missing_to_grocery(&self, title: &str) -> Result<MissingToGroceryResult> {
        let mut store = self.open_store()?;
        let recipe = store
            .get_recipe_by_title(title)?
            .ok_or_else(|| NotFound { entity: "recipe", id: title.trim().to_string() })?;
        let inventory = store.list_inventory()?;
        let matched = match_recipe(&names_on_hand(&inventory), &recipe);

        let created_at = OffsetDateTime::now_utc();
        let category = self.config.categories.normalize(None);
        let candidates = matched
            .missing_ingredients
            .iter()
            .map(|missing| GroceryEntry {
                entry_id: GroceryId::new(),
                display_name: missing.name.trim().to_string(),
                quantity_needed: missing.quantity_needed.max(1),
                category: category.clone(),
                created_at,
            })
            .collect::<Vec<_>>();
        let added = store.add_grocery_entries_if_absent(&candidates)?;

        let skipped_names = candidates
            .iter()
            .filter(|candidate| !added.iter().any(|entry| entry.entry_id == candidate.entry_id))
            .map(|candidate| candidate.display_name.clone())
            .collect::<Vec<_>>();
        tracing::info!(
            recipe = %recipe.title,
            added = added.len(),
            skipped = skipped_names.len(),
            "added missing ingredients to grocery list"
        );

        Ok(MissingToGroceryResult {
            recipe_title: recipe.title,
            missing_ingredients: matched.missing_ingredients,
            added,
            skipped_names,
        })
    }
}

#[cfg(test)]
mod tests {
    use larder_core::LarderError;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("larder-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_api() -> LarderApi {
        LarderApi::new(unique_temp_db_path(), LarderConfig::default())
    }

    fn ingest(api: &LarderApi, raw: &str, mode: ScanMode) -> Result<ScanReport> {
        api.ingest_scan(&IngestScanRequest {
            raw_response: raw.to_string(),
            image_ref: Some("fridge.jpg".to_string()),
            mode,
        })
    }

    fn quantity_of(inventory: &[InventoryRecord], display: &str) -> Option<u32> {
        inventory.iter().find(|record| record.display_name == display).map(|record| record.quantity)
    }

    fn ingredient(name: &str, quantity: Option<u32>) -> Ingredient {
        Ingredient { name: name.to_string(), quantity }
    }

    fn recipe_request(title: &str, ingredients: Vec<Ingredient>) -> UpsertRecipeRequest {
        UpsertRecipeRequest {
            title: title.to_string(),
            description: String::new(),
            instructions: String::new(),
            category: "dessert".to_string(),
            image_url: None,
            ingredients,
        }
    }

    #[test]
    fn repeated_scans_accumulate_under_one_identity() -> Result<()> {
        let api = test_api();
        let first = ingest(&api, r#"{"items":[{"name":"Apple","quantity":3}]}"#, ScanMode::Accumulate)?;
        assert_eq!(first.outcomes[0].action, MergeAction::Inserted);

        let second = ingest(
            &api,
            "```json\n{\"items\":[{\"name\":\"apples\",\"quantity\":2,\"category\":\"Produce\"}]}\n```",
            ScanMode::Accumulate,
        )?;
        assert_eq!(second.outcomes[0].action, MergeAction::Updated);
        assert_eq!(second.outcomes[0].item.item_id, first.outcomes[0].item.item_id);

        let inventory = api.list_inventory()?;
        assert_eq!(inventory.len(), 1);
        assert_eq!(quantity_of(&inventory, "Apples"), Some(5));
        assert_eq!(inventory[0].category, "produce");
        Ok(())
    }

    #[test]
    fn replace_mode_clears_before_merging() -> Result<()> {
        let api = test_api();
        ingest(&api, r#"{"items":[{"name":"Milk","quantity":1},{"name":"Eggs","quantity":6}]}"#, ScanMode::Accumulate)?;

        let report = ingest(&api, r#"{"items":[{"name":"Milk","quantity":2}]}"#, ScanMode::Replace)?;
        assert_eq!(report.cleared_items, 2);
        assert_eq!(report.outcomes[0].action, MergeAction::Inserted);

        let inventory = api.list_inventory()?;
        assert_eq!(inventory.len(), 1);
        assert_eq!(quantity_of(&inventory, "Milk"), Some(2));
        Ok(())
    }

    #[test]
    fn replace_mode_merges_duplicates_within_the_batch() -> Result<()> {
        let api = test_api();
        ingest(&api, r#"{"items":[{"name":"Bread","quantity":1}]}"#, ScanMode::Accumulate)?;

        let report = ingest(
            &api,
            r#"{"items":[{"name":"Egg","quantity":6},{"name":"eggs","quantity":6}]}"#,
            ScanMode::Replace,
        )?;
        assert_eq!(report.cleared_items, 1);
        assert_eq!(report.outcomes[0].action, MergeAction::Inserted);
        assert_eq!(report.outcomes[1].action, MergeAction::Updated);

        let inventory = api.list_inventory()?;
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[0].quantity, 12);
        Ok(())
    }

    #[test]
    fn malformed_response_leaves_inventory_untouched() -> Result<()> {
        let api = test_api();
        ingest(&api, r#"{"items":[{"name":"Milk","quantity":1}]}"#, ScanMode::Accumulate)?;

        let Err(err) = ingest(&api, "I could not see anything useful.", ScanMode::Replace) else {
            panic!("prose without JSON should be rejected");
        };
        assert!(matches!(
            err.downcast_ref::<LarderError>(),
            Some(LarderError::MalformedResponse(_))
        ));
        assert_eq!(quantity_of(&api.list_inventory()?, "Milk"), Some(1));
        Ok(())
    }

    #[test]
    fn names_without_usable_characters_are_dropped_and_reported() -> Result<()> {
        let api = test_api();
        let report = ingest(
            &api,
            r#"{"items":[{"name":"!!!","quantity":1},{"name":"Butter","quantity":1}]}"#,
            ScanMode::Accumulate,
        )?;
        assert_eq!(report.observations.len(), 2);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.dropped_names, vec!["!!!".to_string()]);
        Ok(())
    }

    #[test]
    fn scan_image_feeds_recognizer_text_into_ingestion() -> Result<()> {
        let api = test_api();
        let recognizer = |image: &[u8], mime_type: &str| {
            assert_eq!(image, b"jpeg-bytes");
            assert_eq!(mime_type, "image/jpeg");
            Ok::<_, LarderError>(r#"{"items":[{"name":"Yogurt","quantity":4}]}"#.to_string())
        };
        let report = api.scan_image(
            &recognizer,
            &ImageScan {
                image: b"jpeg-bytes".to_vec(),
                mime_type: "image/jpeg".to_string(),
                image_ref: None,
                mode: ScanMode::Accumulate,
            },
        )?;
        assert_eq!(report.outcomes[0].item.display_name, "Yogurt");
        assert_eq!(quantity_of(&api.list_inventory()?, "Yogurt"), Some(4));
        Ok(())
    }

    #[test]
    fn recognizer_failure_writes_nothing() -> Result<()> {
        let api = test_api();
        let recognizer = |_: &[u8], _: &str| {
            Err::<String, _>(LarderError::UpstreamTimeout("deadline of 30s exceeded".to_string()))
        };
        let Err(err) = api.scan_image(
            &recognizer,
            &ImageScan {
                image: vec![0_u8; 8],
                mime_type: "image/png".to_string(),
                image_ref: None,
                mode: ScanMode::Replace,
            },
        ) else {
            panic!("recognizer timeout should surface");
        };
        assert!(err.downcast_ref::<LarderError>().is_some_and(LarderError::is_retryable));
        assert!(api.list_inventory()?.is_empty());
        Ok(())
    }

    #[test]
    fn inventory_edits_report_missing_items() -> Result<()> {
        let api = test_api();
        let report = ingest(&api, r#"{"items":[{"name":"Cheese","quantity":2}]}"#, ScanMode::Accumulate)?;
        let item_id = report.outcomes[0].item.item_id;

        assert_eq!(api.set_quantity(item_id, 0)?.quantity, 0);
        api.delete_item(item_id)?;

        let Err(err) = api.delete_item(item_id) else {
            panic!("second delete should miss");
        };
        assert!(err.downcast_ref::<NotFound>().is_some());
        assert!(api.set_quantity(ItemId::new(), 1).is_err());
        Ok(())
    }

    #[test]
    fn grocery_comparison_uses_stored_state() -> Result<()> {
        let api = test_api();
        ingest(&api, r#"{"items":[{"name":"Milk","quantity":2}]}"#, ScanMode::Accumulate)?;
        let milk = api.add_grocery_entry(&AddGroceryRequest {
            display_name: " Milk ".to_string(),
            quantity_needed: 5,
            category: Some("DAIRY".to_string()),
        })?;
        assert_eq!(milk.display_name, "Milk");
        assert_eq!(milk.category, "dairy");
        let eggs = api.add_grocery_entry(&AddGroceryRequest {
            display_name: "Eggs".to_string(),
            quantity_needed: 12,
            category: Some("cereal".to_string()),
        })?;
        assert_eq!(eggs.category, "other");

        let comparison = api.compare_grocery_list()?;
        assert!(comparison.fully_satisfied.is_empty());
        assert_eq!(comparison.partially_satisfied.len(), 1);
        assert_eq!(comparison.partially_satisfied[0].quantity_available, 2);
        assert_eq!(comparison.missing.len(), 1);

        api.delete_grocery_entry(eggs.entry_id)?;
        assert_eq!(api.list_grocery_entries()?.len(), 1);
        Ok(())
    }

    #[test]
    fn zero_quantity_grocery_entry_is_a_validation_error() {
        let api = test_api();
        let result = api.add_grocery_entry(&AddGroceryRequest {
            display_name: "Bread".to_string(),
            quantity_needed: 0,
            category: None,
        });
        let Err(err) = result else {
            panic!("zero quantity should be rejected");
        };
        assert!(matches!(err.downcast_ref::<LarderError>(), Some(LarderError::Validation(_))));
    }

    #[test]
    fn recipes_classify_and_feed_the_grocery_list() -> Result<()> {
        let api = test_api();
        ingest(
            &api,
            r#"{"items":[{"name":"Eggs","quantity":6},{"name":"Milk","quantity":1}]}"#,
            ScanMode::Accumulate,
        )?;
        api.upsert_recipe(recipe_request(
            "Custard",
            vec![ingredient("eggs", None), ingredient("milk", None), ingredient("sugar", Some(2))],
        ))?;
        api.upsert_recipe(recipe_request(
            "Omelette",
            vec![ingredient("Eggs", None), ingredient("Milk", None)],
        ))?;

        let feasibility = api.recipe_feasibility()?;
        assert_eq!(feasibility.fully_makeable.len(), 1);
        assert_eq!(feasibility.fully_makeable[0].recipe.title, "Omelette");
        assert_eq!(feasibility.almost_makeable.len(), 1);

        api.add_grocery_entry(&AddGroceryRequest {
            display_name: "SUGAR".to_string(),
            quantity_needed: 1,
            category: None,
        })?;
        let result = api.missing_to_grocery("Custard")?;
        assert!(result.added.is_empty());
        assert_eq!(result.skipped_names, vec!["sugar".to_string()]);
        assert_eq!(result.missing_ingredients[0].quantity_needed, 2);
        Ok(())
    }

    #[test]
    fn blank_ingredient_names_are_rejected_before_storage() -> Result<()> {
        let api = test_api();
        let Err(err) = api.upsert_recipe(recipe_request(
            "Toast",
            vec![ingredient("bread", None), ingredient(" ", Some(1))],
        )) else {
            panic!("blank ingredient name should be rejected");
        };
        assert!(matches!(err.downcast_ref::<LarderError>(), Some(LarderError::Validation(_))));
        assert!(api.list_recipes()?.is_empty());
        Ok(())
    }

    #[test]
    fn missing_to_grocery_adds_entries_with_default_category() -> Result<()> {
        let api = test_api();
        api.upsert_recipe(recipe_request(
            "Pancakes",
            vec![ingredient("flour", Some(3)), ingredient("eggs", None)],
        ))?;

        let result = api.missing_to_grocery(" Pancakes ")?;
        assert_eq!(result.added.len(), 2);
        assert!(result.added.iter().all(|entry| entry.category == "other"));
        assert!(result.added.iter().any(|entry| entry.display_name == "eggs" && entry.quantity_needed == 1));

        let again = api.missing_to_grocery("Pancakes")?;
        assert!(again.added.is_empty());
        assert_eq!(api.list_grocery_entries()?.len(), 2);

        let Err(err) = api.missing_to_grocery("Waffles") else {
            panic!("unknown recipe should miss");
        };
        assert!(err.downcast_ref::<NotFound>().is_some());
        Ok(())
    }

    #[test]
    fn migrate_dry_run_reports_pending_versions() -> Result<()> {
        let api = test_api();
        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.would_apply_versions, vec![1, 2]);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(2));
        assert_eq!(applied.up_to_date, Some(true));
        assert!(api.schema_status()?.pending_versions.is_empty());
        Ok(())
    }
}
