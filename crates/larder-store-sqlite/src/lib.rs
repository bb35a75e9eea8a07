use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use larder_core::{
    loose_name_key, select_match, BoundingBox, GroceryEntry, GroceryId,
    Ingredient, InventoryRecord, ItemId, ItemObservation, MergeAction, MergePlan, Recipe, RecipeId,
};
use rusqlite::{
    params, Connection, DatabaseName, OptionalExtension, TransactionBehavior,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::info;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS inventory_items (
  item_id TEXT PRIMARY KEY,
  display_name TEXT NOT NULL CHECK (length(trim(display_name)) > 0),
  quantity INTEGER NOT NULL CHECK (quantity >= 0),
  expires_in_days INTEGER NOT NULL CHECK (expires_in_days >= 0),
  category TEXT NOT NULL,
  image_ref TEXT,
  bounding_box_json TEXT,
  detected_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS grocery_entries (
  entry_id TEXT PRIMARY KEY,
  display_name TEXT NOT NULL CHECK (length(trim(display_name)) > 0),
  quantity_needed INTEGER NOT NULL CHECK (quantity_needed >= 1),
  category TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS recipes (
  recipe_id TEXT PRIMARY KEY,
  title TEXT NOT NULL UNIQUE CHECK (length(trim(title)) > 0),
  description TEXT NOT NULL DEFAULT '',
  instructions TEXT NOT NULL DEFAULT '',
  category TEXT NOT NULL DEFAULT '',
  image_url TEXT,
  ingredients_json TEXT NOT NULL DEFAULT '[]',
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_grocery_entries_created_at ON grocery_entries(created_at);
";

const MIGRATION_002_SQL: &str = r"
ALTER TABLE inventory_items ADD COLUMN canonical_key TEXT;
CREATE UNIQUE INDEX IF NOT EXISTS idx_inventory_items_canonical_key
  ON inventory_items(canonical_key);
CREATE INDEX IF NOT EXISTS idx_inventory_items_display_key
  ON inventory_items(lower(trim(display_name)));
";

const INVENTORY_COLUMNS: &str = "item_id, display_name, canonical_key, quantity, expires_in_days, \
     category, image_ref, bounding_box_json, detected_at";

const RECIPE_COLUMNS: &str =
    "recipe_id, title, description, instructions, category, image_url, ingredients_json";

const INVENTORY_EXPORT_FILE: &str = "inventory_items.ndjson";
const GROCERY_EXPORT_FILE: &str = "grocery_entries.ndjson";
const RECIPE_EXPORT_FILE: &str = "recipes.ndjson";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_items: usize,
    pub skipped_existing_items: usize,
    pub imported_grocery_entries: usize,
    pub skipped_existing_grocery_entries: usize,
    pub imported_recipes: usize,
    pub skipped_existing_recipes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed larder store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "inventory_items")? {
            apply_migration_1(&self.conn)?;
            info!(version = 1, "created base larder schema");
            return Ok(1);
        }

        if table_has_column(&self.conn, "inventory_items", "canonical_key")? {
            // Canonical keys already present but migration bookkeeping is missing.
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .context("failed to create missing v1 tables")?;
            record_schema_version(&self.conn, 1)?;
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }

        if table_has_column(&self.conn, "inventory_items", "display_name")? {
            // Pre-canonicalization inventory; upgrade through v2.
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .context("failed to create missing v1 tables")?;
            record_schema_version(&self.conn, 1)?;
            info!(version = 1, "adopted legacy inventory schema");
            return Ok(1);
        }

        Err(anyhow!(
            "database schema is invalid: inventory_items has neither display_name nor canonical_key"
        ))
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        if table_has_column(&self.conn, "inventory_items", "canonical_key")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(());
        }

        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;
        tx.execute_batch(MIGRATION_002_SQL).context("failed to add canonical_key column")?;
        let legacy_rows = tx
            .query_row("SELECT COUNT(*) FROM inventory_items", [], |row| row.get::<_, i64>(0))
            .context("failed to count legacy inventory rows")?;
        record_schema_version(&tx, 2)?;
        tx.commit().context("failed to commit migration v2")?;

        info!(version = 2, legacy_rows, "added canonical keys; legacy rows adopt one on next merge");
        Ok(())
    }

    /// Resolve one observation to at most one inventory row and write the merged result.
    ///
    /// Read and write happen inside one `IMMEDIATE` transaction, so concurrent merges of the
    /// same key from other connections serialize instead of losing quantity.
    ///
    /// # Errors
    /// Returns an error when the candidate lookup or the write fails.
    pub fn merge_observation(
        &mut self,
        observation: &ItemObservation,
        canonical_key: &str,
        image_ref: Option<&str>,
    ) -> Result<MergePlan> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start merge transaction")?;

        let plan = merge_in_transaction(&tx, observation, canonical_key, image_ref)?;
        tx.commit().context("failed to commit merge transaction")?;
        Ok(plan)
    }

    /// Clear the inventory and merge a whole batch in one `IMMEDIATE` transaction.
    ///
    /// Any failure rolls back the reset too, so the previous inventory survives intact.
    /// Returns the number of cleared rows and one plan per observation, in order.
    ///
    /// # Errors
    /// Returns an error when the reset, any merge, or the commit fails.
    pub fn replace_inventory(
        &mut self,
        observations: &[(ItemObservation, String)],
        image_ref: Option<&str>,
    ) -> Result<(usize, Vec<MergePlan>)> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start replace transaction")?;

        let cleared =
            tx.execute("DELETE FROM inventory_items", []).context("failed to reset inventory")?;
        let mut plans = Vec::with_capacity(observations.len());
        for (observation, canonical_key) in observations {
            plans.push(merge_in_transaction(&tx, observation, canonical_key, image_ref)?);
        }

        tx.commit().context("failed to commit replace transaction")?;
        Ok((cleared, plans))
    }

    /// Load the inventory ordered by display name.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn list_inventory(&self) -> Result<Vec<InventoryRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {INVENTORY_COLUMNS} FROM inventory_items
             ORDER BY display_name COLLATE NOCASE ASC, item_id ASC"
        ))?;
        let rows = stmt.query_map([], InventoryRow::from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get_item(&self, item_id: ItemId) -> Result<Option<InventoryRecord>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {INVENTORY_COLUMNS} FROM inventory_items WHERE item_id = ?1"),
                params![item_id.to_string()],
                InventoryRow::from_row,
            )
            .optional()
            .context("failed to load inventory item")?;
        row.map(InventoryRow::into_record).transpose()
    }

    /// Overwrite an item's quantity. Returns `None` when the item does not exist.
    ///
    /// # Errors
    /// Returns an error when the update or reload fails.
    pub fn set_quantity(&mut self, item_id: ItemId, quantity: u32) -> Result<Option<InventoryRecord>> {
        let changed = self
            .conn
            .execute(
                "UPDATE inventory_items SET quantity = ?2, detected_at = ?3 WHERE item_id = ?1",
                params![item_id.to_string(), quantity, now_rfc3339()?],
            )
            .context("failed to update inventory quantity")?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_item(item_id)
    }

    /// # Errors
    /// Returns an error when the delete statement fails.
    pub fn delete_item(&mut self, item_id: ItemId) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM inventory_items WHERE item_id = ?1", params![item_id.to_string()])
            .context("failed to delete inventory item")?;
        Ok(changed > 0)
    }

    /// Remove every inventory row and return how many were deleted.
    ///
    /// # Errors
    /// Returns an error when the delete statement fails.
    pub fn reset_inventory(&mut self) -> Result<usize> {
        self.conn.execute("DELETE FROM inventory_items", []).context("failed to reset inventory")
    }

    /// Persist one validated grocery entry.
    ///
    /// # Errors
    /// Returns an error when validation fails or the insert fails.
    pub fn add_grocery_entry(&mut self, entry: &GroceryEntry) -> Result<()> {
        entry.validate()?;
        insert_grocery_entry(&self.conn, entry)
    }

    /// Insert entries whose names are not already on the list, in one transaction.
    ///
    /// Names compare case- and whitespace-insensitively, against both stored entries and
    /// earlier entries in the same batch. Returns the entries actually inserted.
    ///
    /// # Errors
    /// Returns an error when any entry fails validation or a write fails.
    pub fn add_grocery_entries_if_absent(
        &mut self,
        entries: &[GroceryEntry],
    ) -> Result<Vec<GroceryEntry>> {
        for entry in entries {
            entry.validate()?;
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start grocery transaction")?;

        let mut present = {
            let mut stmt = tx.prepare("SELECT display_name FROM grocery_entries")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut names = HashSet::new();
            for row in rows {
                names.insert(loose_name_key(&row?));
            }
            names
        };

        let mut inserted = Vec::new();
        for entry in entries {
            if !present.insert(loose_name_key(&entry.display_name)) {
                continue;
            }
            insert_grocery_entry(&tx, entry)?;
            inserted.push(entry.clone());
        }

        tx.commit().context("failed to commit grocery transaction")?;
        Ok(inserted)
    }

    /// Load the grocery list in creation order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_grocery_entries(&self) -> Result<Vec<GroceryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT entry_id, display_name, quantity_needed, category, created_at
             FROM grocery_entries",
        )?;
        let mut rows = stmt.query([])?;
        let mut entries = Vec::new();

        while let Some(row) = rows.next()? {
            entries.push(GroceryEntry {
                entry_id: GroceryId(parse_ulid(&row.get::<_, String>(0)?)?),
                display_name: row.get(1)?,
                quantity_needed: row.get(2)?,
                category: row.get(3)?,
                created_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
            });
        }

        // RFC3339 text with trimmed fractions does not sort lexically.
        entries.sort_by(|lhs, rhs| {
            lhs.created_at.cmp(&rhs.created_at).then_with(|| lhs.entry_id.cmp(&rhs.entry_id))
        });
        Ok(entries)
    }

    /// # Errors
    /// Returns an error when the delete statement fails.
    pub fn delete_grocery_entry(&mut self, entry_id: GroceryId) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM grocery_entries WHERE entry_id = ?1",
                params![entry_id.to_string()],
            )
            .context("failed to delete grocery entry")?;
        Ok(changed > 0)
    }

    /// Insert or replace a recipe keyed on its trimmed title in a single statement.
    ///
    /// An existing recipe keeps its `recipe_id`; the returned value carries the stored id.
    ///
    /// # Errors
    /// Returns an error when validation, serialization, or the upsert fails.
    pub fn upsert_recipe(&mut self, recipe: &Recipe) -> Result<Recipe> {
        recipe.validate()?;
        let title = recipe.title.trim();
        let ingredients_json = serde_json::to_string(&recipe.ingredients)
            .context("failed to serialize recipe ingredients")?;

        let stored_id = self
            .conn
            .query_row(
                "INSERT INTO recipes(
                    recipe_id, title, description, instructions, category, image_url,
                    ingredients_json, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(title) DO UPDATE SET
                    description = excluded.description,
                    instructions = excluded.instructions,
                    category = excluded.category,
                    image_url = excluded.image_url,
                    ingredients_json = excluded.ingredients_json,
                    updated_at = excluded.updated_at
                RETURNING recipe_id",
                params![
                    recipe.recipe_id.to_string(),
                    title,
                    recipe.description,
                    recipe.instructions,
                    recipe.category,
                    recipe.image_url,
                    ingredients_json,
                    now_rfc3339()?,
                ],
                |row| row.get::<_, String>(0),
            )
            .with_context(|| format!("failed to upsert recipe `{title}`"))?;

        Ok(Recipe {
            recipe_id: RecipeId(parse_ulid(&stored_id)?),
            title: title.to_string(),
            ..recipe.clone()
        })
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_recipes(&self) -> Result<Vec<Recipe>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {RECIPE_COLUMNS} FROM recipes ORDER BY title ASC"))?;
        let rows = stmt.query_map([], RecipeRow::from_row)?;

        let mut recipes = Vec::new();
        for row in rows {
            recipes.push(row?.into_recipe()?);
        }
        Ok(recipes)
    }

    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get_recipe_by_title(&self, title: &str) -> Result<Option<Recipe>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {RECIPE_COLUMNS} FROM recipes WHERE title = ?1"),
                params![title.trim()],
                RecipeRow::from_row,
            )
            .optional()
            .context("failed to load recipe")?;
        row.map(RecipeRow::into_recipe).transpose()
    }

    /// Export inventory, grocery list, and recipes as deterministic NDJSON plus manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let mut inventory = self.list_inventory()?;
        inventory.sort_by(|lhs, rhs| lhs.item_id.cmp(&rhs.item_id));
        let inventory_digest = write_ndjson_file(&out_dir.join(INVENTORY_EXPORT_FILE), &inventory)?;
        let grocery_digest =
            write_ndjson_file(&out_dir.join(GROCERY_EXPORT_FILE), &self.list_grocery_entries()?)?;
        let recipe_digest =
            write_ndjson_file(&out_dir.join(RECIPE_EXPORT_FILE), &self.list_recipes()?)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: [
                (INVENTORY_EXPORT_FILE, inventory_digest),
                (GROCERY_EXPORT_FILE, grocery_digest),
                (RECIPE_EXPORT_FILE, recipe_digest),
            ]
            .into_iter()
            .map(|(path, (sha256, records))| ExportFileDigest {
                path: path.to_string(),
                sha256,
                records,
            })
            .collect(),
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database.
    ///
    /// # Errors
    /// Returns an error when migration, manifest validation, duplicate handling, or writes fail.
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join("manifest.json"))?;
        validate_import_manifest(in_dir, &manifest)?;

        let mut summary = ImportSummary::default();

        for record in read_ndjson_file::<InventoryRecord>(&in_dir.join(INVENTORY_EXPORT_FILE))? {
            if self.row_exists("inventory_items", "item_id", &record.item_id.to_string())? {
                if skip_existing {
                    summary.skipped_existing_items += 1;
                    continue;
                }
                return Err(anyhow!("inventory item already exists: {}", record.item_id));
            }
            insert_inventory_record(&self.conn, &record)?;
            summary.imported_items += 1;
        }

        for entry in read_ndjson_file::<GroceryEntry>(&in_dir.join(GROCERY_EXPORT_FILE))? {
            if self.row_exists("grocery_entries", "entry_id", &entry.entry_id.to_string())? {
                if skip_existing {
                    summary.skipped_existing_grocery_entries += 1;
                    continue;
                }
                return Err(anyhow!("grocery entry already exists: {}", entry.entry_id));
            }
            self.add_grocery_entry(&entry)?;
            summary.imported_grocery_entries += 1;
        }

        for recipe in read_ndjson_file::<Recipe>(&in_dir.join(RECIPE_EXPORT_FILE))? {
            if self.row_exists("recipes", "title", recipe.title.trim())? {
                if skip_existing {
                    summary.skipped_existing_recipes += 1;
                    continue;
                }
                return Err(anyhow!("recipe already exists: {}", recipe.title));
            }
            self.upsert_recipe(&recipe)?;
            summary.imported_recipes += 1;
        }

        Ok(summary)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()
    }

    /// Run quick-check, foreign-key-check, and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    fn row_exists(&self, table: &str, column: &str, value: &str) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE {column} = ?1)"),
                params![value],
                |row| row.get::<_, i64>(0),
            )
            .with_context(|| format!("failed to check {table}.{column}"))?;
        Ok(exists == 1)
    }
}

#[derive(Debug)]
struct InventoryRow {
    item_id: String,
    display_name: String,
    canonical_key: Option<String>,
    quantity: u32,
    expires_in_days: u32,
    category: String,
    image_ref: Option<String>,
    bounding_box_json: Option<String>,
    detected_at: String,
}

impl InventoryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            item_id: row.get(0)?,
            display_name: row.get(1)?,
            canonical_key: row.get(2)?,
            quantity: row.get(3)?,
            expires_in_days: row.get(4)?,
            category: row.get(5)?,
            image_ref: row.get(6)?,
            bounding_box_json: row.get(7)?,
            detected_at: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<InventoryRecord> {
        let bounding_box = self
            .bounding_box_json
            .map(|raw| {
                serde_json::from_str::<BoundingBox>(&raw)
                    .with_context(|| format!("invalid bounding box for item {}", self.item_id))
            })
            .transpose()?;

        Ok(InventoryRecord {
            item_id: ItemId(parse_ulid(&self.item_id)?),
            display_name: self.display_name,
            canonical_key: self.canonical_key,
            quantity: self.quantity,
            expires_in_days: self.expires_in_days,
            category: self.category,
            image_ref: self.image_ref,
            bounding_box,
            detected_at: parse_rfc3339(&self.detected_at)?,
        })
    }
}

#[derive(Debug)]
struct RecipeRow {
    recipe_id: String,
    title: String,
    description: String,
    instructions: String,
    category: String,
    image_url: Option<String>,
    ingredients_json: String,
}

impl RecipeRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            recipe_id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            instructions: row.get(3)?,
            category: row.get(4)?,
            image_url: row.get(5)?,
            ingredients_json: row.get(6)?,
        })
    }

    fn into_recipe(self) -> Result<Recipe> {
        let ingredients = serde_json::from_str::<Vec<Ingredient>>(&self.ingredients_json)
            .with_context(|| format!("invalid ingredients for recipe `{}`", self.title))?;
        Ok(Recipe {
            recipe_id: RecipeId(parse_ulid(&self.recipe_id)?),
            title: self.title,
            description: self.description,
            instructions: self.instructions,
            category: self.category,
            image_url: self.image_url,
            ingredients,
        })
    }
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 001")?;
    record_schema_version(conn, 1)
}

/// Rows that may resolve to `canonical_key`; `select_match` makes the final decision.
fn merge_in_transaction(
    conn: &Connection,
    observation: &ItemObservation,
    canonical_key: &str,
    image_ref: Option<&str>,
) -> Result<MergePlan> {
    let candidates = load_merge_candidates(conn)?;
    let plan = larder_core::merge_observation(
        select_match(&candidates, canonical_key),
        observation,
        canonical_key,
        image_ref,
        OffsetDateTime::now_utc(),
    );

    match plan.action {
        MergeAction::Inserted => insert_inventory_record(conn, &plan.record)?,
        MergeAction::Updated => update_inventory_record(conn, &plan.record)?,
    }
    Ok(plan)
}

/// Every inventory row; matching happens in `select_match` so SQL and Rust never disagree on
/// name normalization.
fn load_merge_candidates(conn: &Connection) -> Result<Vec<InventoryRecord>> {
    let mut stmt = conn.prepare(&format!("SELECT {INVENTORY_COLUMNS} FROM inventory_items"))?;
    let rows = stmt.query_map([], InventoryRow::from_row)?;

    let mut candidates = Vec::new();
    for row in rows {
        candidates.push(row?.into_record()?);
    }
    Ok(candidates)
}

fn insert_inventory_record(conn: &Connection, record: &InventoryRecord) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO inventory_items({INVENTORY_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ),
        params![
            record.item_id.to_string(),
            record.display_name,
            record.canonical_key,
            record.quantity,
            record.expires_in_days,
            record.category,
            record.image_ref,
            bounding_box_json(record.bounding_box.as_ref())?,
            rfc3339(record.detected_at)?,
        ],
    )
    .with_context(|| format!("failed to insert inventory item `{}`", record.display_name))?;
    Ok(())
}

fn update_inventory_record(conn: &Connection, record: &InventoryRecord) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE inventory_items SET
                display_name = ?2, canonical_key = ?3, quantity = ?4, expires_in_days = ?5,
                category = ?6, image_ref = ?7, bounding_box_json = ?8, detected_at = ?9
             WHERE item_id = ?1",
            params![
                record.item_id.to_string(),
                record.display_name,
                record.canonical_key,
                record.quantity,
                record.expires_in_days,
                record.category,
                record.image_ref,
                bounding_box_json(record.bounding_box.as_ref())?,
                rfc3339(record.detected_at)?,
            ],
        )
        .with_context(|| format!("failed to update inventory item `{}`", record.display_name))?;
    if changed != 1 {
        return Err(anyhow!("inventory item {} vanished during merge", record.item_id));
    }
    Ok(())
}

fn insert_grocery_entry(conn: &Connection, entry: &GroceryEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO grocery_entries(entry_id, display_name, quantity_needed, category, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.entry_id.to_string(),
            entry.display_name.trim(),
            entry.quantity_needed,
            entry.category,
            rfc3339(entry.created_at)?,
        ],
    )
    .with_context(|| format!("failed to insert grocery entry `{}`", entry.display_name))?;
    Ok(())
}

fn bounding_box_json(bounding_box: Option<&BoundingBox>) -> Result<Option<String>> {
    bounding_box
        .map(|bbox| serde_json::to_string(bbox).context("failed to serialize bounding box"))
        .transpose()
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "inventory_items")? {
        return Ok((0, false));
    }

    if table_has_column(conn, "inventory_items", "canonical_key")? {
        return Ok((2, true));
    }

    if table_has_column(conn, "inventory_items", "display_name")? {
        return Ok((1, true));
    }

    Err(anyhow!(
        "database schema is invalid: inventory_items has neither display_name nor canonical_key"
    ))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.write_all(b"\n"))
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for required in [INVENTORY_EXPORT_FILE, GROCERY_EXPORT_FILE, RECIPE_EXPORT_FILE] {
        let Some(expected) = by_path.get(required) else {
            return Err(anyhow!("manifest is missing required file entry: {required}"));
        };
        let file_path = in_dir.join(required);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }

        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {required}: expected {}, got {}",
                expected.sha256,
                actual_sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {required}: expected {}, got {}",
                expected.records,
                actual_records
            ));
        }
    }

    Ok(())
}
