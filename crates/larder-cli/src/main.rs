use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use larder_api::{
    AddGroceryRequest, ImageScan, IngestScanRequest, LarderApi, LarderConfig, ScanMode,
    UpsertRecipeRequest,
};
use larder_core::{GroceryId, ItemId};
use larder_store_sqlite::SqliteStore;
use larder_vision::HttpRecognizer;
use serde::Serialize;
use serde_json::Value;
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "larder")]
#[command(about = "Larder inventory CLI")]
struct Cli {
    #[arg(long, default_value = "./larder.sqlite3")]
    db: PathBuf,

    /// YAML file with category and recognizer settings.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Scan {
        #[command(subcommand)]
        command: Box<ScanCommand>,
    },
    Inventory {
        #[command(subcommand)]
        command: Box<InventoryCommand>,
    },
    Grocery {
        #[command(subcommand)]
        command: Box<GroceryCommand>,
    },
    Recipe {
        #[command(subcommand)]
        command: Box<RecipeCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    /// Abort on the first record that already exists instead of skipping it.
    #[arg(long, default_value_t = false)]
    fail_on_existing: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum ScanCommand {
    /// Merge a raw recognition response read from a file.
    Ingest(ScanIngestArgs),
    /// Send a photo to the recognition service and merge its answer.
    Image(ScanImageArgs),
}

#[derive(Debug, Args)]
struct ScanIngestArgs {
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    image_ref: Option<String>,
    /// Clear the inventory before merging.
    #[arg(long, default_value_t = false)]
    replace: bool,
}

#[derive(Debug, Args)]
struct ScanImageArgs {
    #[arg(long)]
    image: PathBuf,
    /// Defaults to a guess from the file extension.
    #[arg(long)]
    mime_type: Option<String>,
    #[arg(long)]
    image_ref: Option<String>,
    #[arg(long, default_value_t = false)]
    replace: bool,
}

#[derive(Debug, Subcommand)]
enum InventoryCommand {
    List,
    SetQuantity(SetQuantityArgs),
    Delete(ItemArgs),
    Reset,
}

#[derive(Debug, Args)]
struct SetQuantityArgs {
    #[arg(long)]
    item_id: String,
    #[arg(long)]
    quantity: u32,
}

#[derive(Debug, Args)]
struct ItemArgs {
    #[arg(long)]
    item_id: String,
}

#[derive(Debug, Subcommand)]
enum GroceryCommand {
    Add(GroceryAddArgs),
    List,
    Delete(GroceryDeleteArgs),
    Compare,
}

#[derive(Debug, Args)]
struct GroceryAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    quantity: u32,
    #[arg(long)]
    category: Option<String>,
}

#[derive(Debug, Args)]
struct GroceryDeleteArgs {
    #[arg(long)]
    entry_id: String,
}

#[derive(Debug, Subcommand)]
enum RecipeCommand {
    /// Insert or replace a recipe from a JSON file, keyed on title.
    Upsert(RecipeUpsertArgs),
    List,
    Feasibility,
    MissingToGrocery(MissingToGroceryArgs),
}

#[derive(Debug, Args)]
struct RecipeUpsertArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct MissingToGroceryArgs {
    #[arg(long)]
    title: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = LarderConfig::load(cli.config.as_deref())?;
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(*command, &mut store)
        }
        Command::Scan { command } => run_scan(*command, &LarderApi::new(cli.db, config)),
        Command::Inventory { command } => {
            run_inventory(*command, &LarderApi::new(cli.db, config))
        }
        Command::Grocery { command } => run_grocery(*command, &LarderApi::new(cli.db, config)),
        Command::Recipe { command } => run_recipe(*command, &LarderApi::new(cli.db, config)),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Export(args) => run_db_export(&args, store),
        DbCommand::Import(args) => run_db_import(&args, store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::Restore(args) => run_db_restore(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_export(args: &DbExportArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let manifest = store.export_snapshot(&args.out)?;
    emit_json(serde_json::json!({
        "out_dir": args.out,
        "manifest": manifest
    }))
}

fn run_db_import(args: &DbImportArgs, store: &mut SqliteStore) -> Result<()> {
    let skip_existing = !args.fail_on_existing;
    let summary = store.import_snapshot(&args.input, skip_existing)?;
    emit_json(serde_json::json!({
        "in_dir": args.input,
        "skip_existing": skip_existing,
        "summary": summary
    }))
}

fn run_db_backup(args: &DbBackupArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_db_restore(args: &DbRestoreArgs, store: &mut SqliteStore) -> Result<()> {
    store.restore_database(&args.input)?;
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "restored_from": args.input,
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit(&report)
}

fn scan_mode(replace: bool) -> ScanMode {
    if replace {
        ScanMode::Replace
    } else {
        ScanMode::Accumulate
    }
}

fn run_scan(command: ScanCommand, api: &LarderApi) -> Result<()> {
    match command {
        ScanCommand::Ingest(args) => {
            let raw_response = fs::read_to_string(&args.file).with_context(|| {
                format!("failed to read recognition response {}", args.file.display())
            })?;
            let report = api.ingest_scan(&IngestScanRequest {
                raw_response,
                image_ref: args.image_ref,
                mode: scan_mode(args.replace),
            })?;
            emit(&report)
        }
        ScanCommand::Image(args) => {
            let image = fs::read(&args.image)
                .with_context(|| format!("failed to read image {}", args.image.display()))?;
            let recognizer =
                HttpRecognizer::from_config(&api.config().recognizer, &api.config().categories)?;
            let mime_type = args.mime_type.unwrap_or_else(|| guess_mime_type(&args.image));
            let image_ref = args.image_ref.or_else(|| {
                args.image.file_name().map(|name| name.to_string_lossy().into_owned())
            });
            let report = api.scan_image(
                &recognizer,
                &ImageScan { image, mime_type, image_ref, mode: scan_mode(args.replace) },
            )?;
            emit(&report)
        }
    }
}

fn guess_mime_type(path: &Path) -> String {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let mime_type = match extension.as_str() {
        "png" => "image/png",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "gif" => "image/gif",
        _ => "image/jpeg",
    };
    mime_type.to_string()
}

fn parse_ulid(raw: &str, field: &str) -> Result<Ulid> {
    Ulid::from_string(raw.trim()).with_context(|| format!("{field} must be a ULID, got `{raw}`"))
}

fn run_inventory(command: InventoryCommand, api: &LarderApi) -> Result<()> {
    match command {
        InventoryCommand::List => {
            let items = api.list_inventory()?;
            emit_json(serde_json::json!({ "count": items.len(), "items": items }))
        }
        InventoryCommand::SetQuantity(args) => {
            let item_id = ItemId(parse_ulid(&args.item_id, "item_id")?);
            emit(&api.set_quantity(item_id, args.quantity)?)
        }
        InventoryCommand::Delete(args) => {
            let item_id = ItemId(parse_ulid(&args.item_id, "item_id")?);
            api.delete_item(item_id)?;
            emit_json(serde_json::json!({ "deleted": item_id }))
        }
        InventoryCommand::Reset => {
            let cleared = api.reset_inventory()?;
            emit_json(serde_json::json!({ "cleared_items": cleared }))
        }
    }
}

fn run_grocery(command: GroceryCommand, api: &LarderApi) -> Result<()> {
    match command {
        GroceryCommand::Add(args) => emit(&api.add_grocery_entry(&AddGroceryRequest {
            display_name: args.name,
            quantity_needed: args.quantity,
            category: args.category,
        })?),
        GroceryCommand::List => {
            let entries = api.list_grocery_entries()?;
            emit_json(serde_json::json!({ "count": entries.len(), "entries": entries }))
        }
        GroceryCommand::Delete(args) => {
            let entry_id = GroceryId(parse_ulid(&args.entry_id, "entry_id")?);
            api.delete_grocery_entry(entry_id)?;
            emit_json(serde_json::json!({ "deleted": entry_id }))
        }
        GroceryCommand::Compare => emit(&api.compare_grocery_list()?),
    }
}

fn run_recipe(command: RecipeCommand, api: &LarderApi) -> Result<()> {
    match command {
        RecipeCommand::Upsert(args) => {
            let body = fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read recipe file {}", args.file.display()))?;
            let request = serde_json::from_str::<UpsertRecipeRequest>(&body)
                .with_context(|| format!("invalid recipe JSON in {}", args.file.display()))?;
            emit(&api.upsert_recipe(request)?)
        }
        RecipeCommand::List => {
            let recipes = api.list_recipes()?;
            emit_json(serde_json::json!({ "count": recipes.len(), "recipes": recipes }))
        }
        RecipeCommand::Feasibility => emit(&api.recipe_feasibility()?),
        RecipeCommand::MissingToGrocery(args) => emit(&api.missing_to_grocery(&args.title)?),
    }
}
