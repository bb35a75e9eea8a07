use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_larder<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_larder"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute larder binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_larder(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "larder command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_file(path: &Path, body: &str) {
    fs::write(path, body)
        .unwrap_or_else(|err| panic!("failed to write fixture {}: {err}", path.display()));
}

#[test]
fn db_commands_cover_migrate_integrity_backup_restore_export_import() {
    let dir = unique_temp_dir("larder-cli-db");
    let db = dir.join("larder.sqlite3");
    let db = path_str(&db);

    let planned = run_json(["--db", db, "db", "migrate", "--dry-run"]);
    assert_eq!(as_str(&planned, "contract_version"), "cli.v1");
    assert_eq!(planned["would_apply_versions"], serde_json::json!([1, 2]));

    let migrated = run_json(["--db", db, "db", "migrate"]);
    assert_eq!(as_i64(&migrated, "after_version"), 2);
    assert_eq!(migrated["up_to_date"], true);

    let status = run_json(["--db", db, "db", "schema-version"]);
    assert_eq!(as_i64(&status, "current_version"), 2);

    let scan = dir.join("scan.json");
    write_file(&scan, r#"{"items":[{"name":"Milk","quantity":2,"category":"dairy"}]}"#);
    run_json(["--db", db, "scan", "ingest", "--file", path_str(&scan)]);

    let integrity = run_json(["--db", db, "db", "integrity-check"]);
    assert_eq!(integrity["quick_check_ok"], true);

    let backup = dir.join("backup.sqlite3");
    let backed_up = run_json(["--db", db, "db", "backup", "--out", path_str(&backup)]);
    assert_eq!(as_str(&backed_up, "status"), "ok");

    let export_dir = dir.join("export");
    let exported = run_json(["--db", db, "db", "export", "--out", path_str(&export_dir)]);
    assert!(exported["manifest"]["files"].is_array());

    let fresh_db = dir.join("fresh.sqlite3");
    let imported =
        run_json(["--db", path_str(&fresh_db), "db", "import", "--in", path_str(&export_dir)]);
    assert_eq!(as_i64(&imported["summary"], "imported_items"), 1);

    let reimported =
        run_json(["--db", path_str(&fresh_db), "db", "import", "--in", path_str(&export_dir)]);
    assert_eq!(as_i64(&reimported["summary"], "skipped_existing_items"), 1);

    let strict = run_larder([
        "--db",
        path_str(&fresh_db),
        "db",
        "import",
        "--in",
        path_str(&export_dir),
        "--fail-on-existing",
    ]);
    assert!(!strict.status.success());

    run_json(["--db", db, "inventory", "reset"]);
    let restored = run_json(["--db", db, "db", "restore", "--in", path_str(&backup)]);
    assert_eq!(as_i64(&restored, "current_version"), 2);
    let inventory = run_json(["--db", db, "inventory", "list"]);
    assert_eq!(as_i64(&inventory, "count"), 1);
}

#[test]
fn scans_accumulate_and_inventory_commands_edit_records() {
    let dir = unique_temp_dir("larder-cli-scan");
    let db = dir.join("larder.sqlite3");
    let db = path_str(&db);

    let first = dir.join("first.json");
    write_file(&first, r#"{"items":[{"name":"Apple","quantity":3}]}"#);
    let second = dir.join("second.txt");
    write_file(
        &second,
        "```json\n{\"items\":[{\"name\":\"apples\",\"quantity\":2},{\"name\":\"???\",\"quantity\":1}]}\n```",
    );

    run_json(["--db", db, "scan", "ingest", "--file", path_str(&first)]);
    let report = run_json([
        "--db",
        db,
        "scan",
        "ingest",
        "--file",
        path_str(&second),
        "--image-ref",
        "fridge-2.jpg",
    ]);
    assert_eq!(report["outcomes"][0]["action"], "updated");
    assert_eq!(report["dropped_names"], serde_json::json!(["???"]));

    let inventory = run_json(["--db", db, "inventory", "list"]);
    assert_eq!(as_i64(&inventory, "count"), 1);
    let item = &inventory["items"][0];
    assert_eq!(as_str(item, "display_name"), "Apples");
    assert_eq!(as_i64(item, "quantity"), 5);
    let item_id = as_str(item, "item_id").to_string();

    let updated =
        run_json(["--db", db, "inventory", "set-quantity", "--item-id", &item_id, "--quantity", "1"]);
    assert_eq!(as_i64(&updated, "quantity"), 1);

    run_json(["--db", db, "inventory", "delete", "--item-id", &item_id]);
    let missing = run_larder(["--db", db, "inventory", "delete", "--item-id", &item_id]);
    assert!(!missing.status.success());
    assert!(String::from_utf8_lossy(&missing.stderr).contains("not found"));

    let replaced = run_json(["--db", db, "scan", "ingest", "--file", path_str(&first), "--replace"]);
    assert_eq!(replaced["mode"], "replace");
}

#[test]
fn malformed_scan_file_fails_without_writing() {
    let dir = unique_temp_dir("larder-cli-malformed");
    let db = dir.join("larder.sqlite3");
    let db = path_str(&db);

    let raw = dir.join("prose.txt");
    write_file(&raw, "The fridge appears to be empty.");
    let output = run_larder(["--db", db, "scan", "ingest", "--file", path_str(&raw)]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("malformed recognition response"));

    let inventory = run_json(["--db", db, "inventory", "list"]);
    assert_eq!(as_i64(&inventory, "count"), 0);
}

#[test]
fn grocery_and_recipe_commands_share_one_store() {
    let dir = unique_temp_dir("larder-cli-grocery");
    let db = dir.join("larder.sqlite3");
    let db = path_str(&db);

    let scan = dir.join("scan.json");
    write_file(&scan, r#"{"items":[{"name":"Flour","quantity":1},{"name":"Milk","quantity":2}]}"#);
    run_json(["--db", db, "scan", "ingest", "--file", path_str(&scan)]);

    let entry = run_json(["--db", db, "grocery", "add", "--name", "Milk", "--quantity", "5"]);
    assert_eq!(as_str(&entry, "category"), "other");
    let rejected = run_larder(["--db", db, "grocery", "add", "--name", "Eggs", "--quantity", "0"]);
    assert!(!rejected.status.success());

    let comparison = run_json(["--db", db, "grocery", "compare"]);
    assert_eq!(comparison["partially_satisfied"][0]["quantity_available"], 2);

    let recipe = dir.join("crepes.json");
    write_file(
        &recipe,
        r#"{"title":"Crepes","category":"breakfast","ingredients":[{"name":"flour"},{"name":"milk"},{"name":"eggs","quantity":3}]}"#,
    );
    let stored = run_json(["--db", db, "recipe", "upsert", "--file", path_str(&recipe)]);
    let restored = run_json(["--db", db, "recipe", "upsert", "--file", path_str(&recipe)]);
    assert_eq!(as_str(&stored, "recipe_id"), as_str(&restored, "recipe_id"));

    let feasibility = run_json(["--db", db, "recipe", "feasibility"]);
    assert_eq!(feasibility["almost_makeable"][0]["recipe"]["title"], "Crepes");

    let added = run_json(["--db", db, "recipe", "missing-to-grocery", "--title", "Crepes"]);
    assert_eq!(added["added"][0]["display_name"], "eggs");
    assert_eq!(added["added"][0]["quantity_needed"], 3);

    let entries = run_json(["--db", db, "grocery", "list"]);
    assert_eq!(as_i64(&entries, "count"), 2);
    let entry_id = as_str(&entries["entries"][0], "entry_id").to_string();
    run_json(["--db", db, "grocery", "delete", "--entry-id", &entry_id]);
    let entries = run_json(["--db", db, "grocery", "list"]);
    assert_eq!(as_i64(&entries, "count"), 1);
}

#[test]
fn config_file_restricts_categories() {
    let dir = unique_temp_dir("larder-cli-config");
    let db = dir.join("larder.sqlite3");
    let config = dir.join("larder.yaml");
    write_file(&config, "categories:\n  supported: [fridge, pantry]\n  default_category: pantry\n");

    let scan = dir.join("scan.json");
    write_file(
        &scan,
        r#"{"items":[{"name":"Milk","category":"fridge"},{"name":"Rice","category":"grains"}]}"#,
    );
    let report = run_json([
        "--db",
        path_str(&db),
        "--config",
        path_str(&config),
        "scan",
        "ingest",
        "--file",
        path_str(&scan),
    ]);
    assert_eq!(report["outcomes"][0]["item"]["category"], "fridge");
    assert_eq!(report["outcomes"][1]["item"]["category"], "pantry");

    let broken = dir.join("broken.yaml");
    write_file(&broken, "categories:\n  supported: [fridge]\n  default_category: attic\n");
    let output = run_larder([
        "--db",
        path_str(&db),
        "--config",
        path_str(&broken),
        "inventory",
        "list",
    ]);
    assert!(!output.status.success());
}
