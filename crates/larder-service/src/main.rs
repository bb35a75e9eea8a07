use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose, Engine as _};
use clap::Parser;
use larder_api::{
    AddGroceryRequest, ImageScan, IngestScanRequest, LarderApi, LarderConfig,
    MissingToGroceryRequest, NotFound, ScanMode, ScanReport, SetQuantityRequest,
    UpsertRecipeRequest, API_CONTRACT_VERSION,
};
use larder_core::{
    GroceryComparison, GroceryEntry, GroceryId, InventoryRecord, ItemId, LarderError, Recipe,
    RecipeFeasibility,
};
use larder_vision::{HttpRecognizer, Recognizer};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

type SharedRecognizer = Arc<dyn Recognizer + Send + Sync>;

#[derive(Clone)]
struct ServiceState {
    api: LarderApi,
    /// `None` when no API key is configured; image scans then answer 503.
    recognizer: Option<SharedRecognizer>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error_kind: &'static str,
    error: String,
    retryable: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ScanImageRequest {
    image_base64: String,
    mime_type: String,
    #[serde(default)]
    image_ref: Option<String>,
    #[serde(default)]
    mode: ScanMode,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    recognizer_configured: bool,
}

#[derive(Debug, Clone, Serialize)]
struct ResetResponse {
    cleared_items: usize,
}

#[derive(Debug, Clone, Serialize)]
struct DeleteResponse {
    deleted: String,
}

#[derive(Debug, Parser)]
#[command(name = "larder-service")]
#[command(about = "Local HTTP service for the larder inventory")]
struct Args {
    #[arg(long, default_value = "./larder.sqlite3")]
    db: PathBuf,
    /// YAML file with category and recognizer settings.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl ServiceError {
    fn new(status: StatusCode, error_kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error_kind,
            error: message.into(),
            retryable: false,
        }
    }

    fn invalid_id(raw: &str) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "validation", format!("invalid id `{raw}`"))
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(domain) = err.downcast_ref::<LarderError>() {
            let status = match domain {
                LarderError::MalformedResponse(_) | LarderError::Validation(_) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                LarderError::EmptyResponse(_) | LarderError::UpstreamError { .. } => {
                    StatusCode::BAD_GATEWAY
                }
                LarderError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            };
            return Self {
                retryable: domain.is_retryable(),
                ..Self::new(status, domain.kind(), domain.to_string())
            };
        }
        if let Some(missing) = err.downcast_ref::<NotFound>() {
            return Self::new(StatusCode::NOT_FOUND, "not_found", missing.to_string());
        }
        Self::new(StatusCode::BAD_REQUEST, "request_failed", format!("{err:#}"))
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

fn envelope<T>(data: T) -> Json<ServiceEnvelope<T>>
where
    T: Serialize,
{
    Json(ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    })
}

type ServiceResult<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/scan/ingest", post(scan_ingest))
        .route("/v1/scan/image", post(scan_image))
        .route("/v1/inventory", get(inventory_list))
        .route("/v1/inventory/reset", post(inventory_reset))
        .route("/v1/inventory/:item_id/quantity", post(inventory_set_quantity))
        .route("/v1/inventory/:item_id", delete(inventory_delete))
        .route("/v1/grocery", get(grocery_list).post(grocery_add))
        .route("/v1/grocery/compare", get(grocery_compare))
        .route("/v1/grocery/:entry_id", delete(grocery_delete))
        .route("/v1/recipes", get(recipe_list).post(recipe_upsert))
        .route("/v1/recipes/feasibility", get(recipe_feasibility))
        .route("/v1/recipes/missing-to-grocery", post(recipe_missing_to_grocery))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = LarderConfig::load(args.config.as_deref())?;
    let recognizer = match HttpRecognizer::from_config(&config.recognizer, &config.categories) {
        Ok(recognizer) => Some(Arc::new(recognizer) as SharedRecognizer),
        Err(err) => {
            tracing::warn!(error = %err, "image scans disabled");
            None
        }
    };

    let state = ServiceState { api: LarderApi::new(args.db, config), recognizer };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "larder service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    envelope(HealthResponse { status: "ok", recognizer_configured: state.recognizer.is_some() })
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> ServiceResult<larder_store_sqlite::SchemaStatus> {
    Ok(envelope(state.api.schema_status()?))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> ServiceResult<larder_api::MigrateResult> {
    Ok(envelope(state.api.migrate(request.dry_run)?))
}

async fn scan_ingest(
    State(state): State<ServiceState>,
    Json(request): Json<IngestScanRequest>,
) -> ServiceResult<ScanReport> {
    Ok(envelope(state.api.ingest_scan(&request)?))
}

async fn scan_image(
    State(state): State<ServiceState>,
    Json(request): Json<ScanImageRequest>,
) -> ServiceResult<ScanReport> {
    let Some(recognizer) = state.recognizer.clone() else {
        return Err(ServiceError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "recognizer_unavailable",
            "no recognition service is configured",
        ));
    };
    let image = general_purpose::STANDARD.decode(request.image_base64.trim()).map_err(|err| {
        ServiceError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "validation",
            format!("image_base64 is not valid base64: {err}"),
        )
    })?;
    let scan = ImageScan {
        image,
        mime_type: request.mime_type,
        image_ref: request.image_ref,
        mode: request.mode,
    };

    let api = state.api.clone();
    let report = tokio::task::spawn_blocking(move || api.scan_image(&*recognizer, &scan))
        .await
        .map_err(|err| {
            ServiceError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
        })??;
    Ok(envelope(report))
}

async fn inventory_list(State(state): State<ServiceState>) -> ServiceResult<Vec<InventoryRecord>> {
    Ok(envelope(state.api.list_inventory()?))
}

async fn inventory_reset(State(state): State<ServiceState>) -> ServiceResult<ResetResponse> {
    Ok(envelope(ResetResponse { cleared_items: state.api.reset_inventory()? }))
}

async fn inventory_set_quantity(
    State(state): State<ServiceState>,
    Path(item_id): Path<String>,
    Json(request): Json<SetQuantityRequest>,
) -> ServiceResult<InventoryRecord> {
    let item_id = parse_id(&item_id).map(ItemId)?;
    Ok(envelope(state.api.set_quantity(item_id, request.quantity)?))
}

async fn inventory_delete(
    State(state): State<ServiceState>,
    Path(item_id): Path<String>,
) -> ServiceResult<DeleteResponse> {
    let item_id = parse_id(&item_id).map(ItemId)?;
    state.api.delete_item(item_id)?;
    Ok(envelope(DeleteResponse { deleted: item_id.to_string() }))
}

async fn grocery_list(State(state): State<ServiceState>) -> ServiceResult<Vec<GroceryEntry>> {
    Ok(envelope(state.api.list_grocery_entries()?))
}

async fn grocery_add(
    State(state): State<ServiceState>,
    Json(request): Json<AddGroceryRequest>,
) -> ServiceResult<GroceryEntry> {
    Ok(envelope(state.api.add_grocery_entry(&request)?))
}

async fn grocery_delete(
    State(state): State<ServiceState>,
    Path(entry_id): Path<String>,
) -> ServiceResult<DeleteResponse> {
    let entry_id = parse_id(&entry_id).map(GroceryId)?;
    state.api.delete_grocery_entry(entry_id)?;
    Ok(envelope(DeleteResponse { deleted: entry_id.to_string() }))
}

async fn grocery_compare(State(state): State<ServiceState>) -> ServiceResult<GroceryComparison> {
    Ok(envelope(state.api.compare_grocery_list()?))
}

async fn recipe_list(State(state): State<ServiceState>) -> ServiceResult<Vec<Recipe>> {
    Ok(envelope(state.api.list_recipes()?))
}

async fn recipe_upsert(
    State(state): State<ServiceState>,
    Json(request): Json<UpsertRecipeRequest>,
) -> ServiceResult<Recipe> {
    Ok(envelope(state.api.upsert_recipe(request)?))
}

async fn recipe_feasibility(State(state): State<ServiceState>) -> ServiceResult<RecipeFeasibility> {
    Ok(envelope(state.api.recipe_feasibility()?))
}

async fn recipe_missing_to_grocery(
    State(state): State<ServiceState>,
    Json(request): Json<MissingToGroceryRequest>,
) -> ServiceResult<larder_api::MissingToGroceryResult> {
    Ok(envelope(state.api.missing_to_grocery(&request.title)?))
}

fn parse_id(raw: &str) -> Result<Ulid, ServiceError> {
    Ulid::from_string(raw).map_err(|_| ServiceError::invalid_id(raw))
}
