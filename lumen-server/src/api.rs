use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Router,
};
use futures::{Stream, StreamExt};
use lumen_core::{
    probe_devices, DeviceInfo, GeneratedImage, GenerationRequest, HistoryEntry, LumenConfig,
    LumenError, ModelDescriptor, PerformanceFlags, Precision, PresetParams, ResidencySettings,
    ResidencyStatus, Resolution, Tier, RESOLUTIONS,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::state::AppState;

const DATA_URI_PREFIX: &str = "data:image/png;base64,";

type SharedState = Arc<AppState>;
type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/generate/stream", post(generate_stream))
        .route("/get_images/{session_id}", get(get_images))
        .route("/generate", post(generate))
        .route("/v1/images/generations", post(generate_image_handler))
        .route("/model/load", post(load_model))
        .route("/model/offload", post(offload_model))
        .route("/model/onload", post(onload_model))
        .route("/model/unload", post(unload_model))
        .route("/model/status", get(model_status))
        .route("/models", get(list_models))
        .route("/settings", get(get_settings).post(update_settings))
        .route("/history", get(list_history).delete(clear_history))
        .route("/presets", get(list_presets).post(upsert_preset))
        .route("/presets/{name}", delete(delete_preset))
        .route("/resolutions", get(list_resolutions))
        .route("/device-info", get(device_info))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error body is `{"detail": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    Core(LumenError),
    NotFound(String),
}

impl From<LumenError> for ApiError {
    fn from(err: LumenError) -> Self {
        Self::Core(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            Self::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
            Self::Core(err) => {
                let status = match &err {
                    LumenError::Validation { .. } => StatusCode::BAD_REQUEST,
                    LumenError::ModelNotFound { .. } | LumenError::SessionNotFound { .. } => {
                        StatusCode::NOT_FOUND
                    }
                    LumenError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    LumenError::SlotBusy | LumenError::InvalidTier { .. } => StatusCode::CONFLICT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    error!(error = %err, "request failed");
                }
                (status, err.to_string())
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

async fn generate_stream(
    State(state): State<SharedState>,
    Json(request): Json<GenerationRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let events = state.controller.start(request)?;
    let stream = ReceiverStream::new(events).map(|event| Event::default().json_data(event));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Serialize)]
struct ImagesResponse {
    images: Vec<GeneratedImage>,
}

async fn get_images(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<ImagesResponse>> {
    let session = state.sessions.take(&session_id)?;
    Ok(Json(ImagesResponse {
        images: session.images,
    }))
}

#[derive(Serialize)]
struct GenerateResponse {
    session_id: Uuid,
    images: Vec<GeneratedImage>,
    elapsed: f64,
}

async fn generate(
    State(state): State<SharedState>,
    Json(request): Json<GenerationRequest>,
) -> ApiResult<Json<GenerateResponse>> {
    let session = state.controller.generate(request).await?;
    Ok(Json(GenerateResponse {
        session_id: session.id,
        images: session.images,
        elapsed: session.elapsed,
    }))
}

#[derive(Serialize)]
struct GenerationResponse {
    image: String,
}

/// Single image as bare base64 PNG.
async fn generate_image_handler(
    State(state): State<SharedState>,
    Json(mut request): Json<GenerationRequest>,
) -> ApiResult<Json<GenerationResponse>> {
    request.num_images = 1;
    let session = state.controller.generate(request).await?;
    let image = session
        .images
        .into_iter()
        .next()
        .ok_or_else(|| LumenError::Inference {
            message: "no image produced".to_string(),
        })?
        .image;
    let image = match image.strip_prefix(DATA_URI_PREFIX) {
        Some(base64) => base64.to_string(),
        None => image,
    };
    Ok(Json(GenerationResponse { image }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoadRequest {
    model: Option<String>,
    tier: Option<Tier>,
}

async fn load_model(
    State(state): State<SharedState>,
    Json(request): Json<LoadRequest>,
) -> ApiResult<Json<ResidencyStatus>> {
    let tier = request.tier.unwrap_or(Tier::Accelerator);
    let lease = state.residency.acquire(request.model.as_deref(), tier).await?;
    drop(lease);
    Ok(Json(state.residency.status()))
}

#[derive(Serialize)]
struct ModelAction {
    changed: bool,
    status: ResidencyStatus,
}

async fn offload_model(State(state): State<SharedState>) -> ApiResult<Json<ModelAction>> {
    let changed = state.residency.move_to_tier(Tier::Host).await?;
    Ok(Json(ModelAction {
        changed,
        status: state.residency.status(),
    }))
}

async fn onload_model(State(state): State<SharedState>) -> ApiResult<Json<ModelAction>> {
    let changed = state.residency.move_to_tier(Tier::Accelerator).await?;
    Ok(Json(ModelAction {
        changed,
        status: state.residency.status(),
    }))
}

async fn unload_model(State(state): State<SharedState>) -> ApiResult<Json<ModelAction>> {
    let changed = state.residency.evict().await?;
    Ok(Json(ModelAction {
        changed,
        status: state.residency.status(),
    }))
}

async fn model_status(State(state): State<SharedState>) -> Json<ResidencyStatus> {
    Json(state.residency.status())
}

#[derive(Serialize)]
struct ModelCatalog {
    default: String,
    models: Vec<ModelDescriptor>,
}

async fn list_models(State(state): State<SharedState>) -> Json<ModelCatalog> {
    Json(ModelCatalog {
        default: state.residency.settings().default_model,
        models: state
            .residency
            .registry()
            .list()
            .iter()
            .map(|d| d.as_ref().clone())
            .collect(),
    })
}

async fn get_settings(State(state): State<SharedState>) -> Json<LumenConfig> {
    Json(state.config.lock().await.clone())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SettingsUpdate {
    model_id: Option<String>,
    cache_dir: Option<PathBuf>,
    memory_resident: Option<bool>,
    precision: Option<Precision>,
    performance: Option<PerformanceFlags>,
}

/// Persists the new settings, then applies them. A change to anything
/// residency depends on evicts the current model once in-flight generations
/// finish. The config lock is not held while waiting for them.
async fn update_settings(
    State(state): State<SharedState>,
    Json(update): Json<SettingsUpdate>,
) -> ApiResult<Json<LumenConfig>> {
    let _update = state.settings_update.lock().await;
    let mut next = state.config.lock().await.clone();
    if let Some(model_id) = update.model_id {
        state.residency.registry().get(&model_id)?;
        next.model_id = model_id;
    }
    if let Some(cache_dir) = update.cache_dir {
        tokio::fs::create_dir_all(&cache_dir)
            .await
            .map_err(|source| LumenError::Persist {
                path: cache_dir.clone(),
                source,
            })?;
        next.cache_dir = Some(cache_dir);
    }
    if let Some(memory_resident) = update.memory_resident {
        next.memory_resident = memory_resident;
    }
    if let Some(precision) = update.precision {
        next.precision = precision;
    }
    if let Some(performance) = update.performance {
        next.performance = performance;
    }

    state.config_store.save(&next)?;
    *state.config.lock().await = next.clone();
    info!(model = %next.model_id, memory_resident = next.memory_resident, "settings updated");

    let settings = ResidencySettings::from(&next);
    if settings != state.residency.settings() {
        state.residency.reconfigure(settings).await?;
    }
    Ok(Json(next))
}

async fn list_history(State(state): State<SharedState>) -> Json<Vec<HistoryEntry>> {
    Json(state.history.list())
}

async fn clear_history(State(state): State<SharedState>) -> ApiResult<StatusCode> {
    state.history.clear()?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_presets(
    State(state): State<SharedState>,
) -> Json<std::collections::BTreeMap<String, PresetParams>> {
    Json(state.presets.list())
}

#[derive(Debug, Deserialize)]
struct PresetUpsert {
    name: String,
    #[serde(flatten)]
    params: PresetParams,
}

async fn upsert_preset(
    State(state): State<SharedState>,
    Json(preset): Json<PresetUpsert>,
) -> ApiResult<StatusCode> {
    state.presets.upsert(&preset.name, preset.params)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_preset(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    if state.presets.delete(&name)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("preset not found: {name}")))
    }
}

async fn list_resolutions() -> Json<&'static [Resolution]> {
    Json(RESOLUTIONS)
}

async fn device_info() -> Json<DeviceInfo> {
    Json(probe_devices())
}

async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    let status = state.residency.status();
    Json(json!({
        "status": "ok",
        "model": status.model,
        "tier": status.tier,
    }))
}
