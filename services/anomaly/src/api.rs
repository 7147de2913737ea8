use crate::config::ApiConfig;
use crate::error::LifecycleError;
use crate::lifecycle::{AnalysisResult, RecordLifecycle};
use crate::record::{AnomalyRecord, RecordId, Verdict};
use crate::record_store::RecordStore;
use anyhow::{Context, Result};
use axum::{
    extract::{
        multipart::MultipartRejection,
        rejection::JsonRejection,
        DefaultBodyLimit, Multipart, Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<RecordLifecycle>,
}

/// Record as rendered to clients
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordResponse {
    pub id: String,
    pub original_url: String,
    pub video_name: String,
    pub is_anomaly: Option<bool>,
    pub accuracy: Option<f64>,
    pub processed_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<AnomalyRecord> for RecordResponse {
    fn from(r: AnomalyRecord) -> Self {
        Self {
            id: r.id().to_string(),
            original_url: r.asset_url().to_string(),
            video_name: r.asset_name().to_string(),
            is_anomaly: r.verdict().as_flag(),
            accuracy: r.confidence(),
            processed_url: r.processed_url().map(str::to_string),
            created_at: r.created_at(),
            updated_at: r.updated_at(),
        }
    }
}

/// Analyzer callback body. `verdict` and `isAnomaly` are alternative spellings,
/// as are `confidence` and `accuracy`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisCallback {
    pub verdict: Option<Verdict>,
    pub is_anomaly: Option<bool>,
    #[serde(alias = "accuracy")]
    pub confidence: Option<f64>,
    pub processed_url: Option<String>,
}

impl TryFrom<AnalysisCallback> for AnalysisResult {
    type Error = LifecycleError;

    fn try_from(body: AnalysisCallback) -> Result<Self, Self::Error> {
        let flagged = body.is_anomaly.map(|flag| Verdict::from_flag(Some(flag)));
        let verdict = match (body.verdict, flagged) {
            (Some(a), Some(b)) if a != b => {
                return Err(LifecycleError::Validation(
                    "verdict and isAnomaly disagree".to_string(),
                ))
            }
            (a, b) => a.or(b),
        };

        Ok(AnalysisResult {
            verdict,
            confidence: body.confidence,
            processed_url: body.processed_url,
        })
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/anomaly", post(create_anomaly))
        .route("/anomalies", get(list_anomalies))
        .route("/anomaly/:id", get(get_anomaly).patch(patch_anomaly))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "anomaly-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.lifecycle.records().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Accept a media upload
#[instrument(skip(state, multipart))]
async fn create_anomaly(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<RecordResponse>, LifecycleError> {
    let mut multipart = multipart
        .map_err(|rejection| LifecycleError::Validation(rejection.body_text()))?;
    let kind = state.lifecycle.asset_kind();
    let mut upload = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| LifecycleError::Validation(format!("Malformed upload: {e}")))?
    {
        if field.name() != Some(kind.form_field()) {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| LifecycleError::Validation(format!("Malformed upload: {e}")))?;
        upload = Some((filename, bytes));
    }

    let Some((filename, bytes)) = upload else {
        return Err(LifecycleError::Validation(format!(
            "Supported formats: {}.",
            kind.supported_formats()
        )));
    };

    let record = state.lifecycle.submit_upload(bytes, &filename).await?;
    Ok(Json(record.into()))
}

/// List all records, newest first
async fn list_anomalies(
    State(state): State<AppState>,
) -> Result<Json<Vec<RecordResponse>>, LifecycleError> {
    let records = state.lifecycle.list().await?;
    Ok(Json(records.into_iter().map(Into::into).collect()))
}

/// Get a single record
async fn get_anomaly(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RecordResponse>, LifecycleError> {
    let record = state.lifecycle.get(parse_id(&id)?).await?;
    Ok(Json(record.into()))
}

/// Analyzer callback
#[instrument(skip(state, body))]
async fn patch_anomaly(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<AnalysisCallback>, JsonRejection>,
) -> Result<Json<RecordResponse>, LifecycleError> {
    let id = parse_id(&id)?;
    let decoded = body
        .map_err(|rejection| LifecycleError::Validation(rejection.body_text()))
        .and_then(|Json(body)| AnalysisResult::try_from(body));

    let result = match decoded {
        Ok(result) => result,
        Err(e) => {
            // Unknown ids report NotFound before any body error.
            state.lifecycle.get(id).await?;
            return Err(e);
        }
    };

    let record = state.lifecycle.apply_analysis_result(id, result).await?;
    Ok(Json(record.into()))
}

/// Ids that do not parse can never have been issued
fn parse_id(raw: &str) -> Result<RecordId, LifecycleError> {
    raw.parse()
        .map_err(|_| LifecycleError::NotFound(raw.to_string()))
}

/// Start the API server. It stops accepting connections once `shutdown`
/// resolves and returns after in-flight requests finish.
pub async fn start_api_server<F>(state: AppState, config: &ApiConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting anomaly API server");

    let listener = TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    serve_until(listener, router, shutdown).await
}

async fn serve_until<F>(listener: TcpListener, router: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    info!("API server drained");
    Ok(())
}
