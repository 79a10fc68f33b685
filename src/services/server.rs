//! HTTP adapter over [`ComparisonService`].
//!
//! Routes:
//! - `GET /`: status document
//! - `GET /health`: liveness and embedding availability
//! - `POST /api/compare`: multipart `image1`, `image2`, optional `mode`
//!   (`binary` | `embedding`) and `threshold`

use crate::config::{ServerSettings, APP_NAME, APP_VERSION};
use crate::core::embedding::EmbeddingError;
use crate::error::CompareError;
use crate::services::comparison::ComparisonService;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    service: Arc<ComparisonService>,
    started_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Missing images")]
    MissingImages,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Compare(#[from] CompareError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::MissingImages | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Compare(CompareError::Decode { .. }) => StatusCode::BAD_REQUEST,
            ApiError::Compare(CompareError::EmbeddingUnavailable)
            | ApiError::Compare(CompareError::Embedding(EmbeddingError::ModelLoad(_))) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Compare(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            log::error!("Compare request failed: {self}");
        } else {
            log::warn!("Rejected compare request: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Binary,
    Embedding,
}

impl std::str::FromStr for Mode {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "binary" => Ok(Mode::Binary),
            "embedding" => Ok(Mode::Embedding),
            other => Err(ApiError::BadRequest(format!("unknown mode {other:?}"))),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum CompareResponse {
    Binary {
        #[serde(rename = "match")]
        matched: u8,
    },
    Embedding {
        similarity: f64,
    },
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    started_at: String,
    uptime_secs: i64,
    embedding_available: bool,
}

pub fn router(service: Arc<ComparisonService>, max_upload_bytes: usize) -> Router {
    let state = AppState {
        service,
        started_at: Utc::now(),
    };
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(status))
        .route("/health", get(health))
        .route("/api/compare", post(compare))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until Ctrl-C.
pub async fn serve(service: Arc<ComparisonService>, settings: &ServerSettings) -> std::io::Result<()> {
    let app = router(service, settings.max_upload_bytes);
    let listener = tokio::net::TcpListener::bind((settings.host.as_str(), settings.port)).await?;
    log::info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Shutting down");
            }
        })
        .await
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "running",
        "name": APP_NAME,
        "version": APP_VERSION,
        "model": state.service.extractor_name(),
        "embedding_available": state.service.embedding_available(),
        "threshold": state.service.fusion_policy().threshold,
        "endpoints": {
            "/api/compare": "POST - Compare two images",
            "/health": "GET - Health check"
        }
    }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        started_at: state.started_at.to_rfc3339(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        embedding_available: state.service.embedding_available(),
    })
}

async fn compare(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<CompareResponse>, ApiError> {
    let mut image1: Option<Bytes> = None;
    let mut image2: Option<Bytes> = None;
    let mut mode = Mode::Binary;
    let mut threshold: Option<f64> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image1" | "image2" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                if name == "image1" {
                    image1 = Some(bytes);
                } else {
                    image2 = Some(bytes);
                }
            }
            "mode" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                mode = text.parse()?;
            }
            "threshold" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                let value: f64 = text
                    .trim()
                    .parse()
                    .map_err(|_| ApiError::BadRequest(format!("invalid threshold {text:?}")))?;
                if !value.is_finite() {
                    return Err(ApiError::BadRequest(format!("invalid threshold {text:?}")));
                }
                threshold = Some(value);
            }
            _ => {}
        }
    }

    let (Some(image1), Some(image2)) = (image1, image2) else {
        return Err(ApiError::MissingImages);
    };

    let service = state.service.clone();
    let response = tokio::task::spawn_blocking(move || -> Result<CompareResponse, CompareError> {
        match mode {
            Mode::Binary => {
                let matched = match threshold {
                    Some(t) => service.compare_binary_with_threshold(&image1, &image2, t)?,
                    None => service.compare_binary(&image1, &image2)?,
                };
                Ok(CompareResponse::Binary { matched })
            }
            Mode::Embedding => Ok(CompareResponse::Embedding {
                similarity: service.compare_embeddings(&image1, &image2)?,
            }),
        }
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(response))
}
