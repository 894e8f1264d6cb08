//! JSON REST API over the offer facade.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use jof_core::{OfferRequest, OfferResponse};
use jof_sync::{IngestionError, OfferError, OfferFacade, SyncConfig};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use validator::{Validate, ValidationErrors};

pub const CRATE_NAME: &str = "jof-web";

#[derive(Clone)]
pub struct AppState {
    pub facade: Arc<OfferFacade>,
}

impl AppState {
    pub fn new(facade: Arc<OfferFacade>) -> Self {
        Self { facade }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("invalid offer request")]
    Validation(Vec<String>),
    #[error(transparent)]
    Offer(#[from] OfferError),
}

impl From<ValidationErrors> for ApiError {
    fn from(errors: ValidationErrors) -> Self {
        let mut messages: Vec<String> = errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| {
                    e.message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("{field} is invalid"))
                })
            })
            .collect();
        messages.sort();
        Self::Validation(messages)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Validation(messages) => {
                let body = json!({
                    "messages": messages,
                    "status": status_name(StatusCode::BAD_REQUEST),
                });
                return (StatusCode::BAD_REQUEST, Json(body)).into_response();
            }
            ApiError::Offer(OfferError::NotFound { .. }) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::Offer(OfferError::DuplicateKey { .. }) => (StatusCode::CONFLICT, self.to_string()),
            ApiError::Offer(OfferError::Ingestion(IngestionError::Fetch { .. })) => {
                error!(error = %self, "offer provider failed");
                (StatusCode::BAD_GATEWAY, self.to_string())
            }
            ApiError::Offer(_) => {
                error!(error = %self, "offer request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An unexpected error occurred".to_string(),
                )
            }
        };
        let body = json!({ "message": message, "status": status_name(status) });
        (status, Json(body)).into_response()
    }
}

fn status_name(status: StatusCode) -> String {
    status
        .canonical_reason()
        .unwrap_or("UNKNOWN")
        .to_ascii_uppercase()
        .replace(' ', "_")
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/offers", get(list_offers_handler).post(create_offer_handler))
        .route("/offers/{id}", get(offer_detail_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("JOF_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env();
    let facade = Arc::new(jof_sync::build_facade(&config).await?);

    // Held for the lifetime of the server; dropping it stops the job.
    let _scheduler = if config.scheduler_enabled {
        Some(jof_sync::start_ingestion_scheduler(facade.ingestion(), config.sync_interval).await?)
    } else {
        None
    };

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "offer api listening");
    axum::serve(listener, app(AppState::new(facade))).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_offers_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<OfferResponse>>, ApiError> {
    Ok(Json(state.facade.find_all_offers().await?))
}

async fn offer_detail_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OfferResponse>, ApiError> {
    Ok(Json(state.facade.find_offer_by_id(&id).await?))
}

async fn create_offer_handler(
    State(state): State<AppState>,
    payload: Result<Json<OfferRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<OfferResponse>), ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    request.validate()?;
    let saved = state.facade.save_offer(request).await?;
    Ok((StatusCode::CREATED, Json(saved)))
}
