//! API layer -- axum routes, handlers, and error mapping.

mod routes;
pub mod state;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use self::state::AppState;
use crate::storage::StoreError;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}

/// Handler error rendered as `{ "error", "code" }`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Store(StoreError::SiteNotFound(_) | StoreError::HistoryNotFound(_)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND")
            }
            ApiError::Store(StoreError::Paused(_) | StoreError::AlreadyFinished(_)) => {
                (StatusCode::CONFLICT, "CONFLICT")
            }
            ApiError::Store(StoreError::InvalidScript(_) | StoreError::InvalidPolicy(_)) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
            }
            ApiError::Store(e) => {
                tracing::error!(error = %e, "storage failure while serving request");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
