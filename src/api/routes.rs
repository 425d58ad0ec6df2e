//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use super::ApiResult;
use crate::model::{NewHistory, SiteId};
use crate::script::check_syntax;

const DEFAULT_HISTORY_LIMIT: usize = 50;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/script/check", post(check_script))
        .route("/sites", get(list_sites))
        .route("/sites/{id}/history", get(site_history).post(log_manual_login))
        .route("/sites/{id}/trigger", post(trigger_site))
        .route("/schedule", get(pending_jobs))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

#[derive(Debug, Deserialize)]
struct ScriptBody {
    script: String,
}

async fn check_script(Json(body): Json<ScriptBody>) -> Json<Value> {
    let error = check_syntax(&body.script);
    Json(json!({ "data": { "valid": error.is_none(), "error": error } }))
}

async fn list_sites(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let sites = state.store.list_sites()?;
    Ok(Json(json!({ "data": sites, "meta": { "total": sites.len() } })))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn site_history(
    State(state): State<AppState>,
    Path(id): Path<SiteId>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let site = state.store.get_site(id)?;
    let rows = state
        .store
        .history_for_site(site.id, query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT))?;
    Ok(Json(json!({ "data": rows, "meta": { "total": rows.len() } })))
}

/// Record that the operator logged in by hand; the site is rescheduled from now.
async fn log_manual_login(
    State(state): State<AppState>,
    Path(id): Path<SiteId>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let row = state
        .store
        .insert_history(id, NewHistory::manual(chrono::Utc::now()))?;
    Ok((StatusCode::CREATED, Json(json!({ "data": row }))))
}

async fn trigger_site(
    State(state): State<AppState>,
    Path(id): Path<SiteId>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let site = state.store.trigger_now(id)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "data": site }))))
}

async fn pending_jobs(State(state): State<AppState>) -> Json<Value> {
    let jobs = state.scheduler.pending().await;
    Json(json!({ "data": jobs, "meta": { "total": jobs.len() } }))
}
