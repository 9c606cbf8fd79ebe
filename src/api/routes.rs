//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use super::state::AppState;
use super::ApiError;
use crate::executor::Browser;
use crate::runs::store;
use crate::scheduler::NewSchedule;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/schedules", get(list_schedules).post(create_schedule))
        .route("/schedules/dry-run", get(schedule_dry_run))
        .route("/schedules/{id}", get(get_schedule).delete(remove_schedule))
        .route("/schedules/{id}/enable", post(enable_schedule))
        .route("/schedules/{id}/disable", post(disable_schedule))
        .route("/schedules/{id}/trigger", post(trigger_schedule))
        .route("/schedules/{id}/runs", get(list_schedule_runs))
        .route("/scheduled-runs/{id}", get(get_scheduled_run))
        .route("/test-runs/{id}/chain", get(test_run_chain))
        .route("/fixtures/{id}/cache", delete(invalidate_fixture))
}

type ApiResult<T> = Result<T, ApiError>;

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

#[derive(Debug, Deserialize)]
struct ProjectFilter {
    project_id: Option<i64>,
}

async fn list_schedules(State(state): State<AppState>, Query(filter): Query<ProjectFilter>) -> ApiResult<Json<Value>> {
    let schedules = state.scheduler.list(filter.project_id).await?;
    Ok(Json(json!({ "data": schedules, "meta": { "total": schedules.len() } })))
}

async fn create_schedule(
    State(state): State<AppState>,
    Json(new): Json<NewSchedule>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let schedule = state.scheduler.add(new, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(json!({ "data": schedule }))))
}

async fn get_schedule(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Value>> {
    Ok(Json(json!({ "data": state.scheduler.get(id).await? })))
}

async fn remove_schedule(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    state.scheduler.remove(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn enable_schedule(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Value>> {
    Ok(Json(json!({ "data": state.scheduler.set_enabled(id, true, Utc::now()).await? })))
}

async fn disable_schedule(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Value>> {
    Ok(Json(json!({ "data": state.scheduler.set_enabled(id, false, Utc::now()).await? })))
}

/// Fire now in the background; the run shows up under `/schedules/{id}/runs`.
async fn trigger_schedule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let schedule = state.scheduler.get(id).await?;
    info!(schedule_id = id, "manual trigger via API");
    let coordinator = state.coordinator.clone();
    tokio::spawn(async move {
        if let Err(e) = coordinator.fire(&schedule).await {
            error!(schedule_id = schedule.id, error = %e, "triggered fire failed");
        }
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "data": { "schedule_id": id, "status": "triggered" } })),
    ))
}

#[derive(Debug, Deserialize)]
struct DryRunParams {
    #[serde(default = "default_hours")]
    hours: u64,
}

fn default_hours() -> u64 {
    24
}

async fn schedule_dry_run(State(state): State<AppState>, Query(params): Query<DryRunParams>) -> ApiResult<Json<Value>> {
    let upcoming = state.scheduler.preview(params.hours, Utc::now()).await?;
    Ok(Json(json!({ "data": { "upcoming": upcoming }, "meta": { "hours": params.hours } })))
}

#[derive(Debug, Deserialize)]
struct RunsParams {
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_limit() -> u32 {
    50
}

async fn list_schedule_runs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<RunsParams>,
) -> ApiResult<Json<Value>> {
    state.scheduler.get(id).await?;
    let runs = store::list_runs(&state.pool, Some(id), params.limit.min(500)).await?;
    Ok(Json(json!({ "data": runs, "meta": { "total": runs.len() } })))
}

async fn get_scheduled_run(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Value>> {
    let run = store::get_run(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("scheduled run {id} not found")))?;
    let targets: Vec<Value> = store::targets(&state.pool, id)
        .await?
        .into_iter()
        .map(|(test_case_id, terminal_run_id, passed)| {
            json!({ "test_case_id": test_case_id, "terminal_run_id": terminal_run_id, "passed": passed })
        })
        .collect();
    let test_runs = state.ledger().for_scheduled_run(id).await?;
    Ok(Json(json!({ "data": { "run": run, "targets": targets, "test_runs": test_runs } })))
}

async fn test_run_chain(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Value>> {
    let chain = state.ledger().chain_of(id).await?;
    Ok(Json(json!({ "data": chain, "meta": { "attempts": chain.len() } })))
}

#[derive(Debug, Deserialize)]
struct InvalidateParams {
    browser: Option<String>,
}

async fn invalidate_fixture(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<InvalidateParams>,
) -> ApiResult<Json<Value>> {
    let browser = params.browser.map(Browser::new);
    let removed = state.fixtures.invalidate(id, browser.as_ref()).await?;
    Ok(Json(json!({ "data": { "fixture_id": id, "removed": removed } })))
}
