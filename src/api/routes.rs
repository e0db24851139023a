//! API route definitions.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use uuid::Uuid;

use super::state::AppState;
use super::ApiError;
use crate::detect::ModelGroup;
use crate::pipeline::PipelineError;
use crate::ingest::ndjson::decode_value;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/quality", get(quality))
        .route("/alerts", get(list_alerts))
        .route("/alerts/{id}/ack", post(acknowledge_alert))
        .route("/models", get(list_models))
        .route("/models/{group}/retrain", post(retrain_model))
        .route("/readings", post(post_readings))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "sensors": state.pipeline.sensor_count(),
            "active_alerts": state.pipeline.active_alerts().len()
        },
        "meta": meta()
    }))
}

async fn quality(State(state): State<AppState>) -> Json<Value> {
    let q = state.pipeline.quality();
    Json(json!({
        "data": q,
        "meta": { "rejected": q.rejected(), "timestamp": chrono::Utc::now().to_rfc3339() }
    }))
}

async fn list_alerts(State(state): State<AppState>) -> Json<Value> {
    let alerts = state.pipeline.active_alerts();
    Json(json!({ "data": alerts, "meta": { "total": alerts.len() } }))
}

async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let alert_id = Uuid::parse_str(&id).map_err(|e| ApiError::BadRequest(format!("invalid alert id: {}", e)))?;
    let alert = state.pipeline.acknowledge(alert_id).await?;
    Ok(Json(json!({ "data": alert, "meta": meta() })))
}

async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let models = state.pipeline.models();
    Json(json!({ "data": models, "meta": { "total": models.len() } }))
}

async fn retrain_model(
    State(state): State<AppState>,
    Path(group): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let group: ModelGroup = group.parse().map_err(ApiError::BadRequest)?;
    let outcome = state.pipeline.force_retrain(&group).await?;
    Ok(Json(json!({ "data": outcome, "meta": { "group": group } })))
}

async fn post_readings(
    State(state): State<AppState>,
    Json(body): Json<Vec<Value>>,
) -> Result<Json<Value>, ApiError> {
    let mut queued = 0u64;
    let mut undecodable = 0u64;
    let mut over_limit = 0u64;
    for value in body {
        match decode_value(value) {
            Ok(reading) => match state.pipeline.ingest(reading).await {
                Ok(()) => queued += 1,
                Err(PipelineError::SensorLimit(_)) => over_limit += 1,
                Err(e) => return Err(e.into()),
            },
            Err(e) => {
                undecodable += 1;
                state.pipeline.record_undecodable();
                tracing::debug!(error = %e, "Dropping undecodable posted reading");
            }
        }
    }
    Ok(Json(json!({
        "data": { "queued": queued, "undecodable": undecodable, "over_limit": over_limit },
        "meta": meta()
    })))
}
