// HTTP Handlers - trigger entry points, run management, and analytics reads

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ApiResult, AppError};
use crate::sequences::TriggerTarget;
use crate::{database, AppState};

pub fn sequence_routes() -> Router<Arc<AppState>> {
    Router::new().route("/:id/trigger", post(trigger_sequence))
}

pub fn trigger_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/checkout", post(checkout_completed))
        .route("/protocol-start", post(protocol_started))
        .route("/prescription-expired", post(prescription_expired))
}

pub fn run_routes() -> Router<Arc<AppState>> {
    Router::new().route("/:id/enqueue", post(enqueue_run))
}

pub fn analytics_routes() -> Router<Arc<AppState>> {
    Router::new().route("/funnel", get(funnel_report))
}

// ==================== Triggers ====================

#[derive(Debug, Deserialize)]
struct ManualTriggerRequest {
    clinic_id: Uuid,
    #[serde(flatten)]
    target: TriggerTarget,
    #[serde(default)]
    context: serde_json::Value,
}

/// Manual trigger of one sequence against a contact or a tag snapshot.
async fn trigger_sequence(
    State(state): State<Arc<AppState>>,
    Path(sequence_id): Path<Uuid>,
    Json(req): Json<ManualTriggerRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let created = state
        .triggers
        .trigger_manual(sequence_id, req.clinic_id, &req.target, &req.context)
        .await?;

    Ok(Json(serde_json::json!({ "runs_created": created })))
}

#[derive(Debug, Deserialize)]
struct CheckoutTriggerRequest {
    clinic_id: Uuid,
    #[serde(default)]
    payload: serde_json::Value,
}

async fn checkout_completed(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CheckoutTriggerRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let created = state
        .triggers
        .checkout_completed(req.clinic_id, &req.payload)
        .await?;

    Ok(Json(serde_json::json!({ "runs_created": created })))
}

#[derive(Debug, Deserialize)]
struct ContactTriggerRequest {
    clinic_id: Uuid,
    contact_id: Uuid,
    #[serde(default)]
    context: serde_json::Value,
}

async fn protocol_started(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ContactTriggerRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let created = state
        .triggers
        .protocol_started(req.contact_id, req.clinic_id, &req.context)
        .await?;

    Ok(Json(serde_json::json!({ "runs_created": created })))
}

async fn prescription_expired(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ContactTriggerRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let created = state
        .triggers
        .prescription_expired(req.contact_id, req.clinic_id, &req.context)
        .await?;

    Ok(Json(serde_json::json!({ "runs_created": created })))
}

// ==================== Runs ====================

/// Manual re-enqueue. The checkpoint was not advanced past a failed step, so
/// re-running a failed run retries exactly that step.
async fn enqueue_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM sequence_runs WHERE id = $1")
        .bind(run_id)
        .fetch_optional(&state.db_pool)
        .await?;

    if exists.is_none() {
        return Err(AppError::NotFound("Run".to_string()));
    }

    // Failed runs resume from their checkpoint; terminal-state handling is
    // the worker's no-op path.
    sqlx::query("UPDATE sequence_runs SET status = 'processing' WHERE id = $1 AND status = 'failed'")
        .bind(run_id)
        .execute(&state.db_pool)
        .await?;

    state.worker.enqueue(run_id);
    Ok(Json(serde_json::json!({ "enqueued": run_id })))
}

// ==================== Analytics ====================

#[derive(Debug, Deserialize)]
struct FunnelQuery {
    clinic_id: Uuid,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
}

async fn funnel_report(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FunnelQuery>,
) -> ApiResult<Json<crate::analytics::FunnelReport>> {
    let today = chrono::Utc::now().date_naive();
    let from = query.from.unwrap_or_else(|| today - chrono::Duration::days(30));
    let to = query.to.unwrap_or(today);

    let report = state
        .aggregator
        .query_range(query.clinic_id, from, to)
        .await?;

    Ok(Json(report))
}

// ==================== Health ====================

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let db_ok = database::health_check(&state.db_pool).await;
    Json(serde_json::json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "database": db_ok,
    }))
}
