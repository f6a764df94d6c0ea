// Engagement webhook - email provider callbacks (open/click/delivered/bounce)

use axum::{extract::State, Json};
use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::sequences::refresh_sequence_stats;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct EngagementEvent {
    pub event: String,
    /// Correlation id carried in provider metadata; equal to the run id.
    #[serde(default)]
    pub run_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum EngagementKind {
    Open,
    Click,
    /// Logged only, no counter mutation (delivered, bounced, anything else).
    Info,
}

fn classify(event: &str) -> EngagementKind {
    match event.to_ascii_lowercase().as_str() {
        "open" | "opened" => EngagementKind::Open,
        "click" | "clicked" => EngagementKind::Click,
        _ => EngagementKind::Info,
    }
}

/// Batch ingest. Always responds 200: an unknown run id, a malformed event,
/// or a processing failure is logged and acknowledged, never surfaced to the
/// provider.
pub async fn engagement_webhook(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let events: Vec<EngagementEvent> = match body {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match serde_json::from_value(item) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("Dropping malformed engagement event: {}", e);
                    None
                }
            })
            .collect(),
        other => serde_json::from_value(other).map(|e| vec![e]).unwrap_or_default(),
    };

    let received = events.len();

    for event in &events {
        if let Err(e) = apply_event(&state.db_pool, event).await {
            warn!("Engagement event processing failed: {}", e);
        }
    }

    Json(serde_json::json!({ "received": received }))
}

async fn apply_event(pool: &PgPool, event: &EngagementEvent) -> Result<(), AppError> {
    let Some(run_id) = event.run_id else {
        warn!("Engagement event '{}' without run id, ignoring", event.event);
        return Ok(());
    };

    let sequence_id: Option<(Uuid,)> =
        sqlx::query_as("SELECT sequence_id FROM sequence_runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(pool)
            .await?;

    let Some((sequence_id,)) = sequence_id else {
        warn!(
            "Engagement event '{}' for unknown run {}, ignoring",
            event.event, run_id
        );
        return Ok(());
    };

    let mutated = match classify(&event.event) {
        EngagementKind::Open => record_open(pool, run_id).await?,
        EngagementKind::Click => {
            // Every click counts; a click also implies an open if none was
            // recorded yet (same 0/1 semantics as the pixel).
            let result = sqlx::query(
                "UPDATE sequence_runs
                 SET emails_clicked = emails_clicked + 1,
                     emails_opened = GREATEST(emails_opened, 1)
                 WHERE id = $1",
            )
            .bind(run_id)
            .execute(pool)
            .await?;
            result.rows_affected() > 0
        }
        EngagementKind::Info => {
            info!("Engagement event '{}' for run {}", event.event, run_id);
            false
        }
    };

    if mutated {
        refresh_sequence_stats(pool, sequence_id).await?;
    }

    Ok(())
}

/// At-most-once open counter: only the transition from zero counts, so the
/// first open wins and repeats are no-ops.
pub async fn record_open(pool: &PgPool, run_id: Uuid) -> Result<bool, AppError> {
    let result = sqlx::query(
        "UPDATE sequence_runs SET emails_opened = 1 WHERE id = $1 AND emails_opened = 0",
    )
    .bind(run_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}
