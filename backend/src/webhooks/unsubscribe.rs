// Recipient-facing surfaces embedded in outgoing email: the unsubscribe
// confirmation page and the open-tracking pixel. Both are keyed by run id.

use axum::{
    extract::{Path, State},
    http::header::CONTENT_TYPE,
    response::{Html, IntoResponse, Response},
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::engagement::record_open;
use crate::error::AppError;
use crate::sequences::refresh_sequence_stats;
use crate::AppState;

/// 1x1 transparent GIF
const TRANSPARENT_GIF: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xFF, 0xFF, 0xFF, 0x21, 0xF9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2C, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3B,
];

/// Terminal user-facing page, not an API: responds with HTML either way.
pub async fn unsubscribe_page(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
) -> Html<String> {
    match unsubscribe_by_run(&state.db_pool, run_id).await {
        Ok(true) => Html(page(
            "You're unsubscribed",
            "You will no longer receive emails from this clinic.",
        )),
        Ok(false) => Html(page(
            "Already unsubscribed",
            "This address was already unsubscribed. No further emails will be sent.",
        )),
        Err(e) => {
            warn!("Unsubscribe for run {} failed: {}", run_id, e);
            Html(page(
                "Something went wrong",
                "We couldn't process this unsubscribe link. Please contact your clinic directly.",
            ))
        }
    }
}

/// Returns true when the flag was newly set, false when it was already set.
async fn unsubscribe_by_run(pool: &PgPool, run_id: Uuid) -> Result<bool, AppError> {
    let contact_id: Option<(Option<serde_json::Value>,)> =
        sqlx::query_as("SELECT payload -> 'contact_id' FROM sequence_runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(pool)
            .await?;

    let contact_id = contact_id
        .and_then(|(v,)| v)
        .and_then(|v| v.as_str().and_then(|s| s.parse::<Uuid>().ok()))
        .ok_or_else(|| AppError::NotFound("Run".to_string()))?;

    let result = sqlx::query(
        "UPDATE contacts SET email_opted_out = TRUE, opted_out_at = NOW()
         WHERE id = $1 AND email_opted_out = FALSE",
    )
    .bind(contact_id)
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        info!("Contact {} opted out of email via run {}", contact_id, run_id);
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Always serves the pixel, whatever happens internally; only the first call
/// for a run increments the opened counter.
pub async fn open_pixel(State(state): State<Arc<AppState>>, Path(run_id): Path<Uuid>) -> Response {
    match record_open(&state.db_pool, run_id).await {
        Ok(true) => {
            let sequence_id: Result<Option<(Uuid,)>, _> =
                sqlx::query_as("SELECT sequence_id FROM sequence_runs WHERE id = $1")
                    .bind(run_id)
                    .fetch_optional(&state.db_pool)
                    .await;

            if let Ok(Some((sequence_id,))) = sequence_id {
                if let Err(e) = refresh_sequence_stats(&state.db_pool, sequence_id).await {
                    warn!("Stats refresh after open failed: {}", e);
                }
            }
        }
        Ok(false) => {}
        Err(e) => warn!("Open tracking for run {} failed: {}", run_id, e),
    }

    ([(CONTENT_TYPE, "image/gif")], TRANSPARENT_GIF.to_vec()).into_response()
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><title>{title}</title>\
         <style>body{{font-family:Arial,sans-serif;max-width:480px;margin:80px auto;\
         text-align:center;color:#333}}</style></head>\
         <body><h1>{title}</h1><p>{body}</p></body></html>"
    )
}
