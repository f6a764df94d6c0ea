// Webhook Ingestors
//
// Inbound callbacks from the channel providers and the recipient-facing
// unsubscribe/tracking surfaces. Every handler here acknowledges receipt even
// when internal processing fails.

pub mod engagement;
pub mod sms;
pub mod unsubscribe;

use crate::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Provider-facing callback routes
pub fn webhook_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/engagement", post(engagement::engagement_webhook))
        .route("/sms", post(sms::inbound_sms_webhook))
}

/// Recipient-facing routes mounted at the site root (these URLs are embedded
/// in outgoing email bodies)
pub fn public_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/unsubscribe/:run_id", get(unsubscribe::unsubscribe_page))
        .route("/t/open/:run_id", get(unsubscribe::open_pixel))
}
