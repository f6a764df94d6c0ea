// Inbound SMS webhook - opt-out/opt-in keyword handling
//
// The provider posts form-encoded sender + body and expects a TwiML reply
// envelope. Non-command messages and unmatched senders get an empty envelope;
// internal errors are logged and still acknowledged.

use axum::{
    extract::State,
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    Form,
};
use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::AppState;

const OPT_OUT_KEYWORDS: &[&str] = &["STOP", "STOPALL", "UNSUBSCRIBE", "CANCEL", "END", "QUIT"];
const OPT_IN_KEYWORDS: &[&str] = &["START", "UNSTOP", "YES"];

#[derive(Debug, Deserialize)]
pub struct InboundSmsForm {
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "Body", default)]
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SmsCommand {
    OptOut,
    OptIn,
}

/// Exact match on the trimmed, uppercased body; anything else is not a
/// command.
pub fn parse_command(body: &str) -> Option<SmsCommand> {
    let keyword = body.trim().to_ascii_uppercase();
    if OPT_OUT_KEYWORDS.contains(&keyword.as_str()) {
        Some(SmsCommand::OptOut)
    } else if OPT_IN_KEYWORDS.contains(&keyword.as_str()) {
        Some(SmsCommand::OptIn)
    } else {
        None
    }
}

/// Normalize a phone number to its last 10 digits for matching.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let start = digits.len().saturating_sub(10);
    digits[start..].to_string()
}

pub async fn inbound_sms_webhook(
    State(state): State<Arc<AppState>>,
    Form(form): Form<InboundSmsForm>,
) -> Response {
    match handle_inbound(&state.db_pool, &form).await {
        Ok(reply) => twiml_response(reply.as_deref()),
        Err(e) => {
            // Acknowledge regardless; the provider would only retry.
            warn!("Inbound SMS processing failed: {}", e);
            twiml_response(None)
        }
    }
}

async fn handle_inbound(pool: &PgPool, form: &InboundSmsForm) -> Result<Option<String>, AppError> {
    let Some(command) = parse_command(&form.body) else {
        return Ok(None);
    };

    let phone = normalize_phone(&form.from);
    if phone.is_empty() {
        return Ok(None);
    }

    let contact: Option<(Uuid, bool)> = sqlx::query_as(
        "SELECT id, sms_opted_out FROM contacts
         WHERE RIGHT(REGEXP_REPLACE(COALESCE(phone, ''), '[^0-9]', '', 'g'), 10) = $1
         LIMIT 1",
    )
    .bind(&phone)
    .fetch_optional(pool)
    .await?;

    let Some((contact_id, opted_out)) = contact else {
        info!("Inbound SMS from unmatched number ending {}", phone);
        return Ok(None);
    };

    match command {
        SmsCommand::OptOut => {
            if opted_out {
                // A second STOP is a no-op.
                return Ok(Some("You are already unsubscribed.".to_string()));
            }

            sqlx::query(
                "UPDATE contacts SET sms_opted_out = TRUE, opted_out_at = NOW() WHERE id = $1",
            )
            .bind(contact_id)
            .execute(pool)
            .await?;

            info!("Contact {} opted out of SMS", contact_id);
            Ok(Some(
                "You have been unsubscribed from text messages. Reply START to resubscribe."
                    .to_string(),
            ))
        }
        SmsCommand::OptIn => {
            if !opted_out {
                return Ok(None);
            }

            sqlx::query("UPDATE contacts SET sms_opted_out = FALSE WHERE id = $1")
                .bind(contact_id)
                .execute(pool)
                .await?;

            info!("Contact {} opted back in to SMS", contact_id);
            Ok(Some("You have been resubscribed to text messages.".to_string()))
        }
    }
}

/// Provider-native reply envelope; empty when there is nothing to say.
pub fn twiml(reply: Option<&str>) -> String {
    match reply {
        Some(message) => format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Message>{}</Message></Response>",
            message
        ),
        None => "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response></Response>".to_string(),
    }
}

fn twiml_response(reply: Option<&str>) -> Response {
    ([(CONTENT_TYPE, "application/xml")], twiml(reply)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opt_out_keywords() {
        for kw in ["STOP", "stop", " Stop ", "STOPALL", "unsubscribe", "CANCEL", "end", "QUIT"] {
            assert_eq!(parse_command(kw), Some(SmsCommand::OptOut), "{}", kw);
        }
    }

    #[test]
    fn test_opt_in_keywords() {
        for kw in ["START", "start", "UNSTOP", "yes"] {
            assert_eq!(parse_command(kw), Some(SmsCommand::OptIn), "{}", kw);
        }
    }

    #[test]
    fn test_non_commands_are_ignored() {
        assert_eq!(parse_command("please stop texting me"), None);
        assert_eq!(parse_command("STOP PLEASE"), None);
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("hello"), None);
    }

    #[test]
    fn test_phone_normalization() {
        assert_eq!(normalize_phone("+1 (555) 123-4567"), "5551234567");
        assert_eq!(normalize_phone("15551234567"), "5551234567");
        assert_eq!(normalize_phone("5551234567"), "5551234567");
        assert_eq!(normalize_phone("4567"), "4567");
        assert_eq!(normalize_phone("no digits"), "");
    }

    #[test]
    fn test_twiml_envelopes() {
        assert_eq!(
            twiml(None),
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response></Response>"
        );
        let reply = twiml(Some("You are already unsubscribed."));
        assert!(reply.contains("<Message>You are already unsubscribed.</Message>"));
    }
}
