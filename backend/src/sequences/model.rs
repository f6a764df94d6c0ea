// Sequence domain model - workflow definitions, steps, and run instances

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle status of a sequence definition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, sqlx::Type)]
#[sqlx(type_name = "sequence_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SequenceStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

/// Status of one execution instance of a sequence.
///
/// `Processing` is the only state from which `Completed` or `Failed` is
/// reachable; both of those are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, sqlx::Type)]
#[sqlx(type_name = "run_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, sqlx::Type)]
#[sqlx(type_name = "message_channel", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessageChannel {
    Email,
    Sms,
}

/// A single unit of work within a sequence, stored as one element of the
/// sequence's jsonb `steps` array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SequenceStep {
    Delay {
        seconds: u64,
    },
    Message {
        channel: MessageChannel,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        template_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
}

/// Decode a jsonb steps array element-wise.
///
/// A malformed or unrecognized element becomes `None` in place, so the worker
/// can log and skip it without aborting the whole run.
pub fn decode_steps(raw: &serde_json::Value) -> Vec<Option<SequenceStep>> {
    match raw.as_array() {
        Some(items) => items
            .iter()
            .map(|v| serde_json::from_value(v.clone()).ok())
            .collect(),
        None => Vec::new(),
    }
}

/// A named, versioned workflow definition owned by a clinic
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Sequence {
    pub id: Uuid,
    pub clinic_id: Uuid,
    pub name: String,
    pub status: SequenceStatus,
    pub trigger_event: String,
    pub steps: serde_json::Value,
    pub stats: serde_json::Value,
    pub stats_refreshed_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Sequence {
    /// Only active sequences with the active flag set are eligible to trigger.
    pub fn is_triggerable(&self) -> bool {
        self.status == SequenceStatus::Active && self.is_active
    }
}

/// One execution instance of a sequence for one contact/event occurrence.
///
/// `current_step_index` is the sole resumption checkpoint: it is persisted
/// after every step, never decreases, and a restart resumes exactly there.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SequenceRun {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub clinic_id: Uuid,
    pub trigger_event: String,
    pub status: RunStatus,
    pub payload: serde_json::Value,
    pub current_step_index: i32,
    pub emails_sent: i32,
    pub sms_sent: i32,
    pub emails_opened: i32,
    pub emails_clicked: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_decoding() {
        let raw = json!([
            {"type": "delay", "seconds": 3600},
            {"type": "message", "channel": "email", "subject": "Hi {{first_name}}", "body": "<p>Welcome</p>"},
            {"type": "message", "channel": "sms", "body": "Reply STOP to opt out"}
        ]);

        let steps = decode_steps(&raw);
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0], Some(SequenceStep::Delay { seconds: 3600 }));
        assert!(matches!(
            steps[1],
            Some(SequenceStep::Message {
                channel: MessageChannel::Email,
                ..
            })
        ));
        assert!(matches!(
            steps[2],
            Some(SequenceStep::Message {
                channel: MessageChannel::Sms,
                ..
            })
        ));
    }

    #[test]
    fn test_malformed_step_degrades_in_place() {
        let raw = json!([
            {"type": "delay", "seconds": 5},
            {"type": "carrier_pigeon", "coop": "north"},
            {"type": "message", "channel": "sms", "body": "hello"}
        ]);

        let steps = decode_steps(&raw);
        assert_eq!(steps.len(), 3);
        assert!(steps[0].is_some());
        assert!(steps[1].is_none());
        assert!(steps[2].is_some());
    }

    #[test]
    fn test_steps_not_an_array() {
        assert!(decode_steps(&json!({"type": "delay"})).is_empty());
        assert!(decode_steps(&json!(null)).is_empty());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Processing.is_terminal());
    }
}
