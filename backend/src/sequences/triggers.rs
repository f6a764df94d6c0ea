// Trigger Service - turns business events into sequence runs.
//
// Run creation is synchronous and transactional: every run for a trigger call
// is inserted in one transaction, so a mid-batch failure creates nothing. The
// handoff to the worker happens only after commit and is fire-and-forget,
// best-effort. Callers get the count of runs created without waiting for
// execution.

use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::{Sequence, SequenceWorker};
use crate::error::{ApiResult, AppError};

/// Targeting for a manual trigger: exactly one of contact or tag.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerTarget {
    pub contact_id: Option<Uuid>,
    pub tag_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetKind {
    Contact(Uuid),
    Tag(Uuid),
}

impl TriggerTarget {
    pub fn resolve(&self) -> ApiResult<TargetKind> {
        match (self.contact_id, self.tag_id) {
            (Some(_), Some(_)) => Err(AppError::validation_single(
                "target",
                "Specify either contact_id or tag_id, not both",
            )),
            (Some(contact_id), None) => Ok(TargetKind::Contact(contact_id)),
            (None, Some(tag_id)) => Ok(TargetKind::Tag(tag_id)),
            (None, None) => Err(AppError::BadRequest(
                "A contact_id or tag_id target is required".to_string(),
            )),
        }
    }
}

#[derive(Clone)]
pub struct TriggerService {
    db_pool: PgPool,
    worker: Arc<SequenceWorker>,
}

impl TriggerService {
    pub fn new(db_pool: PgPool, worker: Arc<SequenceWorker>) -> Self {
        Self { db_pool, worker }
    }

    /// Fan a business event out to every matching active sequence for the
    /// clinic. Returns the number of runs created.
    pub async fn trigger_for_event(
        &self,
        event_name: &str,
        contact_id: Uuid,
        clinic_id: Uuid,
        context: &serde_json::Value,
    ) -> ApiResult<usize> {
        let sequences: Vec<Sequence> = sqlx::query_as(
            "SELECT * FROM sequences
             WHERE clinic_id = $1 AND trigger_event = $2
               AND status = 'active' AND is_active = TRUE",
        )
        .bind(clinic_id)
        .bind(event_name)
        .fetch_all(&self.db_pool)
        .await?;

        let jobs = fan_out(&sequences, &[contact_id]);
        let run_ids = self.create_runs(&jobs, context).await?;

        info!(
            "Event '{}' for contact {} created {} runs",
            event_name,
            contact_id,
            run_ids.len()
        );
        Ok(run_ids.len())
    }

    /// Manual trigger of one specific sequence against a contact or every
    /// current holder of a tag (a snapshot at trigger time, not a
    /// subscription).
    pub async fn trigger_manual(
        &self,
        sequence_id: Uuid,
        clinic_id: Uuid,
        target: &TriggerTarget,
        context: &serde_json::Value,
    ) -> ApiResult<usize> {
        let kind = target.resolve()?;

        let sequence: Option<Sequence> =
            sqlx::query_as("SELECT * FROM sequences WHERE id = $1 AND clinic_id = $2")
                .bind(sequence_id)
                .bind(clinic_id)
                .fetch_optional(&self.db_pool)
                .await?;

        let sequence = match sequence {
            Some(s) if s.is_triggerable() => s,
            _ => return Err(AppError::NotFound("Active sequence".to_string())),
        };

        let contact_ids = match kind {
            TargetKind::Contact(contact_id) => vec![contact_id],
            TargetKind::Tag(tag_id) => {
                let rows: Vec<(Uuid,)> =
                    sqlx::query_as("SELECT contact_id FROM contact_tags WHERE tag_id = $1")
                        .bind(tag_id)
                        .fetch_all(&self.db_pool)
                        .await?;

                if rows.is_empty() {
                    return Err(AppError::NotFound("Contacts with tag".to_string()));
                }
                rows.into_iter().map(|(id,)| id).collect()
            }
        };

        let jobs = fan_out(std::slice::from_ref(&sequence), &contact_ids);
        let run_ids = self.create_runs(&jobs, context).await?;

        info!(
            "Manual trigger of sequence {} created {} runs",
            sequence_id,
            run_ids.len()
        );
        Ok(run_ids.len())
    }

    /// Checkout-completed trigger: the contact id rides in the payload.
    pub async fn checkout_completed(
        &self,
        clinic_id: Uuid,
        payload: &serde_json::Value,
    ) -> ApiResult<usize> {
        let contact_id = payload
            .get("contact_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Uuid>().ok())
            .ok_or_else(|| {
                AppError::BadRequest("Checkout payload is missing contact_id".to_string())
            })?;

        self.trigger_for_event("checkout_completed", contact_id, clinic_id, payload)
            .await
    }

    pub async fn protocol_started(
        &self,
        contact_id: Uuid,
        clinic_id: Uuid,
        context: &serde_json::Value,
    ) -> ApiResult<usize> {
        self.trigger_for_event("protocol_started", contact_id, clinic_id, context)
            .await
    }

    pub async fn prescription_expired(
        &self,
        contact_id: Uuid,
        clinic_id: Uuid,
        context: &serde_json::Value,
    ) -> ApiResult<usize> {
        self.trigger_for_event("prescription_expired", contact_id, clinic_id, context)
            .await
    }

    /// Insert every run in one transaction, then hand the committed ids to
    /// the worker. A failure anywhere rolls back the whole batch, so nothing
    /// executes for a trigger call that reports an error.
    async fn create_runs(
        &self,
        jobs: &[(&Sequence, Uuid)],
        context: &serde_json::Value,
    ) -> ApiResult<Vec<Uuid>> {
        let mut tx = self.db_pool.begin().await?;
        let mut run_ids = Vec::with_capacity(jobs.len());

        for (sequence, contact_id) in jobs {
            let identity: Option<(String, String, Option<String>, Option<String>)> =
                sqlx::query_as(
                    "SELECT first_name, last_name, email, phone FROM contacts WHERE id = $1",
                )
                .bind(contact_id)
                .fetch_optional(&mut *tx)
                .await?;

            let payload = build_run_payload(context, *contact_id, identity);
            let run_id = Uuid::new_v4();

            sqlx::query(
                "INSERT INTO sequence_runs
                 (id, sequence_id, clinic_id, trigger_event, status, payload, current_step_index)
                 VALUES ($1, $2, $3, $4, 'pending', $5, 0)",
            )
            .bind(run_id)
            .bind(sequence.id)
            .bind(sequence.clinic_id)
            .bind(&sequence.trigger_event)
            .bind(&payload)
            .execute(&mut *tx)
            .await?;

            run_ids.push(run_id);
        }

        tx.commit().await?;

        // Best-effort handoff after commit; execution failures are logged by
        // the worker, never surfaced to the triggering caller.
        for run_id in &run_ids {
            self.worker.enqueue(*run_id);
        }

        Ok(run_ids)
    }
}

/// Pair every sequence with every target contact for run creation.
fn fan_out<'a>(sequences: &'a [Sequence], contact_ids: &[Uuid]) -> Vec<(&'a Sequence, Uuid)> {
    sequences
        .iter()
        .flat_map(|sequence| contact_ids.iter().map(move |id| (sequence, *id)))
        .collect()
}

/// Run payload = event context merged with the recipient's identity fields.
/// Identity fields win on key collision so merge fields always reflect the
/// contact record.
fn build_run_payload(
    context: &serde_json::Value,
    contact_id: Uuid,
    identity: Option<(String, String, Option<String>, Option<String>)>,
) -> serde_json::Value {
    let mut map = match context {
        serde_json::Value::Object(m) => m.clone(),
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            let mut m = serde_json::Map::new();
            m.insert("context".to_string(), other.clone());
            m
        }
    };

    map.insert(
        "contact_id".to_string(),
        serde_json::Value::String(contact_id.to_string()),
    );

    if let Some((first_name, last_name, email, phone)) = identity {
        map.insert("first_name".to_string(), first_name.into());
        map.insert("last_name".to_string(), last_name.into());
        if let Some(email) = email {
            map.insert("email".to_string(), email.into());
        }
        if let Some(phone) = phone {
            map.insert("phone".to_string(), phone.into());
        }
    }

    serde_json::Value::Object(map)
}
