// Message Dispatcher - resolves a step's template, renders it with run
// context, and hands it to the right channel provider.

use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use super::{MergeContext, MessageChannel, Sequence, SequenceRun, SequenceStep};
use crate::channels::{EmailProvider, SmsProvider};
use crate::error::AppError;

#[derive(Clone)]
pub struct MessageDispatcher {
    db_pool: PgPool,
    email: EmailProvider,
    sms: SmsProvider,
    public_base_url: String,
}

struct ResolvedTemplate {
    subject: Option<String>,
    body: String,
}

impl MessageDispatcher {
    pub fn new(
        db_pool: PgPool,
        email: EmailProvider,
        sms: SmsProvider,
        public_base_url: String,
    ) -> Self {
        Self {
            db_pool,
            email,
            sms,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Execute one message step for a run.
    ///
    /// Missing template, missing address, and opted-out recipient are all
    /// non-fatal skips: the step is logged and the run continues. A provider
    /// failure propagates and fails the run.
    pub async fn dispatch(
        &self,
        run: &SequenceRun,
        sequence: &Sequence,
        step: &SequenceStep,
    ) -> Result<(), AppError> {
        let SequenceStep::Message {
            channel,
            template_id,
            subject,
            body,
        } = step
        else {
            return Err(AppError::BadRequest(
                "Dispatcher only handles message steps".to_string(),
            ));
        };

        let Some(template) = self
            .resolve_template(*template_id, subject.clone(), body.clone())
            .await?
        else {
            warn!(
                "Run {}: template {:?} not found, skipping message step",
                run.id, template_id
            );
            return Ok(());
        };

        let (email_opted_out, sms_opted_out) = self.opt_out_flags(run).await?;
        let ctx = MergeContext::from_run(run, sequence);

        match channel {
            MessageChannel::Sms => {
                if sms_opted_out {
                    info!("Run {}: recipient opted out of SMS, skipping step", run.id);
                    return Ok(());
                }
                self.send_sms(run, &ctx, &template.body).await
            }
            MessageChannel::Email => {
                if email_opted_out {
                    info!(
                        "Run {}: recipient opted out of email, skipping step",
                        run.id
                    );
                    return Ok(());
                }
                self.send_email(run, &ctx, template.subject.as_deref(), &template.body)
                    .await
            }
        }
    }

    async fn send_sms(
        &self,
        run: &SequenceRun,
        ctx: &MergeContext,
        body: &str,
    ) -> Result<(), AppError> {
        let Some(phone) = ctx.get("phone").filter(|p| !p.is_empty()) else {
            warn!("Run {}: no phone number on payload, skipping SMS step", run.id);
            return Ok(());
        };

        self.sms.send(&phone, &ctx.render(body)).await?;

        // Persisted immediately so counters stay accurate if a later step fails.
        sqlx::query("UPDATE sequence_runs SET sms_sent = sms_sent + 1 WHERE id = $1")
            .bind(run.id)
            .execute(&self.db_pool)
            .await?;

        Ok(())
    }

    async fn send_email(
        &self,
        run: &SequenceRun,
        ctx: &MergeContext,
        subject: Option<&str>,
        body: &str,
    ) -> Result<(), AppError> {
        let Some(email) = ctx.get("email").filter(|e| !e.is_empty()) else {
            warn!(
                "Run {}: no email address on payload, skipping email step",
                run.id
            );
            return Ok(());
        };

        let rendered_subject = ctx.render(subject.unwrap_or_default());
        let html = decorate_html(&ctx.render(body), &self.public_base_url, run.id);

        self.email
            .send(&email, &rendered_subject, &html, run.id)
            .await?;

        sqlx::query("UPDATE sequence_runs SET emails_sent = emails_sent + 1 WHERE id = $1")
            .bind(run.id)
            .execute(&self.db_pool)
            .await?;

        Ok(())
    }

    async fn resolve_template(
        &self,
        template_id: Option<Uuid>,
        subject: Option<String>,
        body: Option<String>,
    ) -> Result<Option<ResolvedTemplate>, AppError> {
        if let Some(id) = template_id {
            let row: Option<(Option<String>, String)> =
                sqlx::query_as("SELECT subject, body FROM message_templates WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&self.db_pool)
                    .await?;

            return Ok(row.map(|(subject, body)| ResolvedTemplate { subject, body }));
        }

        Ok(body.map(|body| ResolvedTemplate { subject, body }))
    }

    /// Opt-out state is read from the contact record at send time, not at run
    /// creation, so a mid-sequence opt-out stops further messages.
    async fn opt_out_flags(&self, run: &SequenceRun) -> Result<(bool, bool), AppError> {
        let contact_id = run
            .payload
            .get("contact_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Uuid>().ok());

        let Some(contact_id) = contact_id else {
            return Ok((false, false));
        };

        let flags: Option<(bool, bool)> =
            sqlx::query_as("SELECT email_opted_out, sms_opted_out FROM contacts WHERE id = $1")
                .bind(contact_id)
                .fetch_optional(&self.db_pool)
                .await?;

        Ok(flags.unwrap_or((false, false)))
    }
}

/// Append the invisible open-tracking pixel and the unsubscribe footer link,
/// both keyed by the run id so webhooks can correlate without a lookup table.
pub fn decorate_html(html: &str, base_url: &str, run_id: Uuid) -> String {
    format!(
        "{}\n<img src=\"{}/t/open/{}\" width=\"1\" height=\"1\" alt=\"\" style=\"display:none\"/>\n\
         <p style=\"font-size:11px;color:#888\"><a href=\"{}/unsubscribe/{}\">Unsubscribe</a></p>",
        html, base_url, run_id, base_url, run_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SmsConfig, SmtpConfig};
    use crate::sequences::{RunStatus, SequenceStatus};
    use chrono::Utc;
    use serde_json::json;

    fn bare_dispatcher() -> MessageDispatcher {
        // These tests only exercise paths that skip before any query runs,
        // so a lazy pool with no database behind it is enough.
        let pool = PgPool::connect_lazy("postgresql://localhost/unused").unwrap();
        MessageDispatcher::new(
            pool,
            EmailProvider::new(&SmtpConfig {
                host: "localhost".to_string(),
                port: 2525,
                username: String::new(),
                password: String::new(),
                from_email: "care@engage.test".to_string(),
                from_name: "Engage".to_string(),
            })
            .unwrap(),
            SmsProvider::new(&SmsConfig {
                account_sid: String::new(),
                auth_token: String::new(),
                from_number: String::new(),
                api_base: "http://localhost".to_string(),
            })
            .unwrap(),
            "http://localhost:8080".to_string(),
        )
    }

    fn run_with_payload(payload: serde_json::Value) -> SequenceRun {
        SequenceRun {
            id: Uuid::new_v4(),
            sequence_id: Uuid::new_v4(),
            clinic_id: Uuid::new_v4(),
            trigger_event: "checkout_completed".to_string(),
            status: RunStatus::Processing,
            payload,
            current_step_index: 0,
            emails_sent: 0,
            sms_sent: 0,
            emails_opened: 0,
            emails_clicked: 0,
            started_at: None,
            completed_at: None,
            failure_reason: None,
            created_at: Utc::now(),
        }
    }

    fn active_sequence() -> Sequence {
        Sequence {
            id: Uuid::new_v4(),
            clinic_id: Uuid::new_v4(),
            name: "Post-checkout care".to_string(),
            status: SequenceStatus::Active,
            trigger_event: "checkout_completed".to_string(),
            steps: json!([]),
            stats: json!({}),
            stats_refreshed_at: None,
            is_active: true,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    fn inline_email_step() -> SequenceStep {
        SequenceStep::Message {
            channel: MessageChannel::Email,
            template_id: None,
            subject: Some("Hi {{first_name}}".to_string()),
            body: Some("<p>Welcome</p>".to_string()),
        }
    }

    #[test]
    fn test_decorate_html_embeds_run_id_links() {
        let run_id = Uuid::new_v4();
        let html = decorate_html("<p>Hi</p>", "https://engage.example", run_id);

        assert!(html.starts_with("<p>Hi</p>"));
        assert!(html.contains(&format!("https://engage.example/t/open/{}", run_id)));
        assert!(html.contains(&format!("https://engage.example/unsubscribe/{}", run_id)));
        assert!(html.contains("width=\"1\" height=\"1\""));
    }

    #[tokio::test]
    async fn test_missing_email_address_is_a_skip_not_a_failure() {
        let dispatcher = bare_dispatcher();
        let run = run_with_payload(json!({ "first_name": "Ada" }));

        dispatcher
            .dispatch(&run, &active_sequence(), &inline_email_step())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_phone_number_is_a_skip_not_a_failure() {
        let dispatcher = bare_dispatcher();
        let run = run_with_payload(json!({ "first_name": "Ada" }));
        let step = SequenceStep::Message {
            channel: MessageChannel::Sms,
            template_id: None,
            subject: None,
            body: Some("Your refill is ready".to_string()),
        };

        dispatcher
            .dispatch(&run, &active_sequence(), &step)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_message_step_without_content_is_a_skip() {
        let dispatcher = bare_dispatcher();
        let run = run_with_payload(json!({}));
        let step = SequenceStep::Message {
            channel: MessageChannel::Email,
            template_id: None,
            subject: None,
            body: None,
        };

        dispatcher
            .dispatch(&run, &active_sequence(), &step)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delay_step_is_rejected() {
        let dispatcher = bare_dispatcher();
        let run = run_with_payload(json!({}));
        let step = SequenceStep::Delay { seconds: 5 };

        let err = dispatcher
            .dispatch(&run, &active_sequence(), &step)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "BAD_REQUEST");
    }
}
