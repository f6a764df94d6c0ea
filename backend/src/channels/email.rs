use crate::config::SmtpConfig;
use crate::error::AppError;
use lettre::{
    message::header::{Header, HeaderName, HeaderValue},
    message::{header::ContentType, Mailbox},
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

/// Custom header carrying the run id so provider engagement callbacks can be
/// correlated back to the run without a separate lookup table.
#[derive(Debug, Clone)]
pub struct RunIdHeader(pub String);

impl Header for RunIdHeader {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-Engage-Run-Id")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

#[derive(Debug, Clone)]
pub struct EmailProvider {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
    from_name: String,
}

impl EmailProvider {
    pub fn new(smtp_config: &SmtpConfig) -> Result<Self, AppError> {
        let creds = Credentials::new(smtp_config.username.clone(), smtp_config.password.clone());

        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp_config.host)
            .port(smtp_config.port)
            .credentials(creds)
            .pool_config(PoolConfig::new().max_size(10))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        Ok(EmailProvider {
            transport,
            from_email: smtp_config.from_email.clone(),
            from_name: smtp_config.from_name.clone(),
        })
    }

    /// Send one rendered HTML message. The run id travels in message metadata
    /// for webhook correlation.
    pub async fn send(
        &self,
        to_email: &str,
        subject: &str,
        html_body: &str,
        run_id: Uuid,
    ) -> Result<(), AppError> {
        let from = format!("{} <{}>", self.from_name, self.from_email)
            .parse::<Mailbox>()
            .map_err(|e| AppError::InternalError(format!("Invalid from address: {}", e)))?;

        let to = to_email
            .parse::<Mailbox>()
            .map_err(|e| AppError::BadRequest(format!("Invalid recipient address: {}", e)))?;

        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .header(RunIdHeader(run_id.to_string()))
            .header(ContentType::TEXT_HTML)
            .body(html_body.to_string())
            .map_err(|e| AppError::InternalError(format!("Failed to build message: {}", e)))?;

        match self.transport.send(message).await {
            Ok(_) => {
                info!("Email sent to {} for run {}", to_email, run_id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to send email to {}: {}", to_email, e);
                Err(AppError::ExternalServiceError {
                    service: "smtp".to_string(),
                    message: e.to_string(),
                })
            }
        }
    }
}
