use crate::config::SmsConfig;
use crate::error::AppError;
use std::time::Duration;
use tracing::{error, info};

/// Twilio-style SMS transport. Posts one form-encoded message to the
/// provider's Messages endpoint with a bounded timeout.
#[derive(Debug, Clone)]
pub struct SmsProvider {
    client: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
    api_base: String,
}

impl SmsProvider {
    pub fn new(config: &SmsConfig) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::InternalError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(SmsProvider {
            client,
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            from_number: config.from_number.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    pub async fn send(&self, to_number: &str, body: &str) -> Result<(), AppError> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base, self.account_sid
        );

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[
                ("To", to_number),
                ("From", self.from_number.as_str()),
                ("Body", body),
            ])
            .send()
            .await
            .map_err(|e| {
                error!("SMS provider request failed: {}", e);
                AppError::ExternalServiceError {
                    service: "twilio".to_string(),
                    message: e.to_string(),
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            error!("SMS provider returned {}: {}", status, detail);
            return Err(AppError::ExternalServiceError {
                service: "twilio".to_string(),
                message: format!("HTTP {}: {}", status, detail),
            });
        }

        info!("SMS sent to {}", to_number);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(api_base: String) -> SmsConfig {
        SmsConfig {
            account_sid: "AC_test".to_string(),
            auth_token: "secret".to_string(),
            from_number: "+15550001111".to_string(),
            api_base,
        }
    }

    #[tokio::test]
    async fn test_send_posts_form_encoded_message() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/2010-04-01/Accounts/AC_test/Messages.json"))
            .and(body_string_contains("To=%2B15559992222"))
            .and(body_string_contains("Body=Your+refill+is+ready"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "sid": "SM123", "status": "queued"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = SmsProvider::new(&test_config(server.uri())).unwrap();
        provider
            .send("+15559992222", "Your refill is ready")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_provider_error_surfaces_as_external_service_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let provider = SmsProvider::new(&test_config(server.uri())).unwrap();
        let err = provider.send("+15559992222", "hello").await.unwrap_err();

        assert_eq!(err.error_code(), "EXTERNAL_SERVICE_ERROR");
        assert!(err.to_string().contains("500"));
    }
}
