//! Delivery of agent replies to the messaging provider
//!
//! Replies are persisted first and handed to the provider afterwards, so a
//! provider outage never loses a message; it only delays the `message-ack`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Attempts made for a transient provider failure
const MAX_RETRIES: usize = 3;
const RETRY_BASE_DELAY_MS: u64 = 200;
const RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

/// Errors from a provider send
#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Recipient unavailable: {0}")]
    Recipient(String),
}

impl OutboundError {
    /// Returns true if this error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            OutboundError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            OutboundError::Rejected { status, .. } => *status == 429 || *status >= 500,
            OutboundError::Recipient(_) => false,
        }
    }
}

/// Sends text to a customer through the provider
#[async_trait]
pub trait OutboundSender: Send + Sync + 'static {
    /// Deliver `text` to `recipient` (E.164). Returns the provider message id when known.
    async fn send_text(&self, recipient: &str, text: &str) -> Result<Option<String>, OutboundError>;

    /// Short name for logs and health output.
    fn name(&self) -> &'static str;
}

/// Connection settings for [`HttpSender`]
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub instance: String,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct SendTextResponse {
    #[serde(default)]
    key: Option<SentKey>,
}

#[derive(Debug, Deserialize)]
struct SentKey {
    #[serde(default)]
    id: Option<String>,
}

/// Provider REST sender: `POST {base_url}/message/sendText/{instance}`
pub struct HttpSender {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl HttpSender {
    pub fn new(config: ProviderConfig) -> Result<Self, OutboundError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/message/sendText/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.instance
        )
    }

    async fn send_once(&self, recipient: &str, text: &str) -> Result<Option<String>, OutboundError> {
        let response = self
            .client
            .post(self.endpoint())
            .header("apikey", &self.config.api_key)
            .json(&serde_json::json!({
                "number": recipient.trim_start_matches('+'),
                "text": text,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OutboundError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: SendTextResponse = response.json().await.unwrap_or(SendTextResponse { key: None });
        Ok(parsed.key.and_then(|k| k.id))
    }
}

#[async_trait]
impl OutboundSender for HttpSender {
    async fn send_text(&self, recipient: &str, text: &str) -> Result<Option<String>, OutboundError> {
        use tokio_retry::strategy::{jitter, ExponentialBackoff};
        use tokio_retry::Retry;

        let retry_strategy = ExponentialBackoff::from_millis(2)
            .factor(RETRY_BASE_DELAY_MS / 2)
            .max_delay(RETRY_MAX_DELAY)
            .take(MAX_RETRIES - 1)
            .map(jitter);

        Retry::spawn(retry_strategy, || async {
            let result = self.send_once(recipient, text).await;
            match &result {
                Ok(_) => Ok(result),
                Err(e) if e.is_transient() => {
                    tracing::debug!(error = %e, "Transient provider error - will retry");
                    Err(result)
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Permanent provider error - will not retry");
                    Ok(result)
                }
            }
        })
        .await
        .unwrap_or_else(|e| e)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Sender used when no provider is configured; replies are only logged
#[derive(Debug, Default)]
pub struct LogSender;

#[async_trait]
impl OutboundSender for LogSender {
    async fn send_text(&self, recipient: &str, text: &str) -> Result<Option<String>, OutboundError> {
        tracing::info!(
            recipient = %recipient,
            length = text.len(),
            "No provider configured; reply not sent"
        );
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender(url: &str) -> HttpSender {
        HttpSender::new(ProviderConfig {
            base_url: format!("{url}/"),
            api_key: "secret".to_string(),
            instance: "support".to_string(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_text_returns_provider_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/message/sendText/support")
            .match_header("apikey", "secret")
            .match_body(mockito::Matcher::Json(serde_json::json!({
                "number": "5511999998888",
                "text": "Olá!"
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"key":{"id":"BAE5F00D","fromMe":true},"status":"PENDING"}"#)
            .create_async()
            .await;

        let id = sender(&server.url())
            .send_text("+5511999998888", "Olá!")
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some("BAE5F00D"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/message/sendText/support")
            .with_status(400)
            .with_body("bad number")
            .expect(1)
            .create_async()
            .await;

        let err = sender(&server.url())
            .send_text("+5511999998888", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, OutboundError::Rejected { status: 400, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/message/sendText/support")
            .with_status(503)
            .expect(MAX_RETRIES)
            .create_async()
            .await;

        let err = sender(&server.url())
            .send_text("+5511999998888", "hi")
            .await
            .unwrap_err();
        assert!(err.is_transient());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unparseable_success_body_has_no_id() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/message/sendText/support")
            .with_status(200)
            .with_body("ok")
            .create_async()
            .await;

        let id = sender(&server.url()).send_text("+1", "hi").await.unwrap();
        assert!(id.is_none());
    }

    #[tokio::test]
    async fn test_log_sender_always_succeeds() {
        assert_eq!(LogSender.send_text("+5511999998888", "hi").await.unwrap(), None);
        assert_eq!(LogSender.name(), "log");
    }
}
