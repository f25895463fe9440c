use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, instrument};

use parley_engine::{OutboundReply, ReplySink, TransportError};

pub struct WebhookConfig {
    pub url: String,
    pub client_id: String,
    pub client_secret: Option<SecretString>,
    pub timeout: Duration,
}

impl std::fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("url", &self.url)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Posts each reply as JSON to the platform's outbound webhook.
pub struct WebhookReplySink {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookReplySink {
    pub fn new(config: WebhookConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TransportError::Unreachable(format!("http client: {e}")))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl ReplySink for WebhookReplySink {
    #[instrument(skip_all, fields(target = ?reply.target))]
    async fn deliver(&self, reply: &OutboundReply) -> Result<(), TransportError> {
        let mut request = self
            .client
            .post(&self.config.url)
            .header("x-client-id", &self.config.client_id)
            .json(reply);
        if let Some(secret) = &self.config.client_secret {
            request = request.bearer_auth(secret.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        debug!(status = status.as_u16(), "reply delivered");
        Ok(())
    }
}
