use anyhow::Context;

/// Downstream delivery of a serialized alert trigger.
///
/// Implementations need not deduplicate: the payload carries an
/// `idempotency_key` field and receivers are expected to use it.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn deliver(&self, payload: &serde_json::Value) -> anyhow::Result<()>;
}

/// POSTs each payload as JSON to a webhook endpoint.
pub struct WebhookTransport {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl WebhookTransport {
    pub fn new(endpoint: url::Url, timeout: std::time::Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building webhook client")?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait::async_trait]
impl Transport for WebhookTransport {
    async fn deliver(&self, payload: &serde_json::Value) -> anyhow::Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(payload)
            .send()
            .await
            .with_context(|| format!("POST {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("webhook returned {status}");
        }
        Ok(())
    }
}
