//! Operator alerts (stuck tickets)

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// Writes alerts to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, body: &str) -> anyhow::Result<()> {
        warn!(subject, "ALERT: {}", body);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct AlertPayload<'a> {
    recipient: Option<&'a str>,
    subject: &'a str,
    body: &'a str,
}

/// Posts alerts as JSON to a relay that turns them into mail or chat.
pub struct WebhookNotifier {
    url: String,
    recipient: Option<String>,
    http_client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String, recipient: Option<String>) -> Self {
        Self {
            url,
            recipient,
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, subject: &str, body: &str) -> anyhow::Result<()> {
        let payload = AlertPayload {
            recipient: self.recipient.as_deref(),
            subject,
            body,
        };
        let response = self
            .http_client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("alert webhook request failed: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("alert webhook returned {}: {}", status, text);
        }
        info!(subject, "alert delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[tokio::test]
    async fn test_webhook_posts_alert_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/alerts")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "recipient": "ops@example.com",
                "subject": "Stuck on WEB-12",
            })))
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let notifier = WebhookNotifier::new(format!("{}/alerts", server.url()), Some("ops@example.com".into()));
        notifier.notify("Stuck on WEB-12", "no activity for 30 minutes").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_webhook_error_status_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("POST", "/alerts").with_status(500).create_async().await;

        let notifier = WebhookNotifier::new(format!("{}/alerts", server.url()), None);
        assert!(notifier.notify("s", "b").await.is_err());
    }
}
