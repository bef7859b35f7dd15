//! Live message fan-out for the web UI

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::store::ConversationMessage;

/// Fire-and-forget delivery of persisted messages. Implementations swallow
/// their own failures.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, message: &ConversationMessage);
}

pub struct NoopBroadcaster;

#[async_trait]
impl Broadcaster for NoopBroadcaster {
    async fn broadcast(&self, _message: &ConversationMessage) {}
}

#[derive(Serialize)]
struct BroadcastPayload<'a> {
    ticket_id: i64,
    message: &'a ConversationMessage,
}

pub struct HttpBroadcaster {
    url: String,
    http_client: reqwest::Client,
}

impl HttpBroadcaster {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Broadcaster for HttpBroadcaster {
    async fn broadcast(&self, message: &ConversationMessage) {
        let payload = BroadcastPayload {
            ticket_id: message.ticket_id,
            message,
        };
        match self.http_client.post(&self.url).json(&payload).send().await {
            Ok(response) if !response.status().is_success() => {
                debug!(status = %response.status(), "broadcast rejected");
            }
            Ok(_) => {}
            Err(e) => debug!("broadcast failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MessageRole;
    use chrono::Utc;
    use mockito::Matcher;

    fn message() -> ConversationMessage {
        ConversationMessage {
            id: 7,
            ticket_id: 3,
            session_id: Some(1),
            role: MessageRole::Assistant,
            content: "working on it".into(),
            tool_name: None,
            token_count: 3,
            is_summarized: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_broadcast_posts_message() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/broadcast")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "ticket_id": 3,
                "message": {"id": 7, "content": "working on it"},
            })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        HttpBroadcaster::new(format!("{}/broadcast", server.url()))
            .broadcast(&message())
            .await;
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_broadcast_swallows_unreachable_endpoint() {
        // Port 9 is discard; nothing listens there in the test sandbox.
        HttpBroadcaster::new("http://127.0.0.1:9/broadcast".into())
            .broadcast(&message())
            .await;
    }
}
