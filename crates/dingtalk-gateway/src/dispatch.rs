//! Handoff to downstream message processing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use dingtalk_gateway_protocol::{GatewayEvent, InboundMessage};

use crate::config::AccountConfig;

/// Everything a processor needs for one unique message.
///
/// Processing runs inside a `dispatch` tracing span carrying the account and
/// message id, so processors log through `tracing` directly.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub account_id: String,
    pub account: Arc<AccountConfig>,
    pub message: InboundMessage,
}

/// The downstream pipeline. Errors are logged by the gateway and go no further.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, request: DispatchRequest) -> anyhow::Result<()>;
}

// ============================================================================
// JsonLinesForwarder
// ============================================================================

/// Writes each message as a [`GatewayEvent`] line for a parent process to consume.
pub struct JsonLinesForwarder<W> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesForwarder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Write one event and flush.
    pub async fn emit(&self, event: &GatewayEvent) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> MessageProcessor for JsonLinesForwarder<W> {
    async fn process(&self, request: DispatchRequest) -> anyhow::Result<()> {
        self.emit(&GatewayEvent::MessageReceived(request.message))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn request(text: &str) -> DispatchRequest {
        DispatchRequest {
            account_id: "default".to_string(),
            account: Arc::new(AccountConfig {
                client_id: "ding-app".to_string(),
                client_secret: "secret".to_string(),
                robot_code: None,
                enabled: true,
            }),
            message: InboundMessage {
                account_id: "default".to_string(),
                message_id: Some("m-1".to_string()),
                msg_type: "text".to_string(),
                text: text.to_string(),
                sender_id: "alice".to_string(),
                sender_nick: Some("Alice".to_string()),
                sender_staff_id: None,
                conversation_id: "cid-1".to_string(),
                conversation_type: Some("1".to_string()),
                conversation_title: None,
                mentions: vec![],
                robot_code: None,
                session_webhook: None,
                received_at: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn forwards_messages_as_json_lines() {
        let forwarder = JsonLinesForwarder::new(Vec::new());
        forwarder.process(request("first")).await.unwrap();
        forwarder.process(request("second")).await.unwrap();
        forwarder
            .emit(&GatewayEvent::Disconnected {
                account_id: "default".to_string(),
                reason: "stopped".to_string(),
            })
            .await
            .unwrap();

        let output = String::from_utf8(forwarder.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["type"], "message_received");
        assert_eq!(lines[0]["data"]["text"], "first");
        assert_eq!(lines[0]["data"]["sender_nick"], "Alice");
        assert_eq!(lines[1]["data"]["text"], "second");
        assert_eq!(lines[2]["type"], "disconnected");
    }
}
