//! Twitch PubSub over WebSocket: JSON frames and the PING/LISTEN handshake.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use super::auth::TokenProvider;
use super::error::{Result, TwitchError};
use super::handshake::{CommandGroup, FrameParser, Handshake};

pub const PUBSUB_WS_URL: &str = "wss://pubsub-edge.twitch.tv";

/// Payload of a `MESSAGE` frame
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MessageData {
    pub topic: String,
    /// JSON-encoded inner message
    pub message: String,
}

/// Inbound frame, discriminated by `type`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum PubSubFrame {
    Pong,
    Reconnect,
    Response {
        #[serde(default)]
        nonce: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    Message {
        data: MessageData,
    },
    #[serde(other)]
    Unknown,
}

impl PubSubFrame {
    /// Decode a raw frame; anything unrecognized becomes `Unknown`
    pub fn decode(raw: &Value) -> Self {
        serde_json::from_value(raw.clone()).unwrap_or(PubSubFrame::Unknown)
    }
}

/// PubSub protocol: PING/PONG, then LISTEN on the configured topics
pub struct PubSubProtocol {
    topics: Vec<String>,
    tokens: Arc<dyn TokenProvider>,
}

impl PubSubProtocol {
    pub fn new(topics: Vec<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self { topics, tokens }
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }
}

/// Frames pass through as plain JSON
impl FrameParser<Value> for PubSubProtocol {
    fn parse(&self, frame: &str) -> Result<Vec<Value>> {
        Ok(vec![serde_json::from_str(frame)?])
    }
}

#[async_trait]
impl Handshake<Value> for PubSubProtocol {
    async fn command_groups(&self) -> Result<Vec<CommandGroup<Value>>> {
        let token = self.tokens.access_token().await?;
        let nonce = uuid::Uuid::new_v4().simple().to_string();

        let listen = json!({
            "type": "LISTEN",
            "nonce": nonce,
            "data": {
                "topics": self.topics,
                "auth_token": token,
            }
        });

        Ok(vec![
            CommandGroup::new("ping", vec![json!({"type": "PING"}).into()], |raw: &Value| {
                Ok(PubSubFrame::decode(raw) == PubSubFrame::Pong)
            }),
            CommandGroup::new("listen", vec![listen.into()], move |raw: &Value| {
                match PubSubFrame::decode(raw) {
                    PubSubFrame::Response {
                        nonce: Some(reply),
                        error,
                    } if reply == nonce => match error.filter(|e| !e.is_empty()) {
                        Some(error) => Err(TwitchError::HandshakeRejected(error)),
                        None => Ok(true),
                    },
                    _ => Ok(false),
                }
            }),
        ])
    }
}
