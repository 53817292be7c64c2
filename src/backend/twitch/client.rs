//! Protocol managers: wire a connection to its dispatch registrations and
//! relay decoded events onto the bus.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use super::dispatch::{ConnectionManager, MessageHandler, MessageSource};
use super::error::Result;
use super::irc::{IrcMessage, IrcProtocol};
use super::messages::{ChatMessage, PubSubEvent, CHAT_TOPIC, PUBSUB_TOPIC};
use super::pubsub::{PubSubFrame, PubSubProtocol};
use super::websocket::WebSocketConnection;
use crate::backend::bus::{Publisher, Topic, TopicPublisher};

/// PubSub drops connections that stay silent for 5 minutes
const PUBSUB_KEEPALIVE: Duration = Duration::from_secs(4 * 60);

/// Answers server PINGs so the chat connection stays open
struct PingResponder {
    connection: Arc<WebSocketConnection<IrcMessage>>,
}

#[async_trait]
impl MessageHandler<IrcMessage> for PingResponder {
    fn name(&self) -> &str {
        "pong"
    }

    async fn filter(&self, message: &IrcMessage) -> Result<bool> {
        Ok(message.is_command("PING") && self.connection.is_ready())
    }

    async fn handle(&self, message: &IrcMessage) -> Result<()> {
        let server = message.message.as_deref().unwrap_or("tmi.twitch.tv");
        self.connection.send(format!("PONG :{}", server)).await
    }
}

/// Publishes every PRIVMSG as a [`ChatMessage`]
struct ChatRelay {
    topic: TopicPublisher,
}

#[async_trait]
impl MessageHandler<IrcMessage> for ChatRelay {
    fn name(&self) -> &str {
        "chat-relay"
    }

    async fn filter(&self, message: &IrcMessage) -> Result<bool> {
        Ok(message.is_command("PRIVMSG"))
    }

    async fn handle(&self, message: &IrcMessage) -> Result<()> {
        if let Some(chat) = ChatMessage::from_irc(message) {
            log::debug!("[irc] {} {}: {}", chat.channel, chat.display_name, chat.text);
            self.topic.emit(&chat).await?;
        }
        Ok(())
    }
}

/// Chat over IRC: keepalive plus relay of chat messages to the bus
pub struct ChatClient {
    channel: String,
    connection: Arc<WebSocketConnection<IrcMessage>>,
    managers: Vec<ConnectionManager<IrcMessage>>,
}

impl ChatClient {
    pub fn new(
        url: &str,
        protocol: IrcProtocol,
        publisher: Arc<Publisher>,
        handshake_timeout: Option<Duration>,
    ) -> Result<Self> {
        let channel = protocol.channel().to_string();
        let protocol = Arc::new(protocol);
        let connection = Arc::new(
            WebSocketConnection::new("irc", url, protocol.clone(), protocol)
                .with_handshake_timeout(handshake_timeout),
        );
        let source: Arc<dyn MessageSource<IrcMessage>> = connection.clone();

        let topic = TopicPublisher::new(publisher, Topic::parse(CHAT_TOPIC)?);
        let managers = vec![
            ConnectionManager::new(
                "irc",
                source.clone(),
                Arc::new(PingResponder {
                    connection: connection.clone(),
                }),
            ),
            ConnectionManager::new("irc", source, Arc::new(ChatRelay { topic })),
        ];

        Ok(Self {
            channel,
            connection,
            managers,
        })
    }

    pub fn connection(&self) -> &Arc<WebSocketConnection<IrcMessage>> {
        &self.connection
    }

    /// Start the registrations, then connect and join
    pub async fn start(&self) -> Result<()> {
        for manager in &self.managers {
            manager.start().await;
        }
        self.connection.connect().await
    }

    /// Send a chat message to the joined channel
    pub async fn say(&self, text: &str) -> Result<()> {
        self.connection
            .send(format!("PRIVMSG {} :{}", self.channel, text))
            .await
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.connection.reconnect().await
    }

    pub async fn stop(&self) {
        for manager in &self.managers {
            manager.stop().await;
        }
        self.connection.disconnect().await;
    }
}

/// Publishes `MESSAGE` frames under `twitch:pubsub:<kind>`
struct PubSubRelay {
    publisher: Arc<Publisher>,
    base: Topic,
}

#[async_trait]
impl MessageHandler<Value> for PubSubRelay {
    fn name(&self) -> &str {
        "pubsub-relay"
    }

    async fn filter(&self, raw: &Value) -> Result<bool> {
        Ok(raw.get("type").and_then(Value::as_str) == Some("MESSAGE"))
    }

    async fn handle(&self, raw: &Value) -> Result<()> {
        let PubSubFrame::Message { data } = PubSubFrame::decode(raw) else {
            log::warn!("[pubsub] malformed MESSAGE frame: {}", raw);
            return Ok(());
        };

        let event = PubSubEvent::classify(&data.topic, &data.message);
        let topic = self.base.child(event.kind())?;
        let payload = serde_json::to_vec(&event)?;
        self.publisher.send(&topic, payload).await?;
        Ok(())
    }
}

/// Reports server-requested reconnects; acting on them is up to the caller
struct ReconnectNotice;

#[async_trait]
impl MessageHandler<Value> for ReconnectNotice {
    fn name(&self) -> &str {
        "reconnect-notice"
    }

    async fn filter(&self, raw: &Value) -> Result<bool> {
        Ok(PubSubFrame::decode(raw) == PubSubFrame::Reconnect)
    }

    async fn handle(&self, _raw: &Value) -> Result<()> {
        log::warn!("[pubsub] server requested a reconnect");
        Ok(())
    }
}

/// PubSub: LISTEN on channel topics and relay their events to the bus
pub struct PubSubClient {
    connection: Arc<WebSocketConnection<Value>>,
    managers: Vec<ConnectionManager<Value>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl PubSubClient {
    pub fn new(
        url: &str,
        protocol: PubSubProtocol,
        publisher: Arc<Publisher>,
        handshake_timeout: Option<Duration>,
    ) -> Result<Self> {
        let protocol = Arc::new(protocol);
        let connection = Arc::new(
            WebSocketConnection::new("pubsub", url, protocol.clone(), protocol)
                .with_handshake_timeout(handshake_timeout),
        );
        let source: Arc<dyn MessageSource<Value>> = connection.clone();

        let relay = PubSubRelay {
            publisher,
            base: Topic::parse(PUBSUB_TOPIC)?,
        };
        let managers = vec![
            ConnectionManager::new("pubsub", source.clone(), Arc::new(relay)),
            ConnectionManager::new("pubsub", source, Arc::new(ReconnectNotice)),
        ];

        Ok(Self {
            connection,
            managers,
            keepalive: Mutex::new(None),
        })
    }

    pub fn connection(&self) -> &Arc<WebSocketConnection<Value>> {
        &self.connection
    }

    pub async fn start(&self) -> Result<()> {
        for manager in &self.managers {
            manager.start().await;
        }
        self.connection.connect().await?;

        let connection = self.connection.clone();
        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(PUBSUB_KEEPALIVE);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                if let Err(e) = connection.send(json!({"type": "PING"})).await {
                    log::warn!("[pubsub] keepalive failed: {}", e);
                }
            }
        });
        if let Some(previous) = self.keepalive.lock().await.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.connection.reconnect().await
    }

    pub async fn stop(&self) {
        if let Some(task) = self.keepalive.lock().await.take() {
            task.abort();
        }
        for manager in &self.managers {
            manager.stop().await;
        }
        self.connection.disconnect().await;
    }
}
