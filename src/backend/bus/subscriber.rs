use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::codec::Framed;

use super::codec::{BusCodec, Packet};
use super::error::{BusError, Result};
use super::topic::Topic;
use crate::backend::twitch::MessageSource;

const CHANNEL_CAPACITY: usize = 256;

/// How long `connect` waits for each subscription to be acknowledged
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// One message delivered to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: Topic,
    pub payload: Value,
}

/// Connects to a publisher and re-broadcasts the messages under its topics
pub struct Subscriber {
    name: String,
    address: String,
    topics: Vec<Topic>,
    data_tx: broadcast::Sender<BusMessage>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Subscriber {
    pub fn new(name: impl Into<String>, address: impl Into<String>, topics: Vec<Topic>) -> Self {
        let (data_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            address: address.into(),
            topics,
            data_tx,
            reader: Mutex::new(None),
        }
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    /// Connect and subscribe. Returns once every topic is acknowledged, so
    /// anything published afterwards is delivered.
    pub async fn connect(&self) -> Result<()> {
        let mut reader = self.reader.lock().await;
        if reader.is_some() {
            return Ok(());
        }

        let stream = TcpStream::connect(&self.address).await?;
        let mut framed = Framed::new(stream, BusCodec);

        for topic in &self.topics {
            framed.send(Packet::Subscribe(topic.clone())).await?;
        }

        let mut pending: Vec<Topic> = self.topics.clone();
        while !pending.is_empty() {
            let next = tokio::time::timeout(ACK_TIMEOUT, framed.next())
                .await
                .map_err(|_| BusError::Unacknowledged(pending[0].to_wire()))?;

            match next {
                Some(Ok(Packet::Ack(topic))) => pending.retain(|t| *t != topic),
                Some(Ok(packet)) => self.deliver(packet),
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(BusError::Protocol(
                        "publisher closed during subscribe".to_string(),
                    ))
                }
            }
        }

        log::info!(
            "[{}] subscribed to {} on {}",
            self.name,
            self.topics
                .iter()
                .map(Topic::to_wire)
                .collect::<Vec<_>>()
                .join(", "),
            self.address
        );

        let name = self.name.clone();
        let topics = self.topics.clone();
        let data_tx = self.data_tx.clone();
        *reader = Some(tokio::spawn(async move {
            while let Some(next) = framed.next().await {
                match next {
                    Ok(packet) => Self::forward(&name, &topics, &data_tx, packet),
                    Err(e) => {
                        log::error!("[{}] bus read failed: {}", name, e);
                        break;
                    }
                }
            }
            log::warn!("[{}] publisher went away", name);
        }));
        Ok(())
    }

    pub async fn disconnect(&self) {
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
            log::info!("[{}] unsubscribed", self.name);
        }
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.disconnect().await;
        self.connect().await
    }

    fn deliver(&self, packet: Packet) {
        Self::forward(&self.name, &self.topics, &self.data_tx, packet);
    }

    fn forward(name: &str, topics: &[Topic], data_tx: &broadcast::Sender<BusMessage>, packet: Packet) {
        let Packet::Data { topic, frames } = packet else {
            return;
        };
        if !topics.iter().any(|t| t.matches(&topic)) {
            log::debug!("[{}] dropped message for unsubscribed {}", name, topic);
            return;
        }

        let Some(frame) = frames.first() else {
            log::warn!("[{}] message on {} has no payload", name, topic);
            return;
        };
        // Payloads that are not JSON arrive as a plain string
        let payload = serde_json::from_slice(frame)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(frame).into_owned()));

        let _ = data_tx.send(BusMessage { topic, payload });
    }
}

impl MessageSource<BusMessage> for Subscriber {
    fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.data_tx.subscribe()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}
