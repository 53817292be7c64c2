use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::Framed;

use super::codec::{BusCodec, Packet, MAX_FRAME_LEN};
use super::error::{BusError, Result};
use super::topic::Topic;

/// Messages buffered per subscriber before new ones are dropped
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A connected subscriber as seen by the publisher
struct Peer {
    topics: Vec<Topic>,
    queue: mpsc::Sender<Packet>,
}

type Peers = Arc<RwLock<HashMap<u64, Peer>>>;

struct Bound {
    local_addr: SocketAddr,
    peers: Peers,
    accept_task: JoinHandle<()>,
}

/// The process's single outbound bus socket
pub struct Publisher {
    address: String,
    queue_capacity: usize,
    bound: Mutex<Option<Bound>>,
}

impl Publisher {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            bound: Mutex::new(None),
        }
    }

    /// Limit how many messages wait for a slow subscriber. Further
    /// messages to that subscriber are dropped until it catches up.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Bind the socket. A no-op when already bound.
    pub async fn connect(&self) -> Result<()> {
        let mut bound = self.bound.lock().await;
        if bound.is_some() {
            return Ok(());
        }

        let listener = TcpListener::bind(&self.address).await?;
        let local_addr = listener.local_addr()?;
        let peers: Peers = Arc::new(RwLock::new(HashMap::new()));
        let accept_task = tokio::spawn(accept_loop(listener, peers.clone(), self.queue_capacity));

        log::info!("[bus] publisher bound to {}", local_addr);
        *bound = Some(Bound {
            local_addr,
            peers,
            accept_task,
        });
        Ok(())
    }

    /// Unbind and drop every subscriber connection
    pub async fn disconnect(&self) {
        if let Some(bound) = self.bound.lock().await.take() {
            bound.accept_task.abort();
            bound.peers.write().await.clear();
            log::info!("[bus] publisher on {} closed", bound.local_addr);
        }
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.disconnect().await;
        self.connect().await
    }

    /// The bound address, which differs from the configured one for port 0
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.lock().await.as_ref().map(|b| b.local_addr)
    }

    /// Send `(topic, payload)` to every matching subscriber.
    ///
    /// Returns how many subscribers it was queued for. A payload or topic
    /// too large for the wire is rejected before anything is queued.
    pub async fn send(&self, topic: &Topic, payload: impl Into<Bytes>) -> Result<usize> {
        let payload = payload.into();
        if payload.len() > MAX_FRAME_LEN {
            return Err(BusError::Protocol(format!(
                "payload of {} bytes exceeds the {} byte frame limit",
                payload.len(),
                MAX_FRAME_LEN
            )));
        }
        if topic.to_wire().len() > MAX_FRAME_LEN {
            return Err(BusError::InvalidTopic("topic exceeds the frame limit".to_string()));
        }

        let peers = self
            .bound
            .lock()
            .await
            .as_ref()
            .map(|b| b.peers.clone())
            .ok_or(BusError::NotConnected)?;

        let peers = peers.read().await;
        let mut queued = 0;
        for (id, peer) in peers.iter() {
            if !peer.topics.iter().any(|t| t.matches(topic)) {
                continue;
            }
            let packet = Packet::Data {
                topic: topic.clone(),
                frames: vec![payload.clone()],
            };
            match peer.queue.try_send(packet) {
                Ok(()) => queued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("[bus] subscriber {} is not keeping up, dropped {}", id, topic);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        log::trace!("[bus] {} -> {} subscribers", topic, queued);
        Ok(queued)
    }
}

async fn accept_loop(listener: TcpListener, peers: Peers, queue_capacity: usize) {
    // Dropped with this task, which aborts every connection
    let mut connections = JoinSet::new();
    let next_id = AtomicU64::new(1);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let id = next_id.fetch_add(1, Ordering::Relaxed);
                    log::debug!("[bus] subscriber {} connected from {}", id, addr);
                    connections.spawn(serve_peer(id, stream, peers.clone(), queue_capacity));
                }
                Err(e) => {
                    log::error!("[bus] accept failed: {}", e);
                }
            },
            Some(_) = connections.join_next() => {}
        }
    }
}

async fn serve_peer(id: u64, stream: TcpStream, peers: Peers, queue_capacity: usize) {
    let mut framed = Framed::new(stream, BusCodec);
    let (queue, mut outgoing) = mpsc::channel(queue_capacity);
    peers.write().await.insert(
        id,
        Peer {
            topics: Vec::new(),
            queue,
        },
    );

    loop {
        tokio::select! {
            incoming = framed.next() => match incoming {
                Some(Ok(Packet::Subscribe(topic))) => {
                    if let Some(peer) = peers.write().await.get_mut(&id) {
                        peer.topics.push(topic.clone());
                    }
                    log::debug!("[bus] subscriber {} subscribed to {}", id, topic);
                    // Registered before acknowledging
                    if let Err(e) = framed.send(Packet::Ack(topic)).await {
                        log::warn!("[bus] failed to acknowledge subscriber {}: {}", id, e);
                        break;
                    }
                }
                Some(Ok(other)) => {
                    log::warn!("[bus] subscriber {} sent unexpected {:?}", id, other);
                }
                Some(Err(e)) => {
                    log::warn!("[bus] subscriber {} sent a bad message: {}", id, e);
                    break;
                }
                None => break,
            },
            Some(packet) = outgoing.recv() => match framed.send(packet).await {
                Ok(()) => {}
                // Rejected by the encoder before any bytes were written
                Err(BusError::Protocol(reason)) => {
                    log::warn!("[bus] dropped message for subscriber {}: {}", id, reason);
                }
                Err(e) => {
                    log::warn!("[bus] failed to deliver to subscriber {}: {}", id, e);
                    break;
                }
            }
        }
    }

    peers.write().await.remove(&id);
    log::debug!("[bus] subscriber {} disconnected", id);
}

/// A [`Publisher`] bound to one fixed topic
#[derive(Clone)]
pub struct TopicPublisher {
    publisher: Arc<Publisher>,
    topic: Topic,
}

impl TopicPublisher {
    pub fn new(publisher: Arc<Publisher>, topic: Topic) -> Self {
        Self { publisher, topic }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// JSON-encode `data` and publish it. Strings are encoded too, so
    /// subscribers always decode exactly what was sent.
    pub async fn send<T: Serialize + ?Sized>(&self, data: &T) -> Result<usize> {
        let payload = serde_json::to_vec(data)?;
        self.publisher.send(&self.topic, payload).await
    }

    /// Alias of [`send`](Self::send)
    pub async fn emit<T: Serialize + ?Sized>(&self, data: &T) -> Result<usize> {
        self.send(data).await
    }

    /// Publish an already formatted payload as-is
    pub async fn send_raw(&self, payload: &str) -> Result<usize> {
        self.publisher
            .send(&self.topic, payload.to_string())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_requires_bound_socket() {
        let publisher = Publisher::new("127.0.0.1:0");
        let topic = Topic::parse("a:b").unwrap();
        assert!(matches!(
            publisher.send(&topic, "x").await,
            Err(BusError::NotConnected)
        ));

        publisher.connect().await.unwrap();
        assert!(publisher.local_addr().await.is_some());
        assert_eq!(publisher.send(&topic, "x").await.unwrap(), 0);

        publisher.disconnect().await;
        assert!(publisher.local_addr().await.is_none());
        assert!(publisher.send(&topic, "x").await.is_err());
    }

    #[tokio::test]
    async fn test_topic_publisher_requires_bound_socket() {
        let publisher = Arc::new(Publisher::new("127.0.0.1:0"));
        let topic = TopicPublisher::new(publisher, Topic::parse("twitch:chat").unwrap());
        assert!(topic.send(&json!({"a": 1})).await.is_err());
        assert_eq!(topic.topic().to_wire(), "twitch:chat");
    }

    #[tokio::test]
    async fn test_stalled_subscriber_queue_is_bounded() {
        let publisher = Publisher::new("127.0.0.1:0").with_queue_capacity(4);
        publisher.connect().await.unwrap();
        let addr = publisher.local_addr().await.unwrap();
        let topic = Topic::parse("flood").unwrap();

        // Subscribes, then never reads again
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, BusCodec);
        framed.send(Packet::Subscribe(topic.clone())).await.unwrap();
        assert!(matches!(framed.next().await, Some(Ok(Packet::Ack(_)))));

        let payload = Bytes::from(vec![b'x'; 256 * 1024]);
        let mut dropped = 0;
        for _ in 0..200 {
            if publisher.send(&topic, payload.clone()).await.unwrap() == 0 {
                dropped += 1;
            }
        }
        assert!(dropped > 0);

        // The subscriber is still connected and catches up with what was kept
        let first = framed.next().await.unwrap().unwrap();
        assert!(matches!(first, Packet::Data { .. }));
    }
}
