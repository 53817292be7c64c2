use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::dispatch::MessageSource;
use super::error::{Result, TwitchError};
use super::handshake::{CommandGroup, FrameParser, Handshake, Outbound};

/// Maximum number of decoded messages buffered per subscriber
const CHANNEL_CAPACITY: usize = 256;

/// How long `disconnect` waits for the close frame to flush
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// WebSocket connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Closing,
    Closed,
}

/// Socket tasks owned by one live connection
struct Session {
    writer: mpsc::UnboundedSender<Message>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

/// A WebSocket that runs an ordered, verified handshake before it is Ready.
///
/// Protocol behavior is injected: a [`FrameParser`] decodes inbound frames and a
/// [`Handshake`] supplies the command groups. Every decoded message, including
/// handshake replies, goes out on one broadcast stream that survives reconnects.
pub struct WebSocketConnection<M: Send + Sync> {
    name: String,
    url: String,
    parser: Arc<dyn FrameParser<M>>,
    handshake: Arc<dyn Handshake<M>>,
    handshake_timeout: Option<Duration>,
    data_tx: broadcast::Sender<M>,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Option<Session>>,
}

impl<M> WebSocketConnection<M>
where
    M: Clone + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        parser: Arc<dyn FrameParser<M>>,
        handshake: Arc<dyn Handshake<M>>,
    ) -> Self {
        let (data_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            name: name.into(),
            url: url.into(),
            parser,
            handshake,
            handshake_timeout: None,
            data_tx,
            state,
            session: Mutex::new(None),
        }
    }

    /// Fail a handshake group that has not verified within `timeout`.
    /// Unset by default: a silent server stalls `connect` until the socket closes.
    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            log::debug!("[{}] {:?} -> {:?}", self.name, previous, next);
        }
    }

    /// Open the socket and run the handshake. Returns once Ready or on failure.
    ///
    /// A failed handshake leaves the connection unusable; call `disconnect`
    /// or `reconnect` to try again.
    pub async fn connect(&self) -> Result<()> {
        let writer = {
            let mut session = self.session.lock().await;
            if session.is_some() {
                return Err(TwitchError::ConfigError(format!(
                    "{} is already connected",
                    self.name
                )));
            }

            self.set_state(ConnectionState::Connecting);
            log::info!("[{}] connecting to {}", self.name, self.url);

            let ws_stream = match connect_async(self.url.as_str()).await {
                Ok((ws_stream, _)) => ws_stream,
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(e.into());
                }
            };

            let (mut write, read) = ws_stream.split();
            let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();

            let name = self.name.clone();
            let writer_task = tokio::spawn(async move {
                while let Some(message) = writer_rx.recv().await {
                    let closing = matches!(message, Message::Close(_));
                    if let Err(e) = write.send(message).await {
                        log::error!("[{}] failed to write frame: {}", name, e);
                        break;
                    }
                    if closing {
                        break;
                    }
                }
            });

            let reader_task = tokio::spawn(Self::read_loop(
                self.name.clone(),
                read,
                self.parser.clone(),
                self.data_tx.clone(),
                writer_tx.clone(),
                self.state.clone(),
            ));

            *session = Some(Session {
                writer: writer_tx.clone(),
                reader_task,
                writer_task,
            });
            writer_tx
        };

        self.set_state(ConnectionState::Handshaking);
        if let Err(e) = self.run_handshake(&writer).await {
            log::error!("[{}] handshake failed: {}", self.name, e);
            return Err(e);
        }

        self.set_state(ConnectionState::Ready);
        log::info!("[{}] ready", self.name);
        Ok(())
    }

    /// Close the socket. Safe to call in any state.
    pub async fn disconnect(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };

        self.set_state(ConnectionState::Closing);
        session.reader_task.abort();
        let _ = session.writer.send(Message::Close(None));
        drop(session.writer);

        let mut writer_task = session.writer_task;
        if tokio::time::timeout(CLOSE_GRACE, &mut writer_task).await.is_err() {
            writer_task.abort();
        }

        self.set_state(ConnectionState::Closed);
        log::info!("[{}] disconnected", self.name);
    }

    /// Disconnect, then connect again from the first handshake group
    pub async fn reconnect(&self) -> Result<()> {
        self.disconnect().await;
        self.connect().await
    }

    /// Queue data for transmission. Strings pass through, everything else is JSON.
    ///
    /// Does not wait for any reply.
    pub async fn send(&self, data: impl Into<Outbound>) -> Result<()> {
        if !self.is_ready() {
            return Err(TwitchError::NotConnected(format!(
                "{} is {:?}",
                self.name,
                self.state()
            )));
        }

        let wire = data.into().to_wire()?;
        let session = self.session.lock().await;
        let session = session
            .as_ref()
            .ok_or_else(|| TwitchError::NotConnected(self.name.clone()))?;

        session
            .writer
            .send(Message::Text(wire.into()))
            .map_err(|_| TwitchError::ConnectionClosed(1006, "writer closed".to_string()))
    }

    async fn run_handshake(&self, writer: &mpsc::UnboundedSender<Message>) -> Result<()> {
        let groups = self.handshake.command_groups().await?;

        for (index, group) in groups.iter().enumerate() {
            // Subscribe before writing so a fast reply cannot slip past
            let mut messages = self.data_tx.subscribe();
            let mut state = self.state.subscribe();

            for command in group.commands() {
                let wire = command.to_wire()?;
                writer.send(Message::Text(wire.into())).map_err(|_| {
                    TwitchError::ConnectionClosed(1006, "writer closed".to_string())
                })?;
            }
            log::debug!(
                "[{}] sent handshake group {} '{}'",
                self.name,
                index + 1,
                group.label()
            );

            let verified = Self::await_verification(group, &mut messages, &mut state);
            match self.handshake_timeout {
                Some(limit) => tokio::time::timeout(limit, verified)
                    .await
                    .map_err(|_| TwitchError::HandshakeTimeout(index + 1))??,
                None => verified.await?,
            }

            log::debug!("[{}] verified group '{}'", self.name, group.label());
        }

        Ok(())
    }

    async fn await_verification(
        group: &CommandGroup<M>,
        messages: &mut broadcast::Receiver<M>,
        state: &mut watch::Receiver<ConnectionState>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                received = messages.recv() => match received {
                    Ok(message) => {
                        if group.verify(&message)? {
                            return Ok(());
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("handshake waiter for '{}' skipped {} messages", group.label(), skipped);
                    }
                    Err(RecvError::Closed) => {
                        return Err(TwitchError::ConnectionClosed(1006, "stream closed".to_string()));
                    }
                },
                changed = state.changed() => {
                    let closed = changed.is_err()
                        || matches!(*state.borrow(), ConnectionState::Closing | ConnectionState::Closed);
                    if closed {
                        return Err(TwitchError::ConnectionClosed(
                            1006,
                            format!("socket closed during '{}'", group.label()),
                        ));
                    }
                }
            }
        }
    }

    async fn read_loop<S>(
        name: String,
        mut read: S,
        parser: Arc<dyn FrameParser<M>>,
        data_tx: broadcast::Sender<M>,
        writer: mpsc::UnboundedSender<Message>,
        state: watch::Sender<ConnectionState>,
    ) where
        S: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => match parser.parse(text.as_str()) {
                    Ok(messages) => {
                        for message in messages {
                            // No receivers is fine; the stream is hot
                            let _ = data_tx.send(message);
                        }
                    }
                    Err(e) => {
                        log::warn!("[{}] failed to parse frame: {}", name, e);
                    }
                },
                Ok(Message::Ping(payload)) => {
                    if writer.send(Message::Pong(payload)).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(frame)) => {
                    let code: u16 = frame.as_ref().map(|f| f.code.into()).unwrap_or(1000);
                    let reason = frame
                        .as_ref()
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "Unknown".to_string());
                    log::warn!("[{}] WebSocket closed: code={}, reason={}", name, code, reason);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("[{}] WebSocket error: {}", name, e);
                    break;
                }
            }
        }

        // Delivery halts here until someone calls reconnect
        state.send_replace(ConnectionState::Closed);
        log::warn!("[{}] socket ended; waiting for an explicit reconnect", name);
    }
}

impl<M> MessageSource<M> for WebSocketConnection<M>
where
    M: Clone + Send + Sync + 'static,
{
    fn subscribe(&self) -> broadcast::Receiver<M> {
        self.data_tx.subscribe()
    }
}

impl<M: Send + Sync> Drop for WebSocketConnection<M> {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.reader_task.abort();
            session.writer_task.abort();
        }
    }
}
