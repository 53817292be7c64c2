//! Twitch transports and credentials
//!
//! Connections to Twitch's two WebSocket protocols (IRC chat and PubSub) and
//! its polled REST endpoints, plus the OAuth credential managers they depend on:
//! - A filter-and-dispatch pipeline shared by every protocol manager
//! - WebSocket connections with an ordered, verified handshake
//! - HTTP polling connections with the same handler contract
//! - Application and user token lifecycle management
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use yambus::backend::bus::Publisher;
//! use yambus::backend::twitch::{ChatClient, IrcProtocol, TokenProvider, IRC_WS_URL};
//!
//! async fn run(tokens: Arc<dyn TokenProvider>) -> yambus::backend::twitch::Result<()> {
//!     let publisher = Arc::new(Publisher::new("127.0.0.1:5555"));
//!     publisher.connect().await?;
//!
//!     let protocol = IrcProtocol::new("my_bot", "my_channel", tokens);
//!     let chat = ChatClient::new(IRC_WS_URL, protocol, publisher, None)?;
//!
//!     // Chat messages are now published on `twitch:chat`
//!     chat.start().await?;
//!     Ok(())
//! }
//! ```

mod app_token;
mod auth;
mod client;
mod dispatch;
mod error;
mod handshake;
mod helix;
mod irc;
mod messages;
mod polling;
mod pubsub;
mod registry;
mod user_token;
mod websocket;

// Re-export public types
pub use app_token::AppTokenManager;
pub use auth::{
    AugmentedToken, ClientCredentials, OAuthApi, RawToken, Scopes, TokenProvider, TwitchAuth,
    ValidatedToken,
};
pub use client::{ChatClient, PubSubClient};
pub use dispatch::{ConnectionManager, FnHandler, MessageHandler, MessageSource};
pub use error::{Result, TwitchError};
pub use handshake::{CommandGroup, FrameParser, Handshake, Outbound, Verifier};
pub use helix::{HelixFeed, HelixSource};
pub use irc::{normalize_channel, parse_tags, IrcMessage, IrcProtocol, TagValue, IRC_WS_URL};
pub use messages::{Badge, ChatMessage, PubSubEvent, CHAT_TOPIC, PUBSUB_TOPIC};
pub use polling::{
    HttpMethod, PollSource, PollingConfig, PollingConnection, StaticSource, MIN_POLL_INTERVAL,
};
pub use pubsub::{MessageData, PubSubFrame, PubSubProtocol, PUBSUB_WS_URL};
pub use registry::{HandlerId, HandlerRegistry};
pub use user_token::{
    extract_code, AuthPrompt, TokenStore, UserTokenManager, UserTokenProvider, MAX_AUTH_CYCLES,
};
pub use websocket::{ConnectionState, WebSocketConnection};
