//! Topic-addressed publish/subscribe bus over TCP.
//!
//! One [`Publisher`] per process binds a socket; [`Subscriber`]s connect to it
//! and subscribe by topic-segment prefix. Filtering happens at the publisher,
//! so a subscriber only ever receives the topics it asked for.

mod codec;
mod error;
mod publisher;
mod subscriber;
mod topic;

pub use codec::{BusCodec, Packet};
pub use error::{BusError, Result};
pub use publisher::{Publisher, TopicPublisher};
pub use subscriber::{BusMessage, Subscriber};
pub use topic::{Topic, SEPARATOR};
