use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::irc::{IrcMessage, TagValue};

/// Topic chat messages are published under
pub const CHAT_TOPIC: &str = "twitch:chat";

/// Parent topic of PubSub events; each kind is published one level below
pub const PUBSUB_TOPIC: &str = "twitch:pubsub";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Badge {
    pub set_id: String,
    pub id: String,
    /// Extra detail from `badge-info`, e.g. exact subscription months
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

/// Chat message event published on [`CHAT_TOPIC`]
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChatMessage {
    pub message_id: Option<String>,
    pub channel: String,
    pub username: String,
    pub display_name: String,
    pub user_id: Option<String>,
    pub text: String,
    /// `/me` messages
    pub action: bool,
    pub color: Option<String>,
    pub badges: Vec<Badge>,
    pub bits: Option<u32>,
    pub sent_at: Option<DateTime<Utc>>,
    pub tags: HashMap<String, TagValue>,
}

impl ChatMessage {
    /// Build from a `PRIVMSG` line; anything else yields `None`
    pub fn from_irc(message: &IrcMessage) -> Option<Self> {
        if !message.is_command("PRIVMSG") {
            return None;
        }

        let username = message.username.clone()?;
        let channel = message.channel.clone()?;
        let raw_text = message.message.clone().unwrap_or_default();
        let action_text = raw_text
            .strip_prefix("\u{1}ACTION ")
            .and_then(|t| t.strip_suffix('\u{1}'))
            .map(str::to_string);
        let (text, action) = match action_text {
            Some(text) => (text, true),
            None => (raw_text, false),
        };

        let tag = |key: &str| {
            message
                .tag(key)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        Some(Self {
            message_id: tag("id"),
            channel,
            display_name: tag("display-name").unwrap_or_else(|| username.clone()),
            username,
            user_id: tag("user-id"),
            text,
            action,
            color: tag("color"),
            badges: parse_badges(message.tag("badges"), message.tag("badge-info")),
            bits: tag("bits").and_then(|b| b.parse().ok()),
            sent_at: tag("tmi-sent-ts")
                .and_then(|ts| ts.parse::<i64>().ok())
                .and_then(DateTime::<Utc>::from_timestamp_millis),
            tags: message.tags.clone().unwrap_or_default(),
        })
    }

    pub fn has_badge(&self, set_id: &str) -> bool {
        self.badges.iter().any(|b| b.set_id == set_id)
    }
}

/// Parse `set/id,set/id` badges, attaching `badge-info` detail by set
fn parse_badges(badges: Option<&str>, info: Option<&str>) -> Vec<Badge> {
    let info: HashMap<&str, &str> = info
        .unwrap_or_default()
        .split(',')
        .filter_map(|entry| entry.split_once('/'))
        .collect();

    badges
        .unwrap_or_default()
        .split(',')
        .filter_map(|entry| entry.split_once('/'))
        .map(|(set_id, id)| Badge {
            set_id: set_id.to_string(),
            id: id.to_string(),
            info: info.get(set_id).map(|i| i.to_string()),
        })
        .collect()
}

/// A PubSub `MESSAGE` classified by the topic it arrived on
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PubSubEvent {
    Bits { channel_id: String, message: Value },
    ChannelPoints { channel_id: String, message: Value },
    Subscription { channel_id: String, message: Value },
    Other { topic: String, message: Value },
}

impl PubSubEvent {
    /// `message` is the inner payload, which Twitch sends as a JSON string
    pub fn classify(topic: &str, message: &str) -> Self {
        let message = serde_json::from_str(message)
            .unwrap_or_else(|_| Value::String(message.to_string()));
        let (name, channel_id) = topic.rsplit_once('.').unwrap_or((topic, ""));
        let channel_id = channel_id.to_string();

        match name {
            "channel-bits-events-v1" | "channel-bits-events-v2" | "channel-bits-badge-unlocks" => {
                PubSubEvent::Bits { channel_id, message }
            }
            "channel-points-channel-v1" => PubSubEvent::ChannelPoints { channel_id, message },
            "channel-subscribe-events-v1" => PubSubEvent::Subscription { channel_id, message },
            _ => PubSubEvent::Other {
                topic: topic.to_string(),
                message,
            },
        }
    }

    /// Topic segment this event is published under
    pub fn kind(&self) -> &'static str {
        match self {
            PubSubEvent::Bits { .. } => "bits",
            PubSubEvent::ChannelPoints { .. } => "channel_points",
            PubSubEvent::Subscription { .. } => "subscription",
            PubSubEvent::Other { .. } => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_message_from_privmsg() {
        let line = IrcMessage::parse(
            "@badge-info=subscriber/14;badges=broadcaster/1,subscriber/12;bits=100;color=#FF0000;display-name=Foo;id=abc;tmi-sent-ts=1700000000000;user-id=42 :foo!foo@foo.tmi.twitch.tv PRIVMSG #bar :cheer100 hi",
        );
        let chat = ChatMessage::from_irc(&line).unwrap();

        assert_eq!(chat.username, "foo");
        assert_eq!(chat.display_name, "Foo");
        assert_eq!(chat.channel, "#bar");
        assert_eq!(chat.text, "cheer100 hi");
        assert_eq!(chat.bits, Some(100));
        assert_eq!(chat.user_id.as_deref(), Some("42"));
        assert_eq!(chat.message_id.as_deref(), Some("abc"));
        assert_eq!(chat.sent_at.map(|t| t.timestamp()), Some(1_700_000_000));
        assert!(chat.has_badge("broadcaster"));
        assert_eq!(chat.badges[1].info.as_deref(), Some("14"));
        assert!(!chat.action);
    }

    #[test]
    fn test_action_and_missing_tags() {
        let line = IrcMessage::parse(":foo!foo@foo.tmi.twitch.tv PRIVMSG #bar :\u{1}ACTION waves\u{1}");
        let chat = ChatMessage::from_irc(&line).unwrap();
        assert!(chat.action);
        assert_eq!(chat.text, "waves");
        assert_eq!(chat.display_name, "foo");
        assert!(chat.badges.is_empty());
        assert!(chat.color.is_none());
    }

    #[test]
    fn test_non_privmsg_is_ignored() {
        let join = IrcMessage::parse(":foo!foo@foo.tmi.twitch.tv JOIN #bar");
        assert!(ChatMessage::from_irc(&join).is_none());
    }

    #[test]
    fn test_pubsub_classification() {
        let bits = PubSubEvent::classify("channel-bits-events-v2.123", r#"{"data":{"bits_used":5}}"#);
        assert_eq!(
            bits,
            PubSubEvent::Bits {
                channel_id: "123".to_string(),
                message: json!({"data": {"bits_used": 5}}),
            }
        );
        assert_eq!(bits.kind(), "bits");

        let points = PubSubEvent::classify("channel-points-channel-v1.123", "{}");
        assert_eq!(points.kind(), "channel_points");

        let other = PubSubEvent::classify("whispers.9", "not json");
        assert_eq!(
            other,
            PubSubEvent::Other {
                topic: "whispers.9".to_string(),
                message: json!("not json"),
            }
        );
        assert_eq!(
            serde_json::to_value(&other).unwrap()["kind"],
            json!("other")
        );
    }
}
