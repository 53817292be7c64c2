//! Twitch chat over IRC-on-WebSocket: line parsing and the login handshake.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::auth::TokenProvider;
use super::error::{Result, TwitchError};
use super::handshake::{CommandGroup, FrameParser, Handshake};

pub const IRC_WS_URL: &str = "wss://irc-ws.chat.twitch.tv:443";

const CAPABILITIES: &str = "CAP REQ :twitch.tv/tags twitch.tv/commands twitch.tv/membership";

/// A tag value; a key repeated within one line accumulates into a list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Single(String),
    Multiple(Vec<String>),
}

impl TagValue {
    /// First (or only) value
    pub fn first(&self) -> Option<&str> {
        match self {
            TagValue::Single(value) => Some(value.as_str()),
            TagValue::Multiple(values) => values.first().map(String::as_str),
        }
    }

    fn push(&mut self, value: String) {
        match self {
            TagValue::Single(existing) => {
                let existing = std::mem::take(existing);
                *self = TagValue::Multiple(vec![existing, value]);
            }
            TagValue::Multiple(values) => values.push(value),
        }
    }
}

impl PartialEq<&str> for TagValue {
    fn eq(&self, other: &&str) -> bool {
        matches!(self, TagValue::Single(value) if value.as_str() == *other)
    }
}

/// One parsed IRC line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrcMessage {
    pub raw: String,
    pub command: String,
    pub channel: Option<String>,
    pub username: Option<String>,
    pub message: Option<String>,
    pub raw_tags: Option<String>,
    pub tags: Option<HashMap<String, TagValue>>,
}

impl IrcMessage {
    /// Parse a single line (without the trailing CRLF)
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(&['\r', '\n'][..]);

        if line.starts_with("PING") {
            return Self {
                raw: line.to_string(),
                command: "PING".to_string(),
                channel: None,
                username: None,
                message: line.split_once(':').map(|(_, text)| text.to_string()),
                raw_tags: None,
                tags: None,
            };
        }

        let (raw_tags, rest) = match line.strip_prefix('@') {
            Some(tagged) => match tagged.split_once(' ') {
                Some((tags, rest)) => (Some(tags), rest),
                None => (Some(tagged), ""),
            },
            None => (None, line),
        };

        let (username, rest) = match rest.strip_prefix(':') {
            Some(prefixed) => {
                let (prefix, rest) = prefixed.split_once(' ').unwrap_or((prefixed, ""));
                let username = prefix.split_once('!').map(|(user, _)| user.to_string());
                (username, rest)
            }
            None => (None, rest),
        };

        let (command, rest) = rest.split_once(' ').unwrap_or((rest, ""));

        let (channel, rest) = if rest.is_empty() || rest.starts_with(':') {
            (None, rest)
        } else {
            let (channel, rest) = rest.split_once(' ').unwrap_or((rest, ""));
            (Some(channel.to_string()), rest)
        };

        let message = rest.find(':').map(|index| rest[index + 1..].to_string());

        Self {
            raw: line.to_string(),
            command: command.to_string(),
            channel,
            username,
            message,
            raw_tags: raw_tags.map(str::to_string),
            tags: raw_tags.map(parse_tags),
        }
    }

    /// First value of a tag, if present
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.as_ref()?.get(key)?.first()
    }

    pub fn is_command(&self, command: &str) -> bool {
        self.command == command
    }
}

/// Parse `k1=v1;k2=v2`, keeping every value of a repeated key in order
pub fn parse_tags(raw: &str) -> HashMap<String, TagValue> {
    let mut tags: HashMap<String, TagValue> = HashMap::new();

    for pair in raw.split(';').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = unescape_tag_value(value);

        match tags.get_mut(key) {
            Some(existing) => existing.push(value),
            None => {
                tags.insert(key.to_string(), TagValue::Single(value));
            }
        }
    }

    tags
}

/// IRCv3 tag value unescaping
fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }

    out
}

/// Ensure a channel name is lowercase and `#`-prefixed
pub fn normalize_channel(channel: &str) -> String {
    let channel = channel.trim().to_lowercase();
    if channel.starts_with('#') {
        channel
    } else {
        format!("#{}", channel)
    }
}

/// IRC protocol: capability request, login, then join
pub struct IrcProtocol {
    username: String,
    channel: String,
    tokens: Arc<dyn TokenProvider>,
}

impl IrcProtocol {
    pub fn new(username: &str, channel: &str, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            username: username.to_lowercase(),
            channel: normalize_channel(channel),
            tokens,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl FrameParser<IrcMessage> for IrcProtocol {
    fn parse(&self, frame: &str) -> Result<Vec<IrcMessage>> {
        Ok(frame
            .split("\r\n")
            .filter(|line| !line.trim().is_empty())
            .map(IrcMessage::parse)
            .collect())
    }
}

#[async_trait]
impl Handshake<IrcMessage> for IrcProtocol {
    async fn command_groups(&self) -> Result<Vec<CommandGroup<IrcMessage>>> {
        let token = self.tokens.access_token().await?;
        let join_marker = format!("JOIN {}", self.channel);

        Ok(vec![
            CommandGroup::new(
                "capabilities",
                vec![CAPABILITIES.into()],
                |message: &IrcMessage| Ok(message.raw.contains("CAP * ACK")),
            ),
            CommandGroup::new(
                "login",
                vec![
                    format!("PASS oauth:{}", token).into(),
                    format!("NICK {}", self.username).into(),
                ],
                |message: &IrcMessage| {
                    if message.is_command("NOTICE")
                        && message
                            .message
                            .as_deref()
                            .is_some_and(|text| text.contains("authentication failed"))
                    {
                        return Err(TwitchError::HandshakeRejected(message.raw.clone()));
                    }
                    Ok(message.is_command("001"))
                },
            ),
            CommandGroup::new(
                "join",
                vec![format!("JOIN {}", self.channel).into()],
                move |message: &IrcMessage| Ok(message.raw.contains(&join_marker)),
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::twitch::handshake::Outbound;

    struct StaticToken;

    #[async_trait]
    impl TokenProvider for StaticToken {
        async fn access_token(&self) -> Result<String> {
            Ok("abc123".to_string())
        }
    }

    #[test]
    fn test_parse_tagged_privmsg() {
        let msg = IrcMessage::parse(
            "@badges=;color=;display-name=Foo;subscriber=1 :foo!foo@foo.tmi.twitch.tv PRIVMSG #bar :hello world",
        );

        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.channel.as_deref(), Some("#bar"));
        assert_eq!(msg.username.as_deref(), Some("foo"));
        assert_eq!(msg.message.as_deref(), Some("hello world"));
        assert_eq!(msg.raw_tags.as_deref(), Some("badges=;color=;display-name=Foo;subscriber=1"));

        let tags = msg.tags.as_ref().unwrap();
        assert_eq!(tags["subscriber"], "1");
        assert_eq!(tags["display-name"], "Foo");
        assert_eq!(tags["badges"], "");
    }

    #[test]
    fn test_parse_ping() {
        let msg = IrcMessage::parse("PING :tmi.twitch.tv");
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.message.as_deref(), Some("tmi.twitch.tv"));
        assert!(msg.username.is_none());
        assert!(msg.tags.is_none());
    }

    #[test]
    fn test_repeated_tag_accumulates() {
        let tags = parse_tags("emote-only=1;flag=a;flag=b;flag=c");
        assert_eq!(tags["emote-only"], "1");
        assert_eq!(
            tags["flag"],
            TagValue::Multiple(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn test_tag_unescaping() {
        let tags = parse_tags(r"system-msg=5\sraiders\sfrom\:\sfoo;path=a\\b");
        assert_eq!(tags["system-msg"], "5 raiders from; foo");
        assert_eq!(tags["path"], r"a\b");
    }

    #[test]
    fn test_message_keeps_colons_after_first() {
        let msg = IrcMessage::parse(":foo!foo@foo.tmi.twitch.tv PRIVMSG #bar :time is 12:30");
        assert_eq!(msg.message.as_deref(), Some("time is 12:30"));
        assert!(msg.tags.is_none());
    }

    #[test]
    fn test_server_numeric_and_join() {
        let welcome = IrcMessage::parse(":tmi.twitch.tv 001 bot :Welcome, GLHF!");
        assert_eq!(welcome.command, "001");
        assert!(welcome.username.is_none());

        let join = IrcMessage::parse(":bot!bot@bot.tmi.twitch.tv JOIN #bar");
        assert_eq!(join.command, "JOIN");
        assert_eq!(join.channel.as_deref(), Some("#bar"));
        assert!(join.message.is_none());

        let cap = IrcMessage::parse(":tmi.twitch.tv CAP * ACK :twitch.tv/tags twitch.tv/commands");
        assert_eq!(cap.command, "CAP");
        assert_eq!(cap.message.as_deref(), Some("twitch.tv/tags twitch.tv/commands"));
    }

    #[test]
    fn test_frame_with_multiple_lines() {
        let protocol = IrcProtocol::new("Bot", "Bar", Arc::new(StaticToken));
        let messages = protocol
            .parse(":tmi.twitch.tv 001 bot :Welcome\r\n:tmi.twitch.tv 002 bot :Host\r\n")
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].command, "002");
    }

    #[tokio::test]
    async fn test_handshake_groups() {
        let protocol = IrcProtocol::new("Bot", "Bar", Arc::new(StaticToken));
        assert_eq!(protocol.channel(), "#bar");

        let groups = protocol.command_groups().await.unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].commands(), &[Outbound::from(CAPABILITIES)]);
        assert_eq!(
            groups[1].commands(),
            &[Outbound::from("PASS oauth:abc123"), Outbound::from("NICK bot")]
        );

        let ack = IrcMessage::parse(":tmi.twitch.tv CAP * ACK :twitch.tv/tags");
        assert!(groups[0].verify(&ack).unwrap());
        assert!(!groups[1].verify(&ack).unwrap());

        let welcome = IrcMessage::parse(":tmi.twitch.tv 001 bot :Welcome, GLHF!");
        assert!(groups[1].verify(&welcome).unwrap());

        let failed = IrcMessage::parse(":tmi.twitch.tv NOTICE * :Login authentication failed");
        assert!(groups[1].verify(&failed).is_err());

        let joined = IrcMessage::parse(":bot!bot@bot.tmi.twitch.tv JOIN #bar");
        assert!(groups[2].verify(&joined).unwrap());
    }
}
