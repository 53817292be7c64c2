use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use super::error::Result;

/// One outbound directive. Text is sent verbatim, anything else as JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Json(serde_json::Value),
}

impl Outbound {
    /// Serialize to the text frame that goes over the socket
    pub fn to_wire(&self) -> Result<String> {
        match self {
            Outbound::Text(text) => Ok(text.clone()),
            Outbound::Json(value) => Ok(serde_json::to_string(value)?),
        }
    }
}

impl From<&str> for Outbound {
    fn from(text: &str) -> Self {
        Outbound::Text(text.to_string())
    }
}

impl From<String> for Outbound {
    fn from(text: String) -> Self {
        Outbound::Text(text)
    }
}

impl From<serde_json::Value> for Outbound {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(text) => Outbound::Text(text),
            other => Outbound::Json(other),
        }
    }
}

/// Predicate over an inbound message.
///
/// `Ok(true)` completes the group, `Ok(false)` keeps waiting, `Err` is a
/// protocol-level rejection that aborts the handshake.
pub type Verifier<M> = Arc<dyn Fn(&M) -> Result<bool> + Send + Sync>;

/// Ordered commands plus the verifier recognizing the server's confirmation
#[derive(Clone)]
pub struct CommandGroup<M> {
    label: String,
    commands: Vec<Outbound>,
    verifier: Verifier<M>,
}

impl<M> CommandGroup<M> {
    pub fn new<F>(label: impl Into<String>, commands: Vec<Outbound>, verifier: F) -> Self
    where
        F: Fn(&M) -> Result<bool> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            commands,
            verifier: Arc::new(verifier),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn commands(&self) -> &[Outbound] {
        &self.commands
    }

    pub fn verify(&self, message: &M) -> Result<bool> {
        (self.verifier)(message)
    }
}

impl<M> fmt::Debug for CommandGroup<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandGroup")
            .field("label", &self.label)
            .field("commands", &self.commands)
            .finish()
    }
}

/// Supplies the handshake for a protocol.
///
/// Called on every connect, so credentials are fetched fresh each time.
#[async_trait]
pub trait Handshake<M>: Send + Sync {
    async fn command_groups(&self) -> Result<Vec<CommandGroup<M>>>;
}

/// Decodes one inbound text frame into zero or more messages
pub trait FrameParser<M>: Send + Sync {
    fn parse(&self, frame: &str) -> Result<Vec<M>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::twitch::error::TwitchError;
    use serde_json::json;

    #[test]
    fn test_outbound_wire_format() {
        assert_eq!(Outbound::from("NICK bot").to_wire().unwrap(), "NICK bot");
        assert_eq!(
            Outbound::from(json!({"type": "PING"})).to_wire().unwrap(),
            r#"{"type":"PING"}"#
        );
        // JSON strings are already wire-formatted
        assert_eq!(Outbound::from(json!("raw")), Outbound::Text("raw".to_string()));
    }

    #[test]
    fn test_verifier_outcomes() {
        let group: CommandGroup<String> =
            CommandGroup::new("join", vec!["JOIN #bar".into()], |line: &String| {
                if line.contains("msg_banned") {
                    return Err(TwitchError::HandshakeRejected(line.clone()));
                }
                Ok(line.contains("JOIN #bar"))
            });

        assert!(!group.verify(&"PING".to_string()).unwrap());
        assert!(group.verify(&":bot!bot@bot JOIN #bar".to_string()).unwrap());
        assert!(group.verify(&"NOTICE msg_banned".to_string()).is_err());
        assert_eq!(group.commands().len(), 1);
        assert_eq!(group.label(), "join");
    }
}
