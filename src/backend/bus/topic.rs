use std::fmt;
use std::str::FromStr;

use super::error::{BusError, Result};

/// Joins topic segments on the wire
pub const SEPARATOR: char = ':';

/// A bus routing key made of one or more non-empty segments
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(Vec<String>);

impl Topic {
    pub fn new<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(BusError::InvalidTopic(String::new()));
        }
        if let Some(bad) = segments
            .iter()
            .find(|s| s.is_empty() || s.contains(SEPARATOR))
        {
            return Err(BusError::InvalidTopic(bad.clone()));
        }
        Ok(Self(segments))
    }

    /// Split a `:`-joined wire topic
    pub fn parse(wire: &str) -> Result<Self> {
        if wire.is_empty() {
            return Err(BusError::InvalidTopic(wire.to_string()));
        }
        Self::new(wire.split(SEPARATOR))
            .map_err(|_| BusError::InvalidTopic(wire.to_string()))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn to_wire(&self) -> String {
        self.0.join(&SEPARATOR.to_string())
    }

    /// A topic one level below this one
    pub fn child(&self, segment: &str) -> Result<Self> {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Self::new(segments)
    }

    /// True when `topic` starts with every segment of `self`
    pub fn matches(&self, topic: &Topic) -> bool {
        topic.0.len() >= self.0.len() && topic.0.iter().zip(&self.0).all(|(a, b)| a == b)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

impl FromStr for Topic {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
