//! Helix REST feeds polled with the application token and relayed to the bus.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::auth::TokenProvider;
use super::dispatch::MessageHandler;
use super::error::Result;
use super::polling::{PollSource, PollingConfig, PollingConnection};
use crate::backend::bus::{Publisher, Topic, TopicPublisher};
use crate::backend::config::FeedConfig;

/// Client-id authenticated request hooks
pub struct HelixSource {
    client_id: String,
    tokens: Arc<dyn TokenProvider>,
    query: Vec<(String, String)>,
}

impl HelixSource {
    pub fn new(
        client_id: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
        query: Vec<(String, String)>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            tokens,
            query,
        }
    }
}

#[async_trait]
impl PollSource for HelixSource {
    /// Waits for the first application token
    async fn headers(&self) -> Result<HashMap<String, String>> {
        let token = self.tokens.access_token().await?;
        Ok(HashMap::from([
            ("Client-ID".to_string(), self.client_id.clone()),
            ("Authorization".to_string(), format!("Bearer {}", token)),
        ]))
    }

    async fn query(&self) -> Result<Vec<(String, String)>> {
        Ok(self.query.clone())
    }
}

struct FeedRelay {
    name: String,
    topic: TopicPublisher,
}

#[async_trait]
impl MessageHandler<Value> for FeedRelay {
    fn name(&self) -> &str {
        &self.name
    }

    async fn filter(&self, payload: &Value) -> Result<bool> {
        Ok(!payload.is_null())
    }

    async fn handle(&self, payload: &Value) -> Result<()> {
        self.topic.send(payload).await?;
        Ok(())
    }
}

/// A polled Helix endpoint whose responses are published on one topic
pub struct HelixFeed {
    connection: PollingConnection,
}

impl HelixFeed {
    pub async fn new(
        feed: &FeedConfig,
        client_id: &str,
        channel_id: &str,
        tokens: Arc<dyn TokenProvider>,
        publisher: Arc<Publisher>,
    ) -> Result<Self> {
        let query = feed
            .query
            .iter()
            .map(|(key, value)| (key.clone(), value.replace("{channel_id}", channel_id)))
            .collect();
        let config = PollingConfig::new(&feed.url, feed.interval())
            .at_begin(feed.at_begin)
            .method(feed.method);
        let connection = PollingConnection::new(
            format!("helix:{}", feed.name),
            config,
            Arc::new(HelixSource::new(client_id, tokens, query)),
        )?;

        let relay = FeedRelay {
            name: format!("relay:{}", feed.topic),
            topic: TopicPublisher::new(publisher, Topic::parse(&feed.topic)?),
        };
        connection.register(Arc::new(relay)).await;

        Ok(Self { connection })
    }

    pub fn name(&self) -> &str {
        self.connection.name()
    }

    pub async fn start(&self) -> Result<()> {
        self.connection.connect().await
    }

    /// Poll now instead of waiting for the next tick
    pub async fn refresh(&self) -> Result<()> {
        self.connection.send().await
    }

    pub async fn stop(&self) {
        self.connection.disconnect().await;
    }
}
