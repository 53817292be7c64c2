//! HTTP polling connection: the pull-based analogue of [`WebSocketConnection`].
//!
//! Each tick issues one request; decoded JSON bodies are broadcast to the
//! connection's [`HandlerRegistry`], one subscription per registered handler.
//! `disconnect` closes the stream, so outside subscribers observe the end.
//!
//! [`WebSocketConnection`]: super::websocket::WebSocketConnection

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};

use super::dispatch::{MessageHandler, MessageSource};
use super::error::{Result, TwitchError};
use super::registry::{HandlerId, HandlerRegistry};

/// Shortest interval a polling connection accepts
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1000);

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    Get,
    Delete,
    Post,
    Put,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    fn to_reqwest(self) -> Result<reqwest::Method> {
        match self {
            HttpMethod::Get => Ok(reqwest::Method::GET),
            HttpMethod::Delete => Ok(reqwest::Method::DELETE),
            HttpMethod::Post => Ok(reqwest::Method::POST),
            HttpMethod::Put => Ok(reqwest::Method::PUT),
            HttpMethod::Patch => Ok(reqwest::Method::PATCH),
            HttpMethod::Head | HttpMethod::Options => Err(TwitchError::ConfigError(format!(
                "unsupported polling method {:?}",
                self
            ))),
        }
    }

    /// Whether request data goes in a JSON body rather than the query string
    fn carries_body(self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }
}

/// Static configuration for one polling connection
#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub url: String,
    pub interval: Duration,
    pub at_begin: bool,
    pub method: HttpMethod,
    pub headers: HashMap<String, String>,
    pub data: Option<Value>,
}

impl PollingConfig {
    pub fn new(url: impl Into<String>, interval: Duration) -> Self {
        Self {
            url: url.into(),
            interval,
            at_begin: false,
            method: HttpMethod::Get,
            headers: HashMap::new(),
            data: None,
        }
    }

    pub fn at_begin(mut self, at_begin: bool) -> Self {
        self.at_begin = at_begin;
        self
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Per-request hooks; results are merged over the static configuration
#[async_trait]
pub trait PollSource: Send + Sync {
    async fn headers(&self) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }

    async fn query(&self) -> Result<Vec<(String, String)>> {
        Ok(Vec::new())
    }

    async fn data(&self) -> Result<Option<Value>> {
        Ok(None)
    }
}

/// A source with no per-request overrides
pub struct StaticSource;

impl PollSource for StaticSource {}

/// Everything a single fetch needs, shared with the ticker task
struct Poller {
    name: String,
    config: PollingConfig,
    method: reqwest::Method,
    client: reqwest::Client,
    source: Arc<dyn PollSource>,
    data_tx: RwLock<broadcast::Sender<Value>>,
}

impl Poller {
    fn publish(&self, payload: Value) {
        let data_tx = self.data_tx.read().unwrap_or_else(PoisonError::into_inner);
        let _ = data_tx.send(payload);
    }

    /// End the current stream; later subscribers get a fresh one
    fn close(&self) {
        let (fresh, _) = broadcast::channel(CHANNEL_CAPACITY);
        let mut data_tx = self.data_tx.write().unwrap_or_else(PoisonError::into_inner);
        *data_tx = fresh;
    }

    async fn fetch(&self) -> Result<Value> {
        let mut headers = self.config.headers.clone();
        headers.extend(self.source.headers().await?);

        let data = merge_data(self.config.data.clone(), self.source.data().await?);
        let query = self.source.query().await?;

        let mut request = self.client.request(self.method.clone(), &self.config.url);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !query.is_empty() {
            request = request.query(&query);
        }
        if let Some(data) = data {
            request = if self.config.method.carries_body() {
                request.json(&data)
            } else {
                request.query(&query_pairs(&data)?)
            };
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(TwitchError::HttpError(format!(
                "HTTP {}: {}",
                status, error_text
            )));
        }

        Ok(response.json::<Value>().await?)
    }

    async fn poll_once(&self) {
        match self.fetch().await {
            Ok(payload) => {
                log::trace!("[{}] received payload", self.name);
                self.publish(payload);
            }
            Err(e) => {
                log::error!("[{}] poll of {} failed: {}", self.name, self.config.url, e);
            }
        }
    }
}

/// Object fields from `overrides` replace those in `defaults`; anything else wins outright
fn merge_data(defaults: Option<Value>, overrides: Option<Value>) -> Option<Value> {
    match (defaults, overrides) {
        (Some(Value::Object(mut base)), Some(Value::Object(extra))) => {
            base.extend(extra);
            Some(Value::Object(base))
        }
        (base, None) => base,
        (_, extra) => extra,
    }
}

fn query_pairs(data: &Value) -> Result<Vec<(String, String)>> {
    let Value::Object(fields) = data else {
        return Err(TwitchError::ConfigError(
            "query data must be a JSON object".to_string(),
        ));
    };

    Ok(fields
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect())
}

impl MessageSource<Value> for Poller {
    fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.data_tx
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe()
    }
}

pub struct PollingConnection {
    name: String,
    poller: Arc<Poller>,
    registry: HandlerRegistry<Value>,
    trigger: Arc<Notify>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl PollingConnection {
    /// Validate the configuration. A sub-floor interval or an unsupported
    /// method is rejected here rather than on first tick.
    pub fn new(
        name: impl Into<String>,
        config: PollingConfig,
        source: Arc<dyn PollSource>,
    ) -> Result<Self> {
        let name = name.into();
        if config.interval < MIN_POLL_INTERVAL {
            return Err(TwitchError::ConfigError(format!(
                "{}: polling interval {:?} is below the {:?} minimum",
                name, config.interval, MIN_POLL_INTERVAL
            )));
        }
        let method = config.method.to_reqwest()?;
        let (data_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let poller = Arc::new(Poller {
            name: name.clone(),
            config,
            method,
            client: reqwest::Client::new(),
            source,
            data_tx: RwLock::new(data_tx),
        });

        Ok(Self {
            registry: HandlerRegistry::new(name.clone(), poller.clone()),
            name,
            poller,
            trigger: Arc::new(Notify::new()),
            ticker: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn register(&self, handler: Arc<dyn MessageHandler<Value>>) -> HandlerId {
        self.registry.register(handler).await
    }

    pub async fn remove(&self, id: HandlerId) -> bool {
        self.registry.remove(id).await
    }

    pub async fn is_connected(&self) -> bool {
        self.ticker.lock().await.is_some()
    }

    /// Start ticking. Fetches immediately when configured `at_begin`.
    pub async fn connect(&self) -> Result<()> {
        let mut running = self.ticker.lock().await;
        if running.is_some() {
            log::debug!("[{}] already polling", self.name);
            return Ok(());
        }

        // Subscribed before the first fetch can publish
        self.registry.start().await;

        let poller = self.poller.clone();
        let trigger = self.trigger.clone();
        let interval = poller.config.interval;
        let start = if poller.config.at_begin {
            Instant::now()
        } else {
            Instant::now() + interval
        };
        let ticker = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(start, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticks.tick() => {}
                    _ = trigger.notified() => {}
                }
                poller.poll_once().await;
            }
        });

        *running = Some(ticker);
        log::info!(
            "[{}] polling {} every {:?}",
            self.name,
            self.poller.config.url,
            interval
        );
        Ok(())
    }

    /// Force one out-of-band fetch. Does not wait for the response.
    pub async fn send(&self) -> Result<()> {
        if !self.is_connected().await {
            return Err(TwitchError::NotConnected(self.name.clone()));
        }
        self.trigger.notify_one();
        Ok(())
    }

    /// Stop the timer and the handlers, then close the stream
    pub async fn disconnect(&self) {
        if let Some(ticker) = self.ticker.lock().await.take() {
            ticker.abort();
            self.registry.stop().await;
            self.poller.close();
            log::info!("[{}] stopped polling", self.name);
        }
    }
}

impl MessageSource<Value> for PollingConnection {
    fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.poller.subscribe()
    }
}

impl Drop for PollingConnection {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.get_mut().take() {
            ticker.abort();
        }
    }
}
