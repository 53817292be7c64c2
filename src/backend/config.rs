use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::time::Duration;

use crate::backend::twitch::{
    ClientCredentials, HttpMethod, Result, TwitchError, IRC_WS_URL, PUBSUB_WS_URL,
};

const CONFIG_FILE: &str = "config.toml";

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub twitch: TwitchSettings,
    #[serde(default)]
    pub bus: BusSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct TwitchSettings {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    /// Bot login
    pub username: String,
    /// Channel to join; defaults to the bot's own
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_irc_url")]
    pub irc_url: String,
    #[serde(default = "default_pubsub_url")]
    pub pubsub_url: String,
    /// May contain `{channel_id}`, filled in once the broadcaster is looked up
    #[serde(default)]
    pub pubsub_topics: Vec<String>,
    #[serde(default = "default_app_token_refresh_secs")]
    pub app_token_refresh_secs: u64,
    #[serde(default)]
    pub handshake_timeout_secs: Option<u64>,
}

impl TwitchSettings {
    pub fn credentials(&self) -> ClientCredentials {
        ClientCredentials {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            redirect_uri: self.redirect_uri.clone(),
            scopes: self.scopes.clone(),
        }
    }

    pub fn channel(&self) -> &str {
        self.channel.as_deref().unwrap_or(&self.username)
    }

    pub fn pubsub_topics_for(&self, channel_id: &str) -> Vec<String> {
        self.pubsub_topics
            .iter()
            .map(|topic| topic.replace("{channel_id}", channel_id))
            .collect()
    }

    pub fn app_token_refresh(&self) -> Duration {
        Duration::from_secs(self.app_token_refresh_secs)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BusSettings {
    /// `host:port` the publisher binds
    pub address: String,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:5555".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StorageSettings {
    /// Relative paths are resolved against the project root
    pub token_file: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            token_file: PathBuf::from("tokens.json"),
        }
    }
}

/// One Helix endpoint polled and relayed onto the bus
#[derive(Deserialize, Debug, Clone)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_feed_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub at_begin: bool,
    #[serde(default = "default_feed_method")]
    pub method: HttpMethod,
    pub topic: String,
    /// Values may contain `{channel_id}`
    #[serde(default)]
    pub query: BTreeMap<String, String>,
}

impl FeedConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_redirect_uri() -> String {
    "http://localhost:3000".to_string()
}

fn default_irc_url() -> String {
    IRC_WS_URL.to_string()
}

fn default_pubsub_url() -> String {
    PUBSUB_WS_URL.to_string()
}

fn default_app_token_refresh_secs() -> u64 {
    3600
}

fn default_feed_interval_ms() -> u64 {
    60_000
}

fn default_feed_method() -> HttpMethod {
    HttpMethod::Get
}

impl AppConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            TwitchError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Resolve relative storage paths against `root`
    fn resolve_paths(mut self, root: &Path) -> Self {
        if self.storage.token_file.is_relative() {
            self.storage.token_file = root.join(&self.storage.token_file);
        }
        self
    }
}

/// Load `config.toml` from the project root
pub fn load_config() -> Result<AppConfig> {
    let project_root = project_root::get_project_root()
        .map_err(|e| TwitchError::ConfigError(format!("cannot locate project root: {}", e)))?;
    let config = AppConfig::from_file(project_root.join(CONFIG_FILE))?;
    Ok(config.resolve_paths(&project_root))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[twitch]
client_id = "cid"
client_secret = "secret"
redirect_uri = "http://localhost:3000/callback"
username = "bot"
channel = "bar"
scopes = ["chat:read", "chat:edit", "bits:read"]
pubsub_topics = ["channel-bits-events-v2.{channel_id}"]
app_token_refresh_secs = 1800
handshake_timeout_secs = 30

[bus]
address = "0.0.0.0:6000"

[storage]
token_file = "/var/lib/yambus/tokens.json"

[[feeds]]
name = "streams"
url = "https://api.twitch.tv/helix/streams"
interval_ms = 30000
at_begin = true
topic = "twitch:helix:streams"
query = { user_id = "{channel_id}" }

[[feeds]]
name = "follows"
url = "https://api.twitch.tv/helix/channels/followers"
topic = "twitch:helix:followers"
"#;

    #[test]
    fn test_full_config() {
        let config = AppConfig::from_toml(FULL).unwrap();

        assert_eq!(config.twitch.channel(), "bar");
        assert_eq!(config.twitch.scopes.len(), 3);
        assert_eq!(
            config.twitch.pubsub_topics_for("123"),
            vec!["channel-bits-events-v2.123"]
        );
        assert_eq!(config.twitch.app_token_refresh(), Duration::from_secs(1800));
        assert_eq!(config.twitch.handshake_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.bus.address, "0.0.0.0:6000");

        assert_eq!(config.feeds.len(), 2);
        assert!(config.feeds[0].at_begin);
        assert_eq!(config.feeds[0].query["user_id"], "{channel_id}");
        assert_eq!(config.feeds[1].interval(), Duration::from_secs(60));
        assert_eq!(config.feeds[1].method, HttpMethod::Get);
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_toml(
            r#"
[twitch]
client_id = "cid"
client_secret = "secret"
username = "bot"
"#,
        )
        .unwrap();

        assert_eq!(config.twitch.channel(), "bot");
        assert_eq!(config.twitch.irc_url, IRC_WS_URL);
        assert_eq!(config.twitch.pubsub_url, PUBSUB_WS_URL);
        assert!(config.twitch.handshake_timeout().is_none());
        assert_eq!(config.bus.address, "127.0.0.1:5555");
        assert!(config.feeds.is_empty());

        let resolved = config.resolve_paths(Path::new("/srv/app"));
        assert_eq!(resolved.storage.token_file, PathBuf::from("/srv/app/tokens.json"));
    }

    #[test]
    fn test_invalid_config_is_config_error() {
        assert!(matches!(
            AppConfig::from_toml("[twitch]\nclient_id = 5"),
            Err(TwitchError::ConfigError(_))
        ));
        assert!(matches!(
            AppConfig::from_file("/definitely/not/here.toml"),
            Err(TwitchError::ConfigError(_))
        ));
    }
}
