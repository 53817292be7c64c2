use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::Duration;

use super::auth::{OAuthApi, RawToken, TokenProvider, TwitchAuth};
use super::dispatch::MessageHandler;
use super::error::{Result, TwitchError};
use super::polling::{HttpMethod, PollSource, PollingConfig, PollingConnection};
use super::registry::HandlerId;

const NAME: &str = "app-token";

/// Client-credentials grant parameters for the token endpoint
struct ClientCredentialsGrant {
    client_id: String,
    client_secret: String,
}

#[async_trait]
impl PollSource for ClientCredentialsGrant {
    async fn query(&self) -> Result<Vec<(String, String)>> {
        Ok(vec![
            ("client_id".to_string(), self.client_id.clone()),
            ("client_secret".to_string(), self.client_secret.clone()),
            ("grant_type".to_string(), "client_credentials".to_string()),
        ])
    }
}

/// Lifecycle of the managed token. Never returns to `Pending` once a token has arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenState {
    Pending,
    Active(String),
    Stopped,
}

impl TokenState {
    fn into_token(self) -> Option<String> {
        match self {
            TokenState::Active(token) => Some(token),
            _ => None,
        }
    }
}

/// Adopts every token the endpoint hands out, then revokes the one it replaced
struct TokenAdopter {
    current: Arc<watch::Sender<TokenState>>,
    auth: Arc<TwitchAuth>,
}

#[async_trait]
impl MessageHandler<Value> for TokenAdopter {
    fn name(&self) -> &str {
        "adopt"
    }

    async fn filter(&self, payload: &Value) -> Result<bool> {
        Ok(payload.get("access_token").is_some_and(Value::is_string))
    }

    async fn handle(&self, payload: &Value) -> Result<()> {
        let token: RawToken = serde_json::from_value(payload.clone())?;
        let fresh = token.access_token;

        let previous = self
            .current
            .send_replace(TokenState::Active(fresh.clone()))
            .into_token();
        log::info!("[{}] adopted new application token (expires in {}s)", NAME, token.expires_in);

        if let Some(previous) = previous.filter(|old| *old != fresh) {
            let auth = self.auth.clone();
            tokio::spawn(async move {
                if let Err(e) = auth.revoke(&previous).await {
                    log::warn!("[{}] failed to revoke replaced token: {}", NAME, e);
                }
            });
        }
        Ok(())
    }
}

/// Keeps an application access token fresh by polling the client-credentials grant
pub struct AppTokenManager {
    auth: Arc<TwitchAuth>,
    connection: PollingConnection,
    current: Arc<watch::Sender<TokenState>>,
    handler: Mutex<Option<HandlerId>>,
}

impl AppTokenManager {
    pub fn new(auth: Arc<TwitchAuth>, refresh_interval: Duration) -> Result<Self> {
        let credentials = auth.credentials();
        let grant = ClientCredentialsGrant {
            client_id: credentials.client_id.clone(),
            client_secret: credentials.client_secret.clone(),
        };
        let config = PollingConfig::new(auth.token_url(), refresh_interval).method(HttpMethod::Post);
        let connection = PollingConnection::new(NAME, config, Arc::new(grant))?;
        let (current, _) = watch::channel(TokenState::Pending);

        Ok(Self {
            auth,
            connection,
            current: Arc::new(current),
            handler: Mutex::new(None),
        })
    }

    /// Start the pipeline, then force one immediate fetch
    pub async fn start(&self) -> Result<()> {
        {
            let mut handler = self.handler.lock().await;
            if handler.is_none() {
                let adopter = TokenAdopter {
                    current: self.current.clone(),
                    auth: self.auth.clone(),
                };
                *handler = Some(self.connection.register(Arc::new(adopter)).await);
            }
        }

        self.connection.connect().await?;
        self.connection.send().await
    }

    /// Fetch a new token now instead of waiting for the next tick
    pub async fn refresh_now(&self) -> Result<()> {
        self.connection.send().await
    }

    /// Current token, if one has arrived. Never waits.
    pub fn get(&self) -> Option<String> {
        self.current.borrow().clone().into_token()
    }

    /// Wait until a token has arrived at least once, then return the latest.
    ///
    /// Fails instead of waiting once the manager has been stopped.
    pub async fn get_or_wait(&self) -> Result<String> {
        let mut tokens = self.current.subscribe();
        let state = tokens
            .wait_for(|state| *state != TokenState::Pending)
            .await
            .map_err(|_| TwitchError::ChannelError(format!("{} closed", NAME)))?
            .clone();
        state
            .into_token()
            .ok_or_else(|| TwitchError::AuthError(format!("{} stopped, no token held", NAME)))
    }

    /// Revoke the current token, then stop polling
    pub async fn stop(&self) {
        if let Some(token) = self.current.send_replace(TokenState::Stopped).into_token() {
            match self.auth.revoke(&token).await {
                Ok(()) => log::info!("[{}] revoked application token", NAME),
                Err(e) => log::warn!("[{}] failed to revoke token on stop: {}", NAME, e),
            }
        }

        if let Some(id) = self.handler.lock().await.take() {
            self.connection.remove(id).await;
        }
        self.connection.disconnect().await;
    }
}

#[async_trait]
impl TokenProvider for AppTokenManager {
    async fn access_token(&self) -> Result<String> {
        self.get_or_wait().await
    }
}
