//! User credential lifecycle: validate, refresh, then re-authorize.

use async_trait::async_trait;
use reqwest::Url;
use std::sync::Arc;

use super::auth::{AugmentedToken, OAuthApi, RawToken, TokenProvider};
use super::error::{Result, TwitchError};

/// Validate/refresh/re-authorize cycles attempted before giving up
pub const MAX_AUTH_CYCLES: usize = 3;

const NAME: &str = "user-token";

/// Persistent per-user token storage
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self, username: &str) -> Result<Option<AugmentedToken>>;

    /// Persist a freshly issued token, returning the stored record
    async fn store(&self, username: &str, token: RawToken) -> Result<AugmentedToken>;

    /// Replace the user's record with a null token
    async fn forget(&self, username: &str) -> Result<()>;
}

/// Interactive step of the authorization-code flow
#[async_trait]
pub trait AuthPrompt: Send + Sync {
    /// Show `authorize_url` and return what the user pastes back
    async fn ask(&self, username: &str, authorize_url: &str) -> Result<String>;
}

pub struct UserTokenManager {
    auth: Arc<dyn OAuthApi>,
    store: Arc<dyn TokenStore>,
    prompt: Arc<dyn AuthPrompt>,
}

impl UserTokenManager {
    pub fn new(
        auth: Arc<dyn OAuthApi>,
        store: Arc<dyn TokenStore>,
        prompt: Arc<dyn AuthPrompt>,
    ) -> Self {
        Self {
            auth,
            store,
            prompt,
        }
    }

    /// Return a validated token for `username`, refreshing or re-authorizing as needed.
    ///
    /// Gives up with [`TwitchError::AuthExhausted`] after [`MAX_AUTH_CYCLES`] cycles.
    pub async fn get(&self, username: &str) -> Result<AugmentedToken> {
        for cycle in 1..=MAX_AUTH_CYCLES {
            let stored = self.obtain(username).await?;
            let Some(raw) = stored.token.clone() else {
                return Err(TwitchError::AuthError(format!(
                    "no token obtained for {}",
                    username
                )));
            };

            if self.auth.validate(&raw.access_token).await?.is_some() {
                log::debug!("[{}] stored token for {} is valid", NAME, username);
                return Ok(stored);
            }

            log::info!("[{}] token for {} is invalid, refreshing", NAME, username);
            match self.try_refresh(username, &raw).await {
                Some(refreshed) => {
                    if self.auth.validate(&refreshed.access_token).await?.is_some() {
                        log::info!("[{}] refreshed token for {}", NAME, username);
                        return self.store.store(username, refreshed).await;
                    }

                    self.store.forget(username).await?;
                    if let Err(e) = self.auth.revoke(&refreshed.access_token).await {
                        log::warn!("[{}] failed to revoke refreshed token: {}", NAME, e);
                    }
                }
                None => self.store.forget(username).await?,
            }

            log::warn!(
                "[{}] refresh for {} failed, re-authorizing (cycle {}/{})",
                NAME,
                username,
                cycle,
                MAX_AUTH_CYCLES
            );
        }

        log::error!("[{}] giving up on {}", NAME, username);
        Err(TwitchError::AuthExhausted(username.to_string(), MAX_AUTH_CYCLES))
    }

    /// The stored token, or a new one from the authorization-code flow
    async fn obtain(&self, username: &str) -> Result<AugmentedToken> {
        match self.store.get(username).await? {
            Some(stored) if !stored.is_forgotten() => Ok(stored),
            _ => self.authorize(username).await,
        }
    }

    async fn try_refresh(&self, username: &str, raw: &RawToken) -> Option<RawToken> {
        let refresh_token = raw.refresh_token.as_deref()?;
        match self.auth.refresh(refresh_token).await {
            Ok(token) => Some(token),
            Err(e) => {
                log::warn!("[{}] refresh for {} failed: {}", NAME, username, e);
                None
            }
        }
    }

    /// Run the authorization-code flow and persist the result
    pub async fn authorize(&self, username: &str) -> Result<AugmentedToken> {
        let state = uuid::Uuid::new_v4().simple().to_string();
        let url = self.auth.authorize_url(&state);

        log::info!("[{}] authorization required for {}", NAME, username);
        let answer = self.prompt.ask(username, &url).await?;
        let code = extract_code(&answer, &state)?;

        let token = self.auth.exchange_code(&code).await?;
        self.store.store(username, token).await
    }
}

/// Accept either a bare code or the full redirect URL
pub fn extract_code(input: &str, expected_state: &str) -> Result<String> {
    let input = input.trim();

    if let Ok(url) = Url::parse(input) {
        let mut code = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.to_string()),
                "state" if value != expected_state => {
                    return Err(TwitchError::AuthError("state mismatch".to_string()));
                }
                "error" => {
                    return Err(TwitchError::AuthError(format!("authorization denied: {}", value)));
                }
                _ => {}
            }
        }
        return code.ok_or_else(|| TwitchError::AuthError("redirect URL has no code".to_string()));
    }

    if input.is_empty() || input.contains(char::is_whitespace) {
        return Err(TwitchError::AuthError(format!("not an authorization code: {:?}", input)));
    }
    Ok(input.to_string())
}

/// A [`UserTokenManager`] bound to one login, usable wherever a token is needed
pub struct UserTokenProvider {
    manager: Arc<UserTokenManager>,
    username: String,
}

impl UserTokenProvider {
    pub fn new(manager: Arc<UserTokenManager>, username: impl Into<String>) -> Self {
        Self {
            manager,
            username: username.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for UserTokenProvider {
    async fn access_token(&self) -> Result<String> {
        let token = self.manager.get(&self.username).await?;
        token
            .access_token()
            .map(str::to_string)
            .ok_or_else(|| TwitchError::AuthError(format!("no token for {}", self.username)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::twitch::auth::{Scopes, ValidatedToken};
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn raw(access: &str, refresh: &str) -> RawToken {
        RawToken {
            access_token: access.to_string(),
            refresh_token: Some(refresh.to_string()),
            expires_in: 3600,
            scope: Scopes(vec!["chat:read".to_string()]),
            token_type: Some("bearer".to_string()),
        }
    }

    #[derive(Default)]
    struct Calls {
        validate: Vec<String>,
        refresh: Vec<String>,
        revoke: Vec<String>,
        exchange: Vec<String>,
        store: Vec<String>,
        forget: Vec<String>,
        prompt: usize,
    }

    type SharedCalls = Arc<Mutex<Calls>>;

    struct FakeApi {
        calls: SharedCalls,
        valid: Vec<&'static str>,
        refreshed: RawToken,
        exchanged: RawToken,
    }

    #[async_trait]
    impl OAuthApi for FakeApi {
        fn authorize_url(&self, state: &str) -> String {
            format!("https://auth.test/authorize?state={}", state)
        }

        async fn exchange_code(&self, code: &str) -> Result<RawToken> {
            self.calls.lock().unwrap().exchange.push(code.to_string());
            Ok(self.exchanged.clone())
        }

        async fn refresh(&self, refresh_token: &str) -> Result<RawToken> {
            self.calls.lock().unwrap().refresh.push(refresh_token.to_string());
            Ok(self.refreshed.clone())
        }

        async fn validate(&self, access_token: &str) -> Result<Option<ValidatedToken>> {
            self.calls.lock().unwrap().validate.push(access_token.to_string());
            let valid = self.valid.iter().any(|token| *token == access_token);
            Ok(valid.then(|| ValidatedToken {
                client_id: "cid".to_string(),
                login: Some("bot".to_string()),
                scopes: Scopes::default(),
                user_id: Some("1".to_string()),
                expires_in: 3600,
            }))
        }

        async fn revoke(&self, access_token: &str) -> Result<()> {
            self.calls.lock().unwrap().revoke.push(access_token.to_string());
            Ok(())
        }

        async fn user_id(&self, _login: &str, _app_token: &str) -> Result<String> {
            Ok("1".to_string())
        }
    }

    struct MemoryStore {
        calls: SharedCalls,
        tokens: Mutex<HashMap<String, AugmentedToken>>,
    }

    #[async_trait]
    impl TokenStore for MemoryStore {
        async fn get(&self, username: &str) -> Result<Option<AugmentedToken>> {
            Ok(self.tokens.lock().unwrap().get(username).cloned())
        }

        async fn store(&self, username: &str, token: RawToken) -> Result<AugmentedToken> {
            self.calls.lock().unwrap().store.push(token.access_token.clone());
            let augmented = AugmentedToken::new(token, Utc::now());
            self.tokens
                .lock()
                .unwrap()
                .insert(username.to_string(), augmented.clone());
            Ok(augmented)
        }

        async fn forget(&self, username: &str) -> Result<()> {
            self.calls.lock().unwrap().forget.push(username.to_string());
            self.tokens
                .lock()
                .unwrap()
                .insert(username.to_string(), AugmentedToken::forgotten());
            Ok(())
        }
    }

    /// Pastes back the full redirect URL with the state it was given
    struct RedirectPrompt(SharedCalls);

    #[async_trait]
    impl AuthPrompt for RedirectPrompt {
        async fn ask(&self, _username: &str, authorize_url: &str) -> Result<String> {
            self.0.lock().unwrap().prompt += 1;
            let state = authorize_url.rsplit("state=").next().unwrap_or_default();
            Ok(format!("http://localhost:3000/?code=abc&scope=chat%3Aread&state={}", state))
        }
    }

    fn setup(
        stored: Option<AugmentedToken>,
        valid: Vec<&'static str>,
        refreshed: RawToken,
        exchanged: RawToken,
    ) -> (UserTokenManager, SharedCalls) {
        let calls: SharedCalls = Arc::new(Mutex::new(Calls::default()));
        let mut tokens = HashMap::new();
        if let Some(stored) = stored {
            tokens.insert("bot".to_string(), stored);
        }

        let manager = UserTokenManager::new(
            Arc::new(FakeApi {
                calls: calls.clone(),
                valid,
                refreshed,
                exchanged,
            }),
            Arc::new(MemoryStore {
                calls: calls.clone(),
                tokens: Mutex::new(tokens),
            }),
            Arc::new(RedirectPrompt(calls.clone())),
        );
        (manager, calls)
    }

    #[tokio::test]
    async fn test_valid_stored_token_is_returned_unchanged() {
        let stored = AugmentedToken::new(raw("good", "r"), Utc::now());
        let (manager, calls) = setup(
            Some(stored.clone()),
            vec!["good"],
            raw("unused", "r"),
            raw("unused", "r"),
        );

        let token = manager.get("bot").await.unwrap();

        assert_eq!(token, stored);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.validate, vec!["good"]);
        assert!(calls.refresh.is_empty());
        assert!(calls.store.is_empty());
        assert!(calls.revoke.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_token_is_refreshed_and_stored() {
        let stored = AugmentedToken::new(raw("stale", "r1"), Utc::now());
        let (manager, calls) = setup(
            Some(stored),
            vec!["refreshed"],
            raw("refreshed", "r2"),
            raw("unused", "r"),
        );

        let token = manager.get("bot").await.unwrap();

        assert_eq!(token.access_token(), Some("refreshed"));
        let calls = calls.lock().unwrap();
        assert_eq!(calls.refresh, vec!["r1"]);
        assert_eq!(calls.store, vec!["refreshed"]);
        assert!(calls.forget.is_empty());
        assert_eq!(calls.prompt, 0);
    }

    #[tokio::test]
    async fn test_failed_refresh_forgets_revokes_and_reauthorizes() {
        let stored = AugmentedToken::new(raw("stale", "r1"), Utc::now());
        let (manager, calls) = setup(
            Some(stored),
            vec!["fresh"],
            raw("refreshed", "r2"),
            raw("fresh", "r3"),
        );

        let token = manager.get("bot").await.unwrap();

        assert_eq!(token.access_token(), Some("fresh"));
        let calls = calls.lock().unwrap();
        assert_eq!(calls.forget, vec!["bot"]);
        assert_eq!(calls.revoke, vec!["refreshed"]);
        assert_eq!(calls.prompt, 1);
        assert_eq!(calls.exchange, vec!["abc"]);
        assert_eq!(calls.store, vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_empty_store_goes_straight_to_prompt() {
        let (manager, calls) = setup(None, vec!["fresh"], raw("unused", "r"), raw("fresh", "r"));

        let token = manager.get("bot").await.unwrap();

        assert_eq!(token.access_token(), Some("fresh"));
        let calls = calls.lock().unwrap();
        assert_eq!(calls.prompt, 1);
        assert_eq!(calls.validate, vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_reauthorization_is_bounded() {
        let stored = AugmentedToken::new(raw("stale", "r1"), Utc::now());
        let (manager, calls) = setup(Some(stored), vec![], raw("refreshed", "r2"), raw("bad", "r3"));

        let result = manager.get("bot").await;

        assert!(matches!(result, Err(TwitchError::AuthExhausted(_, MAX_AUTH_CYCLES))));
        let calls = calls.lock().unwrap();
        assert_eq!(calls.forget.len(), MAX_AUTH_CYCLES);
        assert_eq!(calls.prompt, MAX_AUTH_CYCLES - 1);
    }

    #[tokio::test]
    async fn test_provider_hands_out_access_token() {
        let stored = AugmentedToken::new(raw("good", "r"), Utc::now());
        let (manager, _) = setup(Some(stored), vec!["good"], raw("x", "r"), raw("x", "r"));
        let provider = UserTokenProvider::new(Arc::new(manager), "bot");
        assert_eq!(provider.access_token().await.unwrap(), "good");
    }

    #[test]
    fn test_extract_code() {
        assert_eq!(extract_code("  abc123 \n", "s").unwrap(), "abc123");
        assert_eq!(
            extract_code("http://localhost:3000/?code=xyz&scope=chat%3Aread&state=s", "s").unwrap(),
            "xyz"
        );
        assert!(extract_code("http://localhost:3000/?code=xyz&state=other", "s").is_err());
        assert!(extract_code("http://localhost:3000/?error=access_denied", "s").is_err());
        assert!(extract_code("", "s").is_err());
    }
}
