use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::error::{Result, TwitchError};

const ID_BASE_URL: &str = "https://id.twitch.tv/oauth2";
const HELIX_BASE_URL: &str = "https://api.twitch.tv/helix";

/// OAuth scopes. Twitch returns either a space-separated string or a list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ScopeRepr")]
pub struct Scopes(pub Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum ScopeRepr {
    One(String),
    Many(Vec<String>),
}

impl From<ScopeRepr> for Scopes {
    fn from(repr: ScopeRepr) -> Self {
        match repr {
            ScopeRepr::One(scope) => Scopes(scope.split_whitespace().map(str::to_string).collect()),
            ScopeRepr::Many(scopes) => Scopes(scopes),
        }
    }
}

impl Scopes {
    pub fn contains(&self, scope: &str) -> bool {
        self.0.iter().any(|s| s == scope)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Token as returned by the token endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawToken {
    pub access_token: String,
    /// Absent for client-credentials tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default)]
    pub scope: Scopes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

/// A stored token plus bookkeeping. `token: None` means nothing is on file.
///
/// Replaced wholesale on every refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AugmentedToken {
    pub token: Option<RawToken>,
    #[serde(default)]
    pub stored_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_approximately_at: Option<DateTime<Utc>>,
}

impl AugmentedToken {
    /// An `expires_in` too large to represent leaves the expiry unknown
    pub fn new(token: RawToken, stored_at: DateTime<Utc>) -> Self {
        let expires = i64::try_from(token.expires_in)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|lifetime| stored_at.checked_add_signed(lifetime));
        Self {
            token: Some(token),
            stored_at: Some(stored_at),
            expires_approximately_at: expires,
        }
    }

    /// The record left behind after a token is forgotten
    pub fn forgotten() -> Self {
        Self {
            token: None,
            stored_at: None,
            expires_approximately_at: None,
        }
    }

    pub fn is_forgotten(&self) -> bool {
        self.token.is_none()
    }

    /// Expiry is only meaningful for a present token
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match (&self.token, self.expires_approximately_at) {
            (Some(_), Some(expires)) => now >= expires,
            _ => false,
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        self.token.as_ref().map(|t| t.access_token.as_str())
    }
}

/// Body of a successful `/validate` call
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ValidatedToken {
    pub client_id: String,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub scopes: Scopes,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct UsersResponse {
    data: Vec<UserData>,
}

#[derive(Debug, Deserialize)]
struct UserData {
    id: String,
}

/// Hands out a currently usable access token for handshakes and requests
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// Remote OAuth operations used by the credential managers
#[async_trait]
pub trait OAuthApi: Send + Sync {
    /// URL the user opens to grant access
    fn authorize_url(&self, state: &str) -> String;

    /// Trade an authorization code for a token
    async fn exchange_code(&self, code: &str) -> Result<RawToken>;

    async fn refresh(&self, refresh_token: &str) -> Result<RawToken>;

    /// `Ok(None)` when the token is no longer valid
    async fn validate(&self, access_token: &str) -> Result<Option<ValidatedToken>>;

    async fn revoke(&self, access_token: &str) -> Result<()>;

    /// Look up a user id by login using an app token
    async fn user_id(&self, login: &str, app_token: &str) -> Result<String>;
}

/// Application credentials and redirect settings
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

/// reqwest-backed OAuth client for the Twitch id and Helix endpoints
#[derive(Clone)]
pub struct TwitchAuth {
    client: reqwest::Client,
    credentials: ClientCredentials,
    id_base: String,
    helix_base: String,
}

impl TwitchAuth {
    pub fn new(credentials: ClientCredentials) -> Self {
        Self::with_endpoints(credentials, ID_BASE_URL, HELIX_BASE_URL)
    }

    pub fn with_endpoints(credentials: ClientCredentials, id_base: &str, helix_base: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            credentials,
            id_base: id_base.trim_end_matches('/').to_string(),
            helix_base: helix_base.trim_end_matches('/').to_string(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.credentials.client_id
    }

    pub fn credentials(&self) -> &ClientCredentials {
        &self.credentials
    }

    pub fn token_url(&self) -> String {
        format!("{}/token", self.id_base)
    }

    pub fn helix_base(&self) -> &str {
        &self.helix_base
    }

    async fn request_token(&self, params: &[(&str, &str)], what: &str) -> Result<RawToken> {
        let response = self.client.post(self.token_url()).form(params).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(TwitchError::AuthError(format!(
                "{} failed: HTTP {} - {}",
                what, status, error_text
            )));
        }

        Ok(response.json::<RawToken>().await?)
    }
}

#[async_trait]
impl OAuthApi for TwitchAuth {
    fn authorize_url(&self, state: &str) -> String {
        format!(
            "{}/authorize?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
            self.id_base,
            urlencoding::encode(&self.credentials.client_id),
            urlencoding::encode(&self.credentials.redirect_uri),
            urlencoding::encode(&self.credentials.scopes.join(" ")),
            urlencoding::encode(state),
        )
    }

    async fn exchange_code(&self, code: &str) -> Result<RawToken> {
        let params = [
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", self.credentials.redirect_uri.as_str()),
        ];
        self.request_token(&params, "Code exchange").await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RawToken> {
        let params = [
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        self.request_token(&params, "Token refresh").await
    }

    async fn validate(&self, access_token: &str) -> Result<Option<ValidatedToken>> {
        let response = self
            .client
            .get(format!("{}/validate", self.id_base))
            .header("Authorization", format!("OAuth {}", access_token))
            .send()
            .await?;

        if !response.status().is_success() {
            log::debug!("Token validation returned HTTP {}", response.status());
            return Ok(None);
        }

        Ok(Some(response.json::<ValidatedToken>().await?))
    }

    async fn revoke(&self, access_token: &str) -> Result<()> {
        let params = [
            ("client_id", self.credentials.client_id.as_str()),
            ("token", access_token),
        ];
        let response = self
            .client
            .post(format!("{}/revoke", self.id_base))
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(TwitchError::AuthError(format!(
                "Revocation failed: HTTP {} - {}",
                status, error_text
            )));
        }

        Ok(())
    }

    async fn user_id(&self, login: &str, app_token: &str) -> Result<String> {
        let response = self
            .client
            .get(format!("{}/users", self.helix_base))
            .query(&[("login", login)])
            .header("Client-Id", &self.credentials.client_id)
            .header("Authorization", format!("Bearer {}", app_token))
            .send()
            .await?;

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

        let users = response.json::<UsersResponse>().await?;
        users
            .data
            .into_iter()
            .next()
            .map(|user| user.id)
            .ok_or_else(|| TwitchError::HttpError(format!("User '{}' not found", login)))
    }
}
