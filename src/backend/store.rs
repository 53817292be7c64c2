use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::backend::twitch::{AugmentedToken, RawToken, Result, TokenStore};

type Records = BTreeMap<String, AugmentedToken>;

/// Token store backed by one JSON file mapping usernames to tokens
pub struct FileTokenStore {
    path: PathBuf,
    // Serializes read-modify-write cycles
    lock: Mutex<()>,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Records> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(Records::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Records::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, records: &Records) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(records)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn put(&self, username: &str, token: AugmentedToken) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut records = self.read().await?;
        records.insert(username.to_lowercase(), token);
        self.write(&records).await
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn get(&self, username: &str) -> Result<Option<AugmentedToken>> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.remove(&username.to_lowercase()))
    }

    async fn store(&self, username: &str, token: RawToken) -> Result<AugmentedToken> {
        let augmented = AugmentedToken::new(token, Utc::now());
        self.put(username, augmented.clone()).await?;
        log::info!("[store] saved token for {}", username);
        Ok(augmented)
    }

    async fn forget(&self, username: &str) -> Result<()> {
        self.put(username, AugmentedToken::forgotten()).await?;
        log::info!("[store] forgot token for {}", username);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::twitch::{Scopes, TwitchError};
    use chrono::Duration;

    fn raw(access: &str) -> RawToken {
        RawToken {
            access_token: access.to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_in: 600,
            scope: Scopes(vec!["chat:read".to_string()]),
            token_type: Some("bearer".to_string()),
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("tokens.json"));
        assert!(store.get("bot").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_stamps_expiry_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tokens.json");
        let store = FileTokenStore::new(&path);

        let stored = store.store("Bot", raw("a1")).await.unwrap();
        let stored_at = stored.stored_at.unwrap();
        assert_eq!(
            stored.expires_approximately_at,
            Some(stored_at + Duration::seconds(600))
        );

        // A fresh instance reads what the first one wrote
        let reopened = FileTokenStore::new(&path);
        assert_eq!(reopened.get("bot").await.unwrap(), Some(stored));
    }

    #[tokio::test]
    async fn test_forget_writes_null_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("tokens.json"));
        store.store("bot", raw("a1")).await.unwrap();
        store.store("other", raw("b1")).await.unwrap();

        store.forget("bot").await.unwrap();

        let forgotten = store.get("bot").await.unwrap().unwrap();
        assert!(forgotten.is_forgotten());
        assert!(forgotten.stored_at.is_none());
        assert_eq!(
            store.get("other").await.unwrap().unwrap().access_token(),
            Some("b1")
        );

        let content = std::fs::read_to_string(store.path()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert!(json["bot"]["token"].is_null());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = FileTokenStore::new(&path);
        assert!(matches!(store.get("bot").await, Err(TwitchError::JsonError(_))));
    }
}
