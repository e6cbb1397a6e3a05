use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::account::AccountKind;

/// Token set for one linked account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    /// Access token for API requests
    pub access_token: String,

    /// Optional refresh token for token renewal
    pub refresh_token: Option<String>,

    /// Token expiration timestamp (Unix timestamp)
    pub expires_at: i64,

    /// Scopes granted to this token
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl TokenSet {
    /// Check if the token is expired
    pub fn is_expired(&self) -> bool {
        let now = chrono::Utc::now().timestamp();
        now >= self.expires_at
    }
}

/// File-based token storage, one JSON file per account under `dir`.
///
/// Linking and refreshing accounts happens elsewhere; this store only
/// reads what the sign-in flow left behind.
#[derive(Debug, Clone)]
pub struct TokenStore {
    dir: PathBuf,
}

impl TokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn token_path(&self, kind: AccountKind) -> PathBuf {
        self.dir.join(format!("{}.json", kind.service_id()))
    }

    /// Store a token set for an account
    pub fn store_token(&self, kind: AccountKind, token_set: &TokenSet) -> Result<()> {
        fs::create_dir_all(&self.dir).context("Failed to create tokens directory")?;

        let path = self.token_path(kind);
        let json =
            serde_json::to_string_pretty(token_set).context("Failed to serialize token set")?;

        fs::write(&path, &json).context("Failed to write token file")?;

        tracing::info!("Stored token for account: {} at {:?}", kind, path);
        Ok(())
    }

    /// Retrieve the token set for an account
    pub fn retrieve_token(&self, kind: AccountKind) -> Result<TokenSet> {
        let path = self.token_path(kind);

        let json = fs::read_to_string(&path).context("Failed to read token file")?;

        let token_set: TokenSet =
            serde_json::from_str(&json).context("Failed to deserialize token set")?;

        tracing::debug!("Retrieved token for account: {}", kind);
        Ok(token_set)
    }

    /// Check if a token file exists for an account
    pub fn has_token(&self, kind: AccountKind) -> bool {
        self.token_path(kind).exists()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;

    fn token(expires_in: i64) -> TokenSet {
        TokenSet {
            access_token: "test".to_string(),
            refresh_token: None,
            expires_at: chrono::Utc::now().timestamp() + expires_in,
            scopes: vec![],
        }
    }

    #[test]
    fn test_token_expiry() {
        let expired = token(-3600);
        assert!(expired.is_expired());

        let valid = token(3600);
        assert!(!valid.is_expired());
    }

    #[test]
    fn test_store_and_retrieve() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens"));

        assert!(!store.has_token(AccountKind::Personal));
        store.store_token(AccountKind::Personal, &token(3600)).unwrap();

        assert!(store.has_token(AccountKind::Personal));
        assert!(!store.has_token(AccountKind::Professional));
        assert_eq!(
            store.retrieve_token(AccountKind::Personal).unwrap().access_token,
            "test"
        );
        assert!(store.retrieve_token(AccountKind::Professional).is_err());
    }
}
