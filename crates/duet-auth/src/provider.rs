//! Access-token providers consumed by the calendar engine.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use crate::account::AccountKind;
use crate::storage::TokenStore;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    #[error("Account not linked: {0}")]
    NotLinked(AccountKind),

    #[error("Token expired for account: {0}")]
    Expired(AccountKind),

    #[error("Token storage error: {0}")]
    Storage(String),
}

impl AuthError {
    /// User-friendly error message for UI display.
    pub fn user_message(&self) -> String {
        match self {
            Self::NotLinked(kind) => format!("Please link your {} calendar account", kind),
            Self::Expired(kind) => {
                format!("Your {} session has expired. Please sign in again.", kind)
            }
            Self::Storage(_) => "Saved credentials could not be read".to_string(),
        }
    }
}

/// Source of per-account access credentials.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Whether the account has been linked at all.
    fn is_linked(&self, kind: AccountKind) -> bool;

    /// Get a usable access token for the account.
    async fn access_token(&self, kind: AccountKind) -> Result<String, AuthError>;

    /// Linked accounts in a stable order.
    fn linked_accounts(&self) -> Vec<AccountKind> {
        AccountKind::ALL
            .into_iter()
            .filter(|kind| self.is_linked(*kind))
            .collect()
    }
}

/// Provider backed by token files written by the sign-in flow.
pub struct StoredTokenProvider {
    store: TokenStore,
}

impl StoredTokenProvider {
    pub fn new(store: TokenStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TokenProvider for StoredTokenProvider {
    fn is_linked(&self, kind: AccountKind) -> bool {
        self.store.has_token(kind)
    }

    async fn access_token(&self, kind: AccountKind) -> Result<String, AuthError> {
        if !self.store.has_token(kind) {
            return Err(AuthError::NotLinked(kind));
        }

        let store = self.store.clone();
        let token_set = tokio::task::spawn_blocking(move || store.retrieve_token(kind))
            .await
            .map_err(|e| AuthError::Storage(e.to_string()))?
            .map_err(|e| AuthError::Storage(e.to_string()))?;

        if token_set.is_expired() {
            tracing::warn!("Stored token for {} is expired", kind);
            return Err(AuthError::Expired(kind));
        }

        Ok(token_set.access_token)
    }
}

/// In-memory provider holding fixed tokens; linking and unlinking are explicit.
#[derive(Default)]
pub struct StaticTokenProvider {
    tokens: RwLock<HashMap<AccountKind, Result<String, AuthError>>>,
}

impl StaticTokenProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider with the given accounts linked to the given tokens.
    pub fn with_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = (AccountKind, S)>,
        S: Into<String>,
    {
        let provider = Self::new();
        for (kind, token) in tokens {
            provider.link(kind, token);
        }
        provider
    }

    pub fn link(&self, kind: AccountKind, token: impl Into<String>) {
        self.tokens.write().insert(kind, Ok(token.into()));
    }

    /// Keep the account linked but make credential acquisition fail.
    pub fn fail(&self, kind: AccountKind, error: AuthError) {
        self.tokens.write().insert(kind, Err(error));
    }

    pub fn unlink(&self, kind: AccountKind) {
        self.tokens.write().remove(&kind);
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    fn is_linked(&self, kind: AccountKind) -> bool {
        self.tokens.read().contains_key(&kind)
    }

    async fn access_token(&self, kind: AccountKind) -> Result<String, AuthError> {
        self.tokens
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or(Err(AuthError::NotLinked(kind)))
    }
}
