//! Account identity and credentials for the calendar engine.

pub mod account;
pub mod provider;
pub mod storage;

pub use account::AccountKind;
pub use provider::{AuthError, StaticTokenProvider, StoredTokenProvider, TokenProvider};
pub use storage::{TokenSet, TokenStore};
