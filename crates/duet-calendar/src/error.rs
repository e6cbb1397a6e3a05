//! Calendar-specific error types.

use duet_auth::{AccountKind, AuthError};
use reqwest::StatusCode;
use thiserror::Error;

/// Failure of a single calendar operation.
///
/// `Clone` so one fetch result can be handed to every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalendarError {
    #[error("Credential unavailable: {0}")]
    CredentialUnavailable(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Server error: {0}")]
    ServerError(u16),

    #[error("Unexpected status: {0}")]
    UnexpectedStatus(u16),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Cache error: {0}")]
    CacheIo(String),
}

impl CalendarError {
    /// Map a non-2xx status to the error taxonomy.
    pub fn from_status(status: StatusCode, retry_after: Option<u64>, body: String) -> Self {
        match status.as_u16() {
            401 | 403 => Self::Unauthorized,
            404 => Self::NotFound(body),
            429 => Self::RateLimited(retry_after.unwrap_or(60)),
            500..=599 => Self::ServerError(status.as_u16()),
            other => Self::UnexpectedStatus(other),
        }
    }

    /// User-friendly error message for UI display.
    pub fn user_message(&self) -> String {
        match self {
            Self::CredentialUnavailable(_) => "Please sign in to your calendar account".to_string(),
            Self::Transport(_) => "Network error. Check your connection.".to_string(),
            Self::Timeout => "The calendar server took too long to respond.".to_string(),
            Self::Unauthorized => "Your session has expired. Please sign in again.".to_string(),
            Self::RateLimited(secs) => format!("Too many requests. Please wait {} seconds.", secs),
            Self::NotFound(_) => "Calendar not found".to_string(),
            Self::ServerError(_) => {
                "The calendar service is having trouble. Try again later.".to_string()
            }
            Self::UnexpectedStatus(status) => format!("Calendar error ({})", status),
            Self::Decode(_) => "Received unreadable calendar data".to_string(),
            Self::CacheIo(_) => "Local cache error".to_string(),
        }
    }

}

impl From<reqwest::Error> for CalendarError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl From<AuthError> for CalendarError {
    fn from(e: AuthError) -> Self {
        Self::CredentialUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for CalendarError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

/// Failure surfaced for a whole load after applying the partial-failure policy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncFailure {
    #[error("{0} account: {1}")]
    Account(AccountKind, CalendarError),

    #[error("All accounts failed")]
    AllAccounts(Vec<(AccountKind, CalendarError)>),
}

impl SyncFailure {
    /// User-friendly error message for UI display.
    pub fn user_message(&self) -> String {
        match self {
            Self::Account(kind, err) => format!("{} calendar: {}", label(*kind), err.user_message()),
            Self::AllAccounts(errors) => match errors.first() {
                Some((_, first)) if errors.iter().all(|(_, e)| e == first) => {
                    first.user_message()
                }
                _ => "Unable to load either calendar. Please try again.".to_string(),
            },
        }
    }

    /// Accounts whose fetch failed.
    pub fn accounts(&self) -> Vec<AccountKind> {
        match self {
            Self::Account(kind, _) => vec![*kind],
            Self::AllAccounts(errors) => errors.iter().map(|(kind, _)| *kind).collect(),
        }
    }
}

fn label(kind: AccountKind) -> &'static str {
    match kind {
        AccountKind::Personal => "Personal",
        AccountKind::Professional => "Professional",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_user_messages() {
        let err = CalendarError::CredentialUnavailable("x".into());
        assert!(err.user_message().contains("sign in"));

        let err = CalendarError::RateLimited(30);
        assert!(err.user_message().contains("30"));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            CalendarError::from_status(StatusCode::UNAUTHORIZED, None, String::new()),
            CalendarError::Unauthorized
        );
        assert_eq!(
            CalendarError::from_status(StatusCode::TOO_MANY_REQUESTS, Some(12), String::new()),
            CalendarError::RateLimited(12)
        );
        assert_eq!(
            CalendarError::from_status(StatusCode::TOO_MANY_REQUESTS, None, String::new()),
            CalendarError::RateLimited(60)
        );
        assert!(matches!(
            CalendarError::from_status(StatusCode::NOT_FOUND, None, "gone".into()),
            CalendarError::NotFound(body) if body == "gone"
        ));
        assert_eq!(
            CalendarError::from_status(StatusCode::BAD_GATEWAY, None, String::new()),
            CalendarError::ServerError(502)
        );
        assert_eq!(
            CalendarError::from_status(StatusCode::CONFLICT, None, String::new()),
            CalendarError::UnexpectedStatus(409)
        );
    }

    #[test]
    fn test_credential_errors_map_to_sign_in_message() {
        let err = CalendarError::from(AuthError::Expired(AccountKind::Personal));
        assert!(matches!(err, CalendarError::CredentialUnavailable(_)));
        assert_eq!(err.user_message(), "Please sign in to your calendar account");
    }

    #[test]
    fn test_sync_failure_messages() {
        let single = SyncFailure::Account(AccountKind::Personal, CalendarError::Timeout);
        assert!(single.user_message().starts_with("Personal calendar:"));
        assert_eq!(single.accounts(), vec![AccountKind::Personal]);

        let same = SyncFailure::AllAccounts(vec![
            (AccountKind::Personal, CalendarError::Unauthorized),
            (AccountKind::Professional, CalendarError::Unauthorized),
        ]);
        assert_eq!(same.user_message(), CalendarError::Unauthorized.user_message());

        let mixed = SyncFailure::AllAccounts(vec![
            (AccountKind::Personal, CalendarError::Timeout),
            (AccountKind::Professional, CalendarError::ServerError(500)),
        ]);
        assert!(mixed.user_message().contains("either calendar"));
    }
}
