//! Account partitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the two independently authenticated calendar accounts.
///
/// Every fetch, cache key and published collection is partitioned by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Personal,
    Professional,
}

impl AccountKind {
    pub const ALL: [AccountKind; 2] = [AccountKind::Personal, AccountKind::Professional];

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Personal => "personal",
            AccountKind::Professional => "professional",
        }
    }

    /// Storage identifier used for this account's token file.
    pub fn service_id(&self) -> String {
        format!("google-{}", self.as_str())
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "personal" => Ok(AccountKind::Personal),
            "professional" => Ok(AccountKind::Professional),
            other => Err(format!("unknown account kind: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;

    #[test]
    fn test_parse_and_display() {
        for kind in AccountKind::ALL {
            assert_eq!(kind.to_string().parse::<AccountKind>().unwrap(), kind);
        }
        assert!("work".parse::<AccountKind>().is_err());
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&AccountKind::Professional).unwrap();
        assert_eq!(json, "\"professional\"");
    }
}
