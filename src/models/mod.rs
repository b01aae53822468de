//! Core domain types shared across the streaming layers.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::types::AppError;

/// Length of an Ace Stream content identifier in hex characters.
pub const CONTENT_ID_LEN: usize = 40;

/// A validated Ace Stream content identifier.
///
/// Content ids are 40-character hexadecimal strings (the engine's infohash).
/// Validation happens once at the HTTP boundary; everything behind it can
/// rely on the id being well formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    /// Parse and validate a content id.
    ///
    /// Accepts upper- and lowercase hex; anything that is not exactly 40
    /// hex characters is rejected.
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        if raw.len() != CONTENT_ID_LEN {
            return Err(AppError::validation(format!(
                "content id must be {} hex characters, got {}",
                CONTENT_ID_LEN,
                raw.len()
            )));
        }
        if !raw.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AppError::validation(
                "content id must contain only hexadecimal characters",
            ));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What identifies "the same viewer" across quick reconnects.
///
/// VLC and friends tear the TCP connection down and immediately redial on
/// seek/probe; the (ip, user-agent) pair is stable across that, so the PID
/// allocator can hand the same PID back to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientFingerprint {
    pub ip: String,
    pub user_agent: String,
}

impl ClientFingerprint {
    pub fn new(ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user_agent: user_agent.into(),
        }
    }
}

impl fmt::Display for ClientFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.ip, self.user_agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_lowercase_id() {
        let id = ContentId::parse("0123456789abcdef0123456789abcdef01234567").unwrap();
        assert_eq!(id.as_str(), "0123456789abcdef0123456789abcdef01234567");
    }

    #[test]
    fn accepts_valid_uppercase_id() {
        assert!(ContentId::parse("0123456789ABCDEF0123456789ABCDEF01234567").is_ok());
    }

    #[test]
    fn rejects_short_id() {
        assert!(ContentId::parse("0123456789abcdef0123456789abcdef0123456").is_err());
    }

    #[test]
    fn rejects_long_id() {
        assert!(ContentId::parse("0123456789abcdef0123456789abcdef012345678").is_err());
    }

    #[test]
    fn rejects_non_hex_id() {
        assert!(ContentId::parse("0123456789abcdef0123456789abcdef0123456g").is_err());
    }

    #[test]
    fn rejects_empty_id() {
        assert!(ContentId::parse("").is_err());
    }
}
