//! Credentials handed to the REST collaborator
//!
//! Acquiring and refreshing credentials is outside the sync core; this
//! module only carries them and answers whether a session token can still
//! be used.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Temporary session token issued by the server
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl SessionToken {
    /// True only while the token has not yet expired
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// [`is_valid`](Self::is_valid) evaluated at an explicit instant
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.token.is_empty() && now < self.expires_at
    }

    /// True if the token expires within `margin` of now
    #[must_use]
    pub fn expires_within(&self, margin: Duration) -> bool {
        Utc::now() + margin >= self.expires_at
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Application key/secret plus an optional session token
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub key: String,
    pub secret: String,
    #[serde(default)]
    pub token: Option<SessionToken>,
}

impl Credentials {
    #[must_use]
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            secret: secret.into(),
            token: None,
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: SessionToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Whether requests can be authorized right now
    ///
    /// Key/secret credentials without a token never expire; with a token,
    /// the token must still be valid.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.key.is_empty() {
            return false;
        }
        match &self.token {
            Some(token) => token.is_valid(),
            None => !self.secret.is_empty(),
        }
    }

    /// Bearer value for the `Authorization` header
    #[must_use]
    pub fn bearer(&self) -> String {
        match &self.token {
            Some(token) => token.token.clone(),
            None => format!("{}:{}", self.key, self.secret),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &self.key)
            .field("secret", &"<redacted>")
            .field("token", &self.token)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expires_in: Duration) -> SessionToken {
        SessionToken {
            token: "tok".to_string(),
            expires_at: Utc::now() + expires_in,
        }
    }

    #[test]
    fn test_token_valid_before_expiry() {
        assert!(token(Duration::minutes(5)).is_valid());
    }

    #[test]
    fn test_token_invalid_after_expiry() {
        assert!(!token(Duration::minutes(-5)).is_valid());
    }

    #[test]
    fn test_token_invalid_exactly_at_expiry() {
        let t = token(Duration::zero());
        assert!(!t.is_valid_at(t.expires_at));
        assert!(t.is_valid_at(t.expires_at - Duration::seconds(1)));
    }

    #[test]
    fn test_expires_within() {
        let t = token(Duration::seconds(30));
        assert!(t.expires_within(Duration::minutes(1)));
        assert!(!t.expires_within(Duration::seconds(1)));
    }

    #[test]
    fn test_credentials_validity() {
        assert!(Credentials::new("key", "secret").is_valid());
        assert!(!Credentials::new("", "secret").is_valid());
        assert!(!Credentials::new("key", "secret")
            .with_token(token(Duration::minutes(-1)))
            .is_valid());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials::new("key", "hunter2").with_token(token(Duration::minutes(1)));
        let debug = format!("{creds:?}");
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("tok\""));
    }
}
