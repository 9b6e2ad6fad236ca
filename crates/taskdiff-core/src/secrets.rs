//! Handling of Hub access tokens.
//!
//! Tokens read from configuration or the environment are wrapped so they never
//! end up in logs, error messages or `Debug` output by accident.

use std::fmt;

use serde::{Deserialize, Deserializer};

/// A string that redacts its content in `Debug` and `Display`.
///
/// # Example
///
/// ```
/// use taskdiff_core::SecretString;
///
/// let token = SecretString::new("hf_abcdef");
/// assert_eq!(format!("{:?}", token), "SecretString([REDACTED])");
/// assert_eq!(token.expose_secret(), "hf_abcdef");
/// ```
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString {
    inner: String,
}

impl SecretString {
    /// Create a new `SecretString` from a string value.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            inner: secret.into(),
        }
    }

    /// Read a secret from an environment variable.
    ///
    /// Unset and empty variables both yield `None`.
    pub fn from_env(var: &str) -> Option<Self> {
        std::env::var(var)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(Self::new)
    }

    /// Expose the secret value.
    #[inline]
    pub fn expose_secret(&self) -> &str {
        &self.inner
    }

    /// Check if the secret is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString([REDACTED])")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_string_debug_redacts() {
        let secret = SecretString::new("hf_secret");
        assert_eq!(format!("{:?}", secret), "SecretString([REDACTED])");
        assert_eq!(format!("{}", secret), "[REDACTED]");
    }

    #[test]
    fn test_secret_string_expose() {
        let secret = SecretString::from("hf_secret");
        assert_eq!(secret.expose_secret(), "hf_secret");
        assert!(!secret.is_empty());
        assert!(SecretString::default().is_empty());
    }

    #[test]
    fn test_from_env_missing_var() {
        assert!(SecretString::from_env("TASKDIFF_TEST_SURELY_UNSET_VAR").is_none());
    }

    #[test]
    fn test_deserialize_from_plain_string() {
        let secret: SecretString = serde_json::from_str("\"hf_token\"").unwrap();
        assert_eq!(secret.expose_secret(), "hf_token");
    }
}
