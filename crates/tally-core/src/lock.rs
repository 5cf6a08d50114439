use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;

/// Opaque proof of lock ownership: `<owner>:<random>`.
///
/// Returned by [`DistributedLock::try_acquire`] and handed back to
/// [`DistributedLock::release`]. Two acquisitions never share a token, so a
/// holder whose lock expired cannot release its successor's lock.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(String);

impl LockToken {
    /// Generates a fresh token owned by `owner`.
    pub fn generate(owner: &str) -> Self {
        Self(format!("{owner}:{}", uuid::Uuid::new_v4().simple()))
    }

    /// Wraps a stored token value.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The owner part of the token, i.e. everything before the last colon.
    pub fn owner(&self) -> &str {
        owner_of(&self.0)
    }
}

impl Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Owner part of a raw token value, or the whole value if it has no suffix.
pub fn owner_of(raw: &str) -> &str {
    raw.rsplit_once(':').map_or(raw, |(owner, _)| owner)
}

/// Fleet-wide mutual exclusion keyed by string.
///
/// A key is either unlocked or held by exactly one token until that token
/// releases it or the TTL expires.
#[async_trait]
pub trait DistributedLock: Send + Sync + 'static {
    /// Tries to take the lock without waiting.
    ///
    /// Returns `Ok(None)` if the lock is held elsewhere, the key is blank or
    /// the TTL is zero.
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration)
        -> Result<Option<LockToken>>;

    /// Releases the lock only if it is still held by `token`.
    ///
    /// Returns `true` if the lock was deleted.
    async fn release(&self, key: &str, token: &LockToken) -> Result<bool>;

    /// Returns the raw token currently holding `key`, if any.
    async fn holder(&self, key: &str) -> Result<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_per_acquisition() {
        let a = LockToken::generate("host-1a2b3c4d");
        let b = LockToken::generate("host-1a2b3c4d");
        assert_ne!(a, b);
        assert_eq!(a.owner(), "host-1a2b3c4d");
        assert_eq!(b.owner(), "host-1a2b3c4d");
    }

    #[test]
    fn owner_of_raw_values() {
        assert_eq!(owner_of("worker:abc"), "worker");
        assert_eq!(owner_of("a:b:c"), "a:b");
        assert_eq!(owner_of("bare"), "bare");
    }
}
