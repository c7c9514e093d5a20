use crate::error::{StoreError, StoreTimeout};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Key/value store with per-key TTL and set operations.
///
/// Backs refresh-token tracking, access-token blacklisting and permission
/// caching. Implementations must be safe for concurrent use.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Returns the value stored at `key`.
    async fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError>;

    /// Stores `value` at `key`, expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration)
    -> std::result::Result<(), StoreError>;

    /// Deletes `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> std::result::Result<bool, StoreError>;

    /// Returns whether `key` exists.
    async fn exists(&self, key: &str) -> std::result::Result<bool, StoreError>;

    /// Atomically reads and deletes `key`.
    ///
    /// Of several concurrent callers at most one observes `Some`.
    async fn take(&self, key: &str) -> std::result::Result<Option<String>, StoreError>;

    /// Adds `member` to the set at `key`.
    async fn set_add(&self, key: &str, member: &str) -> std::result::Result<(), StoreError>;

    /// Removes `member` from the set at `key`.
    async fn set_remove(&self, key: &str, member: &str) -> std::result::Result<(), StoreError>;

    /// Returns the members of the set at `key`.
    async fn set_members(&self, key: &str) -> std::result::Result<Vec<String>, StoreError>;

    /// Resets the TTL of `key`.
    async fn expire(&self, key: &str, ttl: Duration) -> std::result::Result<(), StoreError>;
}

/// Logical key namespace under a deployment prefix.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// `refresh:<jti>` holding the owner id.
    pub fn refresh(&self, jti: &str) -> String {
        format!("{}refresh:{jti}", self.prefix)
    }

    /// `blacklist:<jti>` holding a sentinel.
    pub fn blacklist(&self, jti: &str) -> String {
        format!("{}blacklist:{jti}", self.prefix)
    }

    /// `user-refresh-set:<owner>` holding the owner's refresh JTIs.
    pub fn owner_refresh_set(&self, owner: &str) -> String {
        format!("{}user-refresh-set:{owner}", self.prefix)
    }

    /// `perm:user:<id>` holding cached grants.
    pub fn user_permissions(&self, user: &str) -> String {
        format!("{}perm:user:{user}", self.prefix)
    }

    /// `perm:client:<id>` holding cached grants.
    pub fn client_permissions(&self, client: &str) -> String {
        format!("{}perm:client:{client}", self.prefix)
    }
}

/// Runs a store call under a time budget.
pub(crate) async fn bounded<T, F>(limit: Duration, call: F) -> std::result::Result<T, StoreError>
where
    F: Future<Output = std::result::Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(Box::new(StoreTimeout(limit))),
    }
}
