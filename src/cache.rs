use crate::config::PermissionConfig;
use crate::credential_store::{CredentialStore, KeySpace, bounded};
use crate::error::Result;
use crate::types::{ClientId, Grants, SubjectId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Principal whose resolved grants are cached.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum CacheKey {
    User(SubjectId),
    Client(ClientId),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Client(id) => write!(f, "client:{id}"),
        }
    }
}

/// Cache interface for resolved grants.
///
/// Reads and writes are best effort. `invalidate` reports failures so callers
/// never acknowledge a mutation while a stale entry may survive.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Returns cached grants if they were valid at `as_of`.
    async fn get_grants(&self, key: &CacheKey, as_of: DateTime<Utc>) -> Option<Grants>;

    /// Stores grants computed at `computed_at`, usable until `valid_until`.
    async fn set_grants(
        &self,
        key: &CacheKey,
        grants: &Grants,
        computed_at: DateTime<Utc>,
        valid_until: Option<DateTime<Utc>>,
    );

    /// Drops the cached entry of a principal.
    async fn invalidate(&self, key: &CacheKey) -> Result<()>;
}

/// No-op cache implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

#[async_trait]
impl Cache for NoCache {
    async fn get_grants(&self, _key: &CacheKey, _as_of: DateTime<Utc>) -> Option<Grants> {
        None
    }

    async fn set_grants(
        &self,
        _key: &CacheKey,
        _grants: &Grants,
        _computed_at: DateTime<Utc>,
        _valid_until: Option<DateTime<Utc>>,
    ) {
    }

    async fn invalidate(&self, _key: &CacheKey) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedGrants {
    #[serde(flatten)]
    grants: Grants,
    computed_at: DateTime<Utc>,
    #[serde(default)]
    valid_until: Option<DateTime<Utc>>,
}

impl CachedGrants {
    fn covers(&self, as_of: DateTime<Utc>) -> bool {
        self.computed_at <= as_of && self.valid_until.is_none_or(|until| as_of < until)
    }
}

/// Grants cache stored as JSON in a [`CredentialStore`] under `perm:*` keys.
#[derive(Debug, Clone)]
pub struct CredentialCache<C> {
    store: C,
    keys: KeySpace,
    ttl: Duration,
    timeout: Duration,
}

impl<C> CredentialCache<C> {
    /// Creates a cache with the given TTL and per-call budget.
    pub fn new(store: C, config: &PermissionConfig) -> Self {
        Self {
            store,
            keys: KeySpace::new(config.key_prefix.clone()),
            ttl: config.cache_ttl(),
            timeout: config.store_timeout(),
        }
    }

    fn key(&self, key: &CacheKey) -> String {
        match key {
            CacheKey::User(id) => self.keys.user_permissions(id.as_str()),
            CacheKey::Client(id) => self.keys.client_permissions(id.as_str()),
        }
    }

    fn entry_ttl(
        &self,
        computed_at: DateTime<Utc>,
        valid_until: Option<DateTime<Utc>>,
    ) -> Option<Duration> {
        let Some(until) = valid_until else {
            return Some(self.ttl);
        };
        let remaining = (until - computed_at).to_std().ok()?;
        (!remaining.is_zero()).then(|| remaining.min(self.ttl))
    }
}

#[async_trait]
impl<C: CredentialStore> Cache for CredentialCache<C> {
    async fn get_grants(&self, key: &CacheKey, as_of: DateTime<Utc>) -> Option<Grants> {
        let raw = match bounded(self.timeout, self.store.get(&self.key(key))).await {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(principal = %key, error = %err, "permission cache read failed");
                return None;
            }
        };
        let cached: CachedGrants = match serde_json::from_str(&raw) {
            Ok(cached) => cached,
            Err(err) => {
                warn!(principal = %key, error = %err, "discarding unreadable permission cache entry");
                return None;
            }
        };
        if !cached.covers(as_of) {
            debug!(principal = %key, %as_of, "cached grants do not cover query instant");
            return None;
        }
        Some(cached.grants)
    }

    async fn set_grants(
        &self,
        key: &CacheKey,
        grants: &Grants,
        computed_at: DateTime<Utc>,
        valid_until: Option<DateTime<Utc>>,
    ) {
        let Some(ttl) = self.entry_ttl(computed_at, valid_until) else {
            return;
        };
        let payload = CachedGrants {
            grants: grants.clone(),
            computed_at,
            valid_until,
        };
        let raw = match serde_json::to_string(&payload) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(principal = %key, error = %err, "failed to encode permission cache entry");
                return;
            }
        };
        if let Err(err) = bounded(self.timeout, self.store.set(&self.key(key), &raw, ttl)).await {
            warn!(principal = %key, error = %err, "permission cache write failed");
        }
    }

    async fn invalidate(&self, key: &CacheKey) -> Result<()> {
        bounded(self.timeout, self.store.delete(&self.key(key))).await?;
        debug!(principal = %key, "invalidated permission cache entry");
        Ok(())
    }
}
