use crate::error::{Error, Result};
use chrono::{TimeDelta, Utc};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

const DEFAULT_KEY_PREFIX: &str = "auth:";

/// Token engine configuration.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// HMAC secret for access tokens.
    pub access_secret: String,
    /// HMAC secret for refresh tokens. Must differ from the access secret.
    pub refresh_secret: String,
    /// Access token lifetime in seconds (default: 15 minutes).
    pub access_ttl_secs: u64,
    /// Refresh token lifetime in seconds (default: 7 days).
    pub refresh_ttl_secs: u64,
    /// `iss` claim written and required on verification.
    pub issuer: String,
    /// Audience used when a principal carries none.
    pub default_audience: Vec<String>,
    /// Budget for each credential store call in milliseconds.
    pub store_timeout_ms: u64,
    /// Track refresh JTIs per owner to support bulk revocation.
    pub track_owner_refresh: bool,
    /// Prefix prepended to every credential store key.
    pub key_prefix: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            access_secret: String::new(),
            refresh_secret: String::new(),
            access_ttl_secs: 15 * 60,
            refresh_ttl_secs: 7 * 24 * 60 * 60,
            issuer: "auth-microservice".to_string(),
            default_audience: Vec::new(),
            store_timeout_ms: 2_000,
            track_owner_refresh: true,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenConfig")
            .field("access_secret", &"<redacted>")
            .field("refresh_secret", &"<redacted>")
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .field("issuer", &self.issuer)
            .field("default_audience", &self.default_audience)
            .field("store_timeout_ms", &self.store_timeout_ms)
            .field("track_owner_refresh", &self.track_owner_refresh)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl TokenConfig {
    /// Creates a config with the given secrets and default lifetimes.
    pub fn new(access_secret: impl Into<String>, refresh_secret: impl Into<String>) -> Self {
        Self {
            access_secret: access_secret.into(),
            refresh_secret: refresh_secret.into(),
            ..Self::default()
        }
    }

    pub fn access_ttl(&self) -> Duration {
        Duration::from_secs(self.access_ttl_secs)
    }

    pub fn refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_ttl_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Checks the invariants the token engine relies on.
    pub fn validate(&self) -> Result<()> {
        if self.access_secret.is_empty() {
            return Err(Error::Config("access secret is required".into()));
        }
        if self.refresh_secret.is_empty() {
            return Err(Error::Config("refresh secret is required".into()));
        }
        if self.access_secret == self.refresh_secret {
            return Err(Error::Config(
                "access and refresh secrets must differ".into(),
            ));
        }
        if self.access_ttl_secs == 0 || self.refresh_ttl_secs == 0 {
            return Err(Error::Config("token lifetimes must be positive".into()));
        }
        if !lifetime_fits(self.access_ttl_secs) || !lifetime_fits(self.refresh_ttl_secs) {
            return Err(Error::Config("token lifetimes overflow the calendar".into()));
        }
        if self.store_timeout_ms == 0 {
            return Err(Error::Config("store timeout must be positive".into()));
        }
        Ok(())
    }
}

fn lifetime_fits(secs: u64) -> bool {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .is_some()
}

/// Permission resolver configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// Permission cache TTL in seconds (default: 15 minutes).
    pub cache_ttl_secs: u64,
    /// Budget for each cache call in milliseconds.
    pub store_timeout_ms: u64,
    /// Prefix prepended to every cache key.
    pub key_prefix: String,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 15 * 60,
            store_timeout_ms: 2_000,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl PermissionConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token: TokenConfig,
    pub permissions: PermissionConfig,
}

impl AuthConfig {
    /// Loads configuration from `AUTH__*` environment variables.
    ///
    /// Nested fields use a double underscore, e.g. `AUTH__TOKEN__ACCESS_SECRET`
    /// or `AUTH__PERMISSIONS__CACHE_TTL_SECS`. `AUTH__TOKEN__DEFAULT_AUDIENCE`
    /// is a comma separated list.
    #[cfg(feature = "env-config")]
    pub fn from_env() -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("AUTH")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("token.default_audience")
                    .try_parsing(true),
            )
            .build()
            .map_err(|err| Error::Config(err.to_string()))?
            .try_deserialize()
            .map_err(|err| Error::Config(err.to_string()))?;
        config.token.validate()?;
        Ok(config)
    }
}
