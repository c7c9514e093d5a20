//! Issuance, verification, rotation and revocation of signed token pairs.
//!
//! Tokens are HS256 JWTs. The access and refresh legs are signed with
//! independent secrets so one can never be presented as the other. Refresh
//! JTIs live in the credential store until rotated, revoked or expired;
//! revoked access JTIs are blacklisted until their natural expiry.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::TokenConfig;
use crate::credential_store::{CredentialStore, KeySpace, bounded};
use crate::error::{Error, Result};
use crate::types::{
    ClientId, Introspection, Principal, RoleKey, ScopeKey, SubjectId, SubjectType, TokenClaims,
    TokenPair,
};

const BLACKLIST_SENTINEL: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leg {
    Access,
    Refresh,
}

struct LegKey {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl LegKey {
    fn from_secret(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

/// `aud` is written as an array but other issuers may send a single string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum AudienceClaim {
    One(String),
    Many(Vec<String>),
}

impl Default for AudienceClaim {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl AudienceClaim {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(aud) if aud.is_empty() => Vec::new(),
            Self::One(aud) => vec![aud],
            Self::Many(aud) => aud,
        }
    }
}

/// Claim set as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireClaims {
    iss: String,
    sub: String,
    #[serde(default)]
    subject_type: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    scope: Vec<String>,
    #[serde(default)]
    aud: AudienceClaim,
    #[serde(default)]
    client_id: String,
    jti: String,
    iat: i64,
    exp: i64,
}

impl WireClaims {
    fn into_claims(self) -> Result<TokenClaims> {
        let subject_type = match self.subject_type.as_str() {
            "" | "user" => SubjectType::User,
            "service" => SubjectType::Service,
            _ => return Err(Error::InvalidToken),
        };
        if self.sub.is_empty() || self.jti.is_empty() {
            return Err(Error::InvalidToken);
        }
        Ok(TokenClaims {
            subject_type,
            subject_id: SubjectId::from_string(self.sub),
            email: (!self.email.is_empty()).then_some(self.email),
            roles: self.roles.into_iter().map(RoleKey::from_string).collect(),
            scopes: self.scope.into_iter().map(ScopeKey::from_string).collect(),
            client_id: (!self.client_id.is_empty()).then(|| ClientId::from_string(self.client_id)),
            audience: self.aud.into_vec(),
            jti: self.jti,
            issued_at: timestamp(self.iat)?,
            expires_at: timestamp(self.exp)?,
            issuer: self.iss,
        })
    }
}

/// Just enough of a token to revoke it. Tolerates a missing or unreadable `exp`.
#[derive(Debug, Clone, Deserialize)]
struct RevocationClaims {
    #[serde(default)]
    jti: String,
    #[serde(default)]
    exp: Option<serde_json::Value>,
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or(Error::InvalidToken)
}

fn new_jti() -> String {
    Uuid::new_v4().to_string()
}

fn expiry(now: DateTime<Utc>, ttl: TimeDelta) -> Result<DateTime<Utc>> {
    now.checked_add_signed(ttl)
        .ok_or_else(|| Error::Config("token lifetime overflows the calendar".into()))
}

fn to_delta(ttl: Duration, what: &str) -> Result<TimeDelta> {
    TimeDelta::from_std(ttl).map_err(|_| Error::Config(format!("{what} is out of range")))
}

/// Builder for [`TokenEngine`].
pub struct TokenEngineBuilder<C> {
    store: C,
    config: TokenConfig,
    clock: Arc<dyn Clock>,
}

impl<C: CredentialStore> TokenEngineBuilder<C> {
    /// Creates a builder using the system clock.
    pub fn new(store: C, config: TokenConfig) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the time source.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Validates the configuration and builds the engine.
    pub fn build(self) -> Result<TokenEngine<C>> {
        let config = self.config;
        config.validate()?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        let mut lenient = validation.clone();
        lenient.required_spec_claims = HashSet::new();

        Ok(TokenEngine {
            store: self.store,
            clock: self.clock,
            keys: KeySpace::new(config.key_prefix.clone()),
            access_key: LegKey::from_secret(&config.access_secret),
            refresh_key: LegKey::from_secret(&config.refresh_secret),
            access_ttl: to_delta(config.access_ttl(), "access ttl")?,
            refresh_ttl: to_delta(config.refresh_ttl(), "refresh ttl")?,
            validation,
            lenient,
            config,
        })
    }
}

/// Token engine over a credential store.
pub struct TokenEngine<C> {
    store: C,
    clock: Arc<dyn Clock>,
    keys: KeySpace,
    access_key: LegKey,
    refresh_key: LegKey,
    access_ttl: TimeDelta,
    refresh_ttl: TimeDelta,
    validation: Validation,
    lenient: Validation,
    config: TokenConfig,
}

impl<C> fmt::Debug for TokenEngine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenEngine")
            .field("clock", &self.clock)
            .field("keys", &self.keys)
            .field("signing_keys", &"<redacted>")
            .field("config", &self.config)
            .finish()
    }
}

impl<C> TokenEngine<C>
where
    C: CredentialStore,
{
    /// Mints an access and refresh token pair and records the refresh JTI.
    pub async fn issue_pair(&self, principal: &Principal) -> Result<TokenPair> {
        let now = self.now();
        let access_jti = new_jti();
        let mut refresh_jti = new_jti();
        while refresh_jti == access_jti {
            refresh_jti = new_jti();
        }
        let access_exp = expiry(now, self.access_ttl)?;
        let refresh_exp = expiry(now, self.refresh_ttl)?;

        let access_token = self.sign(
            Leg::Access,
            &self.wire_claims(principal, access_jti.clone(), now, access_exp),
        )?;
        let refresh_token = self.sign(
            Leg::Refresh,
            &self.wire_claims(principal, refresh_jti.clone(), now, refresh_exp),
        )?;

        self.record_refresh(principal.id(), &refresh_jti).await?;
        debug!(
            subject = %principal.id(),
            subject_type = %principal.subject_type(),
            access_jti = %access_jti,
            refresh_jti = %refresh_jti,
            "issued token pair"
        );

        Ok(TokenPair {
            access_token,
            refresh_token,
            access_exp,
            refresh_exp,
        })
    }

    /// Mints a standalone access token with no refresh bookkeeping.
    pub fn issue_access_only(&self, principal: &Principal) -> Result<(String, DateTime<Utc>)> {
        let now = self.now();
        let jti = new_jti();
        let exp = expiry(now, self.access_ttl)?;
        let token = self.sign(Leg::Access, &self.wire_claims(principal, jti.clone(), now, exp))?;
        debug!(subject = %principal.id(), jti = %jti, "issued access-only token");
        Ok((token, exp))
    }

    /// Verifies signature, expiry and blacklist state of an access token.
    ///
    /// A failing blacklist lookup is an error, never "not revoked".
    pub async fn verify_access(&self, token: &str) -> Result<TokenClaims> {
        let claims = self.decode_leg(Leg::Access, token)?;
        let blacklisted = bounded(
            self.config.store_timeout(),
            self.store.exists(&self.keys.blacklist(&claims.jti)),
        )
        .await?;
        if blacklisted {
            return Err(Error::Revoked);
        }
        Ok(claims)
    }

    /// Verifies signature and expiry of a refresh token without consulting the store.
    pub fn verify_refresh(&self, token: &str) -> Result<TokenClaims> {
        self.decode_leg(Leg::Refresh, token)
    }

    /// Exchanges a refresh token for a new pair. Each refresh JTI rotates at most once.
    ///
    /// If the successor cannot be issued the old refresh token is put back
    /// for the rest of its lifetime.
    pub async fn rotate(&self, refresh_token: &str) -> Result<TokenPair> {
        let claims = self.verify_refresh(refresh_token)?;
        let owner = bounded(
            self.config.store_timeout(),
            self.store.take(&self.keys.refresh(&claims.jti)),
        )
        .await?
        .ok_or(Error::RefreshNotFound)?;

        match self.issue_pair(&Principal::from_claims(&claims)).await {
            Ok(pair) => {
                self.untrack_refresh(&owner, &claims.jti).await;
                debug!(subject = %claims.subject_id, old_jti = %claims.jti, "rotated refresh token");
                Ok(pair)
            }
            Err(err) => {
                self.restore_refresh(&owner, &claims).await;
                Err(err)
            }
        }
    }

    /// Revokes both legs of a pair.
    ///
    /// Each side is decoded and revoked independently: an unreadable token or
    /// a failed store write on one side never blocks the other, and the first
    /// failure is returned. Repeating the call is a no-op.
    pub async fn revoke_pair(&self, access_token: &str, refresh_token: &str) -> Result<()> {
        let access = match self.decode_for_revocation(Leg::Access, access_token) {
            Some(claims) => self.blacklist(&claims).await,
            None => Ok(()),
        };
        let refresh = match self.decode_for_revocation(Leg::Refresh, refresh_token) {
            Some(claims) => self.drop_refresh(&claims.jti).await,
            None => Ok(()),
        };
        access.and(refresh)
    }

    /// Reports whether an access token is currently usable.
    ///
    /// Invalid and revoked tokens are reported inactive; only store failures
    /// surface as errors.
    pub async fn introspect(&self, token: &str) -> Result<Introspection> {
        match self.verify_access(token).await {
            Ok(claims) => Ok(Introspection::active(claims)),
            Err(Error::InvalidToken | Error::Revoked) => Ok(Introspection::inactive()),
            Err(err) => Err(err),
        }
    }

    /// Deletes every tracked refresh token of `owner`. Returns how many were live.
    ///
    /// This is a sequential fan-out of single deletes. If the future is
    /// dropped midway some refresh tokens stay revoked and the rest stay
    /// valid. Only the JTIs read up front leave the owner set, so a token
    /// issued concurrently stays tracked and valid.
    pub async fn revoke_all_for_owner(&self, owner: &SubjectId) -> Result<usize> {
        let timeout = self.config.store_timeout();
        let set_key = self.keys.owner_refresh_set(owner.as_str());
        let jtis = bounded(timeout, self.store.set_members(&set_key)).await?;

        let mut revoked = 0;
        for jti in &jtis {
            if bounded(timeout, self.store.delete(&self.keys.refresh(jti))).await? {
                revoked += 1;
            }
            bounded(timeout, self.store.set_remove(&set_key, jti)).await?;
        }

        info!(owner = %owner, revoked, tracked = jtis.len(), "revoked all refresh tokens");
        Ok(revoked)
    }

    fn now(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now)
    }

    fn key(&self, leg: Leg) -> &LegKey {
        match leg {
            Leg::Access => &self.access_key,
            Leg::Refresh => &self.refresh_key,
        }
    }

    fn wire_claims(
        &self,
        principal: &Principal,
        jti: String,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> WireClaims {
        let audience = if principal.audience().is_empty() {
            self.config.default_audience.clone()
        } else {
            principal.audience().to_vec()
        };
        WireClaims {
            iss: self.config.issuer.clone(),
            sub: principal.id().to_string(),
            subject_type: principal.subject_type().as_str().to_string(),
            email: principal.email().unwrap_or_default().to_string(),
            roles: principal.roles().iter().map(ToString::to_string).collect(),
            scope: principal.scopes().iter().map(ToString::to_string).collect(),
            aud: AudienceClaim::Many(audience),
            client_id: principal
                .client_id()
                .map(ToString::to_string)
                .unwrap_or_default(),
            jti,
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        }
    }

    fn sign(&self, leg: Leg, claims: &WireClaims) -> Result<String> {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &self.key(leg).encoding,
        )
        .map_err(Error::Sign)
    }

    fn decode_leg(&self, leg: Leg, token: &str) -> Result<TokenClaims> {
        let data = decode::<WireClaims>(token, &self.key(leg).decoding, &self.validation)
            .map_err(|_| Error::InvalidToken)?;
        let claims = data.claims.into_claims()?;
        if claims.expires_at <= self.clock.now() {
            return Err(Error::InvalidToken);
        }
        Ok(claims)
    }

    fn decode_for_revocation(&self, leg: Leg, token: &str) -> Option<RevocationClaims> {
        let claims = decode::<RevocationClaims>(token, &self.key(leg).decoding, &self.lenient)
            .ok()?
            .claims;
        (!claims.jti.is_empty()).then_some(claims)
    }

    async fn blacklist(&self, claims: &RevocationClaims) -> Result<()> {
        let exp = claims.exp.as_ref().and_then(serde_json::Value::as_i64);
        let ttl = match exp {
            Some(exp) => {
                let remaining_ms = exp
                    .saturating_mul(1_000)
                    .saturating_sub(self.clock.now().timestamp_millis());
                if remaining_ms <= 0 {
                    debug!(jti = %claims.jti, "access token already expired; nothing to blacklist");
                    return Ok(());
                }
                Duration::from_millis(remaining_ms as u64)
            }
            None => self.config.access_ttl(),
        };

        bounded(
            self.config.store_timeout(),
            self.store
                .set(&self.keys.blacklist(&claims.jti), BLACKLIST_SENTINEL, ttl),
        )
        .await?;
        info!(jti = %claims.jti, ttl_ms = ttl.as_millis() as u64, "blacklisted access token");
        Ok(())
    }

    async fn record_refresh(&self, owner: &SubjectId, jti: &str) -> Result<()> {
        let timeout = self.config.store_timeout();
        let ttl = self.config.refresh_ttl();
        bounded(
            timeout,
            self.store.set(&self.keys.refresh(jti), owner.as_str(), ttl),
        )
        .await?;

        if self.config.track_owner_refresh {
            let set_key = self.keys.owner_refresh_set(owner.as_str());
            let tracked = async {
                self.store.set_add(&set_key, jti).await?;
                self.store.expire(&set_key, ttl).await
            };
            if let Err(err) = bounded(timeout, tracked).await {
                warn!(owner = %owner, jti, error = %err, "failed to track refresh token for owner");
            }
        }
        Ok(())
    }

    async fn drop_refresh(&self, jti: &str) -> Result<()> {
        let owner = bounded(
            self.config.store_timeout(),
            self.store.take(&self.keys.refresh(jti)),
        )
        .await?;
        if let Some(owner) = owner {
            self.untrack_refresh(&owner, jti).await;
            info!(jti, owner = %owner, "revoked refresh token");
        }
        Ok(())
    }

    async fn restore_refresh(&self, owner: &str, claims: &TokenClaims) {
        let Ok(remaining) = (claims.expires_at - self.clock.now()).to_std() else {
            return;
        };
        if remaining.is_zero() {
            return;
        }
        let timeout = self.config.store_timeout();
        let key = self.keys.refresh(&claims.jti);
        if let Err(err) = bounded(timeout, self.store.set(&key, owner, remaining)).await {
            warn!(owner, jti = %claims.jti, error = %err, "failed to restore refresh token after rotation failure");
            return;
        }
        debug!(owner, jti = %claims.jti, "restored refresh token after rotation failure");
    }

    async fn untrack_refresh(&self, owner: &str, jti: &str) {
        if !self.config.track_owner_refresh {
            return;
        }
        let set_key = self.keys.owner_refresh_set(owner);
        if let Err(err) = bounded(
            self.config.store_timeout(),
            self.store.set_remove(&set_key, jti),
        )
        .await
        {
            warn!(owner, jti, error = %err, "failed to untrack refresh token");
        }
    }
}
