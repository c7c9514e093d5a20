//! Credential issuance and authorization core.
//!
//! The crate issues, verifies, rotates and revokes signed access/refresh token
//! pairs ([`TokenEngine`]), resolves the effective roles and scopes of users
//! and service clients ([`PermissionResolver`]), evaluates fail-closed
//! authorization policies ([`Policy`]) and authenticates service clients
//! ([`ClientCredentialValidator`]). Storage sits behind the async
//! [`CredentialStore`] and [`Store`] traits.
//!
//! # Examples
//!
//! Issuing and verifying a token pair with the in-memory credential store
//! (enable `memory-credentials`):
//! ```no_run
//! # #[cfg(feature = "memory-credentials")]
//! # async fn demo() -> rs_authcore::Result<()> {
//! use rs_authcore::{MemoryCredentialStore, Principal, SubjectId, TokenConfig, TokenEngineBuilder};
//!
//! let config = TokenConfig::new("access-secret", "refresh-secret");
//! let engine = TokenEngineBuilder::new(MemoryCredentialStore::new(), config).build()?;
//! let principal = Principal::user(SubjectId::new("user-1")?, "alice@example.com");
//! let pair = engine.issue_pair(&principal).await?;
//! let claims = engine.verify_access(&pair.access_token).await?;
//! assert_eq!(claims.subject_id.as_str(), "user-1");
//! # Ok(())
//! # }
//! ```
//!
//! Resolving effective scopes through a cache (enable `memory-store` and
//! `memory-credentials`):
//! ```no_run
//! # #[cfg(all(feature = "memory-store", feature = "memory-credentials"))]
//! # async fn demo() -> rs_authcore::Result<()> {
//! use rs_authcore::{
//!     CredentialCache, MemoryCredentialStore, MemoryStore, PermissionConfig, ResolverBuilder,
//!     SubjectId,
//! };
//!
//! let cache = CredentialCache::new(MemoryCredentialStore::new(), &PermissionConfig::default());
//! let resolver = ResolverBuilder::new(MemoryStore::new()).cache(cache).build();
//! let grants = resolver
//!     .list_user_scopes_effective(&SubjectId::new("user-1")?, chrono::Utc::now())
//!     .await?;
//! # let _ = grants;
//! # Ok(())
//! # }
//! ```
#![forbid(unsafe_code)]

mod cache;
mod client_credentials;
mod clock;
mod config;
mod credential_store;
mod error;
mod guard;
mod resolver;
mod secret;
mod store;
mod token;
mod types;

#[cfg(any(test, feature = "memory-store"))]
mod memory_store;

#[cfg(any(test, feature = "memory-credentials"))]
mod memory_credentials;

#[cfg(feature = "redis")]
mod redis_store;

#[cfg(test)]
mod test_support;

#[cfg(feature = "axum")]
pub mod axum;

pub use crate::cache::{Cache, CacheKey, CredentialCache, NoCache};
pub use crate::client_credentials::ClientCredentialValidator;
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::{AuthConfig, PermissionConfig, TokenConfig};
pub use crate::credential_store::{CredentialStore, KeySpace};
pub use crate::error::{
    DuplicateKey, Error, MissingReference, Result, StoreError, StoreTimeout,
};
pub use crate::guard::{AuthContext, Policy, authenticate, bearer_token};
pub use crate::resolver::{PermissionResolver, ResolverBuilder};
pub use crate::secret::{Argon2Verifier, SecretVerifier, hash_secret};
pub use crate::store::{CatalogStore, ClientStore, Store, UserGrantStore};
pub use crate::token::{TokenEngine, TokenEngineBuilder};
pub use crate::types::{
    Client, ClientId, DirectGrant, Grants, Introspection, Principal, Role, RoleId, RoleKey,
    Scope, ScopeId, ScopeKey, SubjectId, SubjectType, TokenClaims, TokenPair, UserScopeGrant,
};

#[cfg(feature = "memory-store")]
pub use crate::memory_store::MemoryStore;

#[cfg(feature = "memory-credentials")]
pub use crate::memory_credentials::MemoryCredentialStore;

#[cfg(feature = "redis")]
pub use crate::redis_store::RedisCredentialStore;
