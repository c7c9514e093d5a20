use crate::cache::{Cache, CacheKey, NoCache};
use crate::clock::{Clock, SystemClock};
use crate::config::PermissionConfig;
use crate::credential_store::bounded;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{
    ClientId, Grants, Role, RoleId, RoleKey, Scope, ScopeId, ScopeKey, SubjectId, UserScopeGrant,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Resolves effective roles and scopes and owns cache invalidation.
///
/// Every mutation that targets a user or client drops that principal's cache
/// entry before returning.
pub struct PermissionResolver<S, C = NoCache> {
    store: S,
    cache: C,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl<S, C> fmt::Debug for PermissionResolver<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionResolver")
            .field("clock", &self.clock)
            .field("store_timeout", &self.store_timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for [`PermissionResolver`].
pub struct ResolverBuilder<S, C = NoCache> {
    store: S,
    cache: C,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl<S> ResolverBuilder<S, NoCache> {
    /// Creates a builder without a cache.
    pub fn new(store: S) -> Self {
        Self {
            store,
            cache: NoCache,
            clock: Arc::new(SystemClock),
            store_timeout: PermissionConfig::default().store_timeout(),
        }
    }
}

impl<S, C> ResolverBuilder<S, C> {
    /// Sets the cache implementation.
    pub fn cache<C2: Cache>(self, cache: C2) -> ResolverBuilder<S, C2> {
        ResolverBuilder {
            store: self.store,
            cache,
            clock: self.clock,
            store_timeout: self.store_timeout,
        }
    }

    /// Sets the time source used for client lookups.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Sets the budget for each relational store call.
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Applies the store budget from a [`PermissionConfig`].
    pub fn config(self, config: &PermissionConfig) -> Self {
        self.store_timeout(config.store_timeout())
    }

    /// Builds the resolver.
    pub fn build(self) -> PermissionResolver<S, C> {
        PermissionResolver {
            store: self.store,
            cache: self.cache,
            clock: self.clock,
            store_timeout: self.store_timeout,
        }
    }
}

impl<S, C> PermissionResolver<S, C>
where
    S: Store,
    C: Cache,
{
    /// Returns the roles and effective scopes a user holds at `as_of`.
    ///
    /// Effective scopes are the union of role-derived scopes and direct grants
    /// that have no expiry or expire after `as_of`.
    pub async fn list_user_scopes_effective(
        &self,
        user: &SubjectId,
        as_of: DateTime<Utc>,
    ) -> Result<Grants> {
        let key = CacheKey::User(user.clone());
        if let Some(grants) = self.cache.get_grants(&key, as_of).await {
            debug!(user = %user, "resolved user grants from cache");
            return Ok(grants);
        }

        let role_scopes = bounded(self.store_timeout, self.store.user_role_scope_keys(user.clone()))
            .await
            .map_err(Error::from)?;
        let direct = bounded(
            self.store_timeout,
            self.store.user_direct_grants(user.clone(), as_of),
        )
        .await
        .map_err(Error::from)?;
        let roles = bounded(self.store_timeout, self.store.user_role_keys(user.clone()))
            .await
            .map_err(Error::from)?;

        let valid_until = direct.iter().filter_map(|grant| grant.expires_at).min();
        let scopes: BTreeSet<ScopeKey> = role_scopes
            .into_iter()
            .chain(direct.into_iter().map(|grant| grant.scope))
            .collect();
        let grants = Grants {
            roles: dedup(roles),
            scopes: scopes.into_iter().collect(),
        };

        self.cache
            .set_grants(&key, &grants, as_of, valid_until)
            .await;
        debug!(
            user = %user,
            roles = grants.roles.len(),
            scopes = grants.scopes.len(),
            "resolved user grants"
        );
        Ok(grants)
    }

    /// Returns the scopes attached to a client.
    pub async fn list_client_scopes(&self, client: &ClientId) -> Result<Vec<ScopeKey>> {
        let key = CacheKey::Client(client.clone());
        let now = self.clock.now();
        if let Some(grants) = self.cache.get_grants(&key, now).await {
            debug!(client = %client, "resolved client scopes from cache");
            return Ok(grants.scopes);
        }

        let scopes = bounded(self.store_timeout, self.store.client_scope_keys(client.clone()))
            .await
            .map_err(Error::from)?;
        let grants = Grants {
            roles: Vec::new(),
            scopes: dedup(scopes),
        };
        self.cache.set_grants(&key, &grants, now, None).await;
        debug!(client = %client, scopes = grants.scopes.len(), "resolved client scopes");
        Ok(grants.scopes)
    }

    /// Returns the keys of roles held by a user.
    pub async fn list_user_roles(&self, user: &SubjectId) -> Result<Vec<RoleKey>> {
        bounded(self.store_timeout, self.store.user_role_keys(user.clone()))
            .await
            .map(dedup)
            .map_err(Error::from)
    }

    /// Lists the role catalog.
    pub async fn list_roles(&self) -> Result<Vec<Role>> {
        bounded(self.store_timeout, self.store.list_roles())
            .await
            .map_err(Error::from)
    }

    /// Lists the scope catalog.
    pub async fn list_scopes(&self) -> Result<Vec<Scope>> {
        bounded(self.store_timeout, self.store.list_scopes())
            .await
            .map_err(Error::from)
    }

    /// Creates a role. A taken key fails with [`Error::Conflict`].
    pub async fn create_role(&self, key: RoleKey, desc: impl Into<String>) -> Result<Role> {
        bounded(self.store_timeout, self.store.create_role(key, desc.into()))
            .await
            .map_err(Error::from)
    }

    /// Creates a scope. A taken key fails with [`Error::Conflict`].
    pub async fn create_scope(&self, key: ScopeKey, desc: impl Into<String>) -> Result<Scope> {
        bounded(self.store_timeout, self.store.create_scope(key, desc.into()))
            .await
            .map_err(Error::from)
    }

    /// Attaches scopes to a role and drops the cache of every holder.
    pub async fn add_scopes_to_role(&self, role: &RoleId, scopes: Vec<ScopeId>) -> Result<()> {
        bounded(
            self.store_timeout,
            self.store.add_scopes_to_role(role.clone(), scopes),
        )
        .await
        .map_err(Error::from)?;
        let members = bounded(self.store_timeout, self.store.role_members(role.clone()))
            .await
            .map_err(Error::from)?;
        for member in &members {
            self.invalidate_user(member).await?;
        }
        debug!(role = %role, members = members.len(), "attached scopes to role");
        Ok(())
    }

    /// Assigns roles to a user.
    pub async fn add_roles_to_user(&self, user: &SubjectId, roles: Vec<RoleId>) -> Result<()> {
        bounded(
            self.store_timeout,
            self.store.add_roles_to_user(user.clone(), roles),
        )
        .await
        .map_err(Error::from)?;
        self.invalidate_user(user).await
    }

    /// Attaches scopes to a client.
    pub async fn add_scopes_to_client(&self, client: &ClientId, scopes: Vec<ScopeId>) -> Result<()> {
        bounded(
            self.store_timeout,
            self.store.add_scopes_to_client(client.clone(), scopes),
        )
        .await
        .map_err(Error::from)?;
        self.invalidate_client(client).await
    }

    /// Grants a scope directly to a user. Repeating the grant updates
    /// `granted_by` and `expires_at`.
    pub async fn grant_user_scope(
        &self,
        user: &SubjectId,
        scope: &ScopeId,
        granted_by: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let grant = UserScopeGrant {
            user_id: user.clone(),
            scope_id: scope.clone(),
            granted_by: granted_by.into(),
            expires_at,
        };
        bounded(self.store_timeout, self.store.upsert_user_scope(grant))
            .await
            .map_err(Error::from)?;
        self.invalidate_user(user).await
    }

    /// Removes a direct grant. Removing a missing grant is not an error.
    pub async fn revoke_user_scope(&self, user: &SubjectId, scope: &ScopeId) -> Result<()> {
        bounded(
            self.store_timeout,
            self.store.delete_user_scope(user.clone(), scope.clone()),
        )
        .await
        .map_err(Error::from)?;
        self.invalidate_user(user).await
    }

    /// Drops the cached grants of a user.
    pub async fn invalidate_user(&self, user: &SubjectId) -> Result<()> {
        self.cache.invalidate(&CacheKey::User(user.clone())).await
    }

    /// Drops the cached scopes of a client.
    pub async fn invalidate_client(&self, client: &ClientId) -> Result<()> {
        self.cache
            .invalidate(&CacheKey::Client(client.clone()))
            .await
    }
}

fn dedup<T: Ord>(items: Vec<T>) -> Vec<T> {
    items.into_iter().collect::<BTreeSet<_>>().into_iter().collect()
}
