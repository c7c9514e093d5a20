use crate::error::StoreError;
use crate::types::{
    Client, ClientId, DirectGrant, Role, RoleId, RoleKey, Scope, ScopeId, ScopeKey, SubjectId,
    UserScopeGrant,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Store interface for the role and scope catalog.
///
/// Creates report a taken key with [`crate::DuplicateKey`]; links to unknown
/// records report [`crate::MissingReference`].
#[async_trait]
pub trait CatalogStore {
    /// Creates a role with a unique key.
    async fn create_role(&self, key: RoleKey, desc: String)
    -> std::result::Result<Role, StoreError>;

    /// Creates a scope with a unique key.
    async fn create_scope(
        &self,
        key: ScopeKey,
        desc: String,
    ) -> std::result::Result<Scope, StoreError>;

    /// Lists all roles.
    async fn list_roles(&self) -> std::result::Result<Vec<Role>, StoreError>;

    /// Lists all scopes ordered by key.
    async fn list_scopes(&self) -> std::result::Result<Vec<Scope>, StoreError>;

    /// Links scopes to a role. Existing links are kept.
    async fn add_scopes_to_role(
        &self,
        role: RoleId,
        scopes: Vec<ScopeId>,
    ) -> std::result::Result<(), StoreError>;

    /// Returns the users holding a role.
    async fn role_members(&self, role: RoleId) -> std::result::Result<Vec<SubjectId>, StoreError>;
}

/// Store interface for user role assignments and direct scope grants.
#[async_trait]
pub trait UserGrantStore {
    /// Assigns roles to a user. Existing assignments are kept.
    async fn add_roles_to_user(
        &self,
        user: SubjectId,
        roles: Vec<RoleId>,
    ) -> std::result::Result<(), StoreError>;

    /// Returns the keys of roles assigned to a user.
    async fn user_role_keys(&self, user: SubjectId)
    -> std::result::Result<Vec<RoleKey>, StoreError>;

    /// Returns the keys of scopes reachable through the user's roles.
    async fn user_role_scope_keys(
        &self,
        user: SubjectId,
    ) -> std::result::Result<Vec<ScopeKey>, StoreError>;

    /// Returns direct grants whose expiry is absent or after `as_of`.
    async fn user_direct_grants(
        &self,
        user: SubjectId,
        as_of: DateTime<Utc>,
    ) -> std::result::Result<Vec<DirectGrant>, StoreError>;

    /// Inserts a grant, or updates `granted_by`/`expires_at` of an existing one.
    async fn upsert_user_scope(&self, grant: UserScopeGrant)
    -> std::result::Result<(), StoreError>;

    /// Deletes a direct grant. Missing grants are not an error.
    async fn delete_user_scope(
        &self,
        user: SubjectId,
        scope: ScopeId,
    ) -> std::result::Result<(), StoreError>;
}

/// Store interface for service clients.
#[async_trait]
pub trait ClientStore {
    /// Looks up a client by its public id.
    async fn find_client(
        &self,
        client_id: ClientId,
    ) -> std::result::Result<Option<Client>, StoreError>;

    /// Links scopes to a client. Existing links are kept.
    async fn add_scopes_to_client(
        &self,
        client_id: ClientId,
        scopes: Vec<ScopeId>,
    ) -> std::result::Result<(), StoreError>;

    /// Returns the keys of scopes linked to a client.
    async fn client_scope_keys(
        &self,
        client_id: ClientId,
    ) -> std::result::Result<Vec<ScopeKey>, StoreError>;
}

/// Composite store trait.
pub trait Store: CatalogStore + UserGrantStore + ClientStore + Send + Sync {}

impl<T> Store for T where T: CatalogStore + UserGrantStore + ClientStore + Send + Sync {}
