use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{DuplicateKey, MissingReference, StoreError};
use crate::store::{CatalogStore, ClientStore, UserGrantStore};
use crate::types::{
    Client, ClientId, DirectGrant, Role, RoleId, RoleKey, Scope, ScopeId, ScopeKey, SubjectId,
    UserScopeGrant,
};

/// In-memory relational store for tests and demos.
///
/// All tables sit behind one lock so reference checks and writes are atomic.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Tables>>,
}

#[derive(Debug, Default)]
struct Tables {
    roles: HashMap<RoleId, Role>,
    scopes: HashMap<ScopeId, Scope>,
    role_scopes: HashMap<RoleId, HashSet<ScopeId>>,
    user_roles: HashMap<SubjectId, HashSet<RoleId>>,
    user_scopes: HashMap<(SubjectId, ScopeId), UserScopeGrant>,
    clients: HashMap<ClientId, Client>,
    client_scopes: HashMap<ClientId, HashSet<ScopeId>>,
}

impl Tables {
    fn require_role(&self, role: &RoleId) -> std::result::Result<(), StoreError> {
        if self.roles.contains_key(role) {
            Ok(())
        } else {
            Err(Box::new(MissingReference(format!("role {role}"))))
        }
    }

    fn require_scopes(&self, scopes: &[ScopeId]) -> std::result::Result<(), StoreError> {
        match scopes.iter().find(|scope| !self.scopes.contains_key(*scope)) {
            Some(missing) => Err(Box::new(MissingReference(format!("scope {missing}")))),
            None => Ok(()),
        }
    }

    fn scope_keys<'a>(&self, ids: impl IntoIterator<Item = &'a ScopeId>) -> Vec<ScopeKey> {
        ids.into_iter()
            .filter_map(|id| self.scopes.get(id))
            .map(|scope| scope.key.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a service client.
    pub fn insert_client(&self, client: Client) {
        let mut guard = self.inner.write().expect("poisoned lock");
        guard.clients.insert(client.client_id.clone(), client);
    }

    /// Sets a client's active flag. Returns false for unknown clients.
    pub fn set_client_active(&self, client_id: &ClientId, active: bool) -> bool {
        let mut guard = self.inner.write().expect("poisoned lock");
        match guard.clients.get_mut(client_id) {
            Some(client) => {
                client.active = active;
                true
            }
            None => false,
        }
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn create_role(
        &self,
        key: RoleKey,
        desc: String,
    ) -> std::result::Result<Role, StoreError> {
        let mut guard = self.inner.write().expect("poisoned lock");
        if guard.roles.values().any(|role| role.key == key) {
            return Err(Box::new(DuplicateKey(format!("role {key}"))));
        }
        let role = Role {
            id: RoleId::from_string(new_id()),
            key,
            desc,
        };
        guard.roles.insert(role.id.clone(), role.clone());
        Ok(role)
    }

    async fn create_scope(
        &self,
        key: ScopeKey,
        desc: String,
    ) -> std::result::Result<Scope, StoreError> {
        let mut guard = self.inner.write().expect("poisoned lock");
        if guard.scopes.values().any(|scope| scope.key == key) {
            return Err(Box::new(DuplicateKey(format!("scope {key}"))));
        }
        let scope = Scope {
            id: ScopeId::from_string(new_id()),
            key,
            desc,
        };
        guard.scopes.insert(scope.id.clone(), scope.clone());
        Ok(scope)
    }

    async fn list_roles(&self) -> std::result::Result<Vec<Role>, StoreError> {
        let guard = self.inner.read().expect("poisoned lock");
        let mut roles: Vec<Role> = guard.roles.values().cloned().collect();
        roles.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(roles)
    }

    async fn list_scopes(&self) -> std::result::Result<Vec<Scope>, StoreError> {
        let guard = self.inner.read().expect("poisoned lock");
        let mut scopes: Vec<Scope> = guard.scopes.values().cloned().collect();
        scopes.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(scopes)
    }

    async fn add_scopes_to_role(
        &self,
        role: RoleId,
        scopes: Vec<ScopeId>,
    ) -> std::result::Result<(), StoreError> {
        let mut guard = self.inner.write().expect("poisoned lock");
        guard.require_role(&role)?;
        guard.require_scopes(&scopes)?;
        guard.role_scopes.entry(role).or_default().extend(scopes);
        Ok(())
    }

    async fn role_members(&self, role: RoleId) -> std::result::Result<Vec<SubjectId>, StoreError> {
        let guard = self.inner.read().expect("poisoned lock");
        let mut members: Vec<SubjectId> = guard
            .user_roles
            .iter()
            .filter(|(_, roles)| roles.contains(&role))
            .map(|(user, _)| user.clone())
            .collect();
        members.sort();
        Ok(members)
    }
}

#[async_trait]
impl UserGrantStore for MemoryStore {
    async fn add_roles_to_user(
        &self,
        user: SubjectId,
        roles: Vec<RoleId>,
    ) -> std::result::Result<(), StoreError> {
        let mut guard = self.inner.write().expect("poisoned lock");
        for role in &roles {
            guard.require_role(role)?;
        }
        guard.user_roles.entry(user).or_default().extend(roles);
        Ok(())
    }

    async fn user_role_keys(
        &self,
        user: SubjectId,
    ) -> std::result::Result<Vec<RoleKey>, StoreError> {
        let guard = self.inner.read().expect("poisoned lock");
        let keys: BTreeSet<RoleKey> = guard
            .user_roles
            .get(&user)
            .into_iter()
            .flatten()
            .filter_map(|id| guard.roles.get(id))
            .map(|role| role.key.clone())
            .collect();
        Ok(keys.into_iter().collect())
    }

    async fn user_role_scope_keys(
        &self,
        user: SubjectId,
    ) -> std::result::Result<Vec<ScopeKey>, StoreError> {
        let guard = self.inner.read().expect("poisoned lock");
        let scope_ids = guard
            .user_roles
            .get(&user)
            .into_iter()
            .flatten()
            .filter_map(|role| guard.role_scopes.get(role))
            .flatten();
        Ok(guard.scope_keys(scope_ids))
    }

    async fn user_direct_grants(
        &self,
        user: SubjectId,
        as_of: DateTime<Utc>,
    ) -> std::result::Result<Vec<DirectGrant>, StoreError> {
        let guard = self.inner.read().expect("poisoned lock");
        let mut grants: Vec<DirectGrant> = guard
            .user_scopes
            .values()
            .filter(|grant| grant.user_id == user)
            .filter(|grant| grant.expires_at.is_none_or(|exp| exp > as_of))
            .filter_map(|grant| {
                guard.scopes.get(&grant.scope_id).map(|scope| DirectGrant {
                    scope: scope.key.clone(),
                    expires_at: grant.expires_at,
                })
            })
            .collect();
        grants.sort_by(|a, b| a.scope.cmp(&b.scope));
        Ok(grants)
    }

    async fn upsert_user_scope(
        &self,
        grant: UserScopeGrant,
    ) -> std::result::Result<(), StoreError> {
        let mut guard = self.inner.write().expect("poisoned lock");
        guard.require_scopes(std::slice::from_ref(&grant.scope_id))?;
        let key = (grant.user_id.clone(), grant.scope_id.clone());
        match guard.user_scopes.entry(key) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                existing.granted_by = grant.granted_by;
                existing.expires_at = grant.expires_at;
            }
            Entry::Vacant(entry) => {
                entry.insert(grant);
            }
        }
        Ok(())
    }

    async fn delete_user_scope(
        &self,
        user: SubjectId,
        scope: ScopeId,
    ) -> std::result::Result<(), StoreError> {
        let mut guard = self.inner.write().expect("poisoned lock");
        guard.user_scopes.remove(&(user, scope));
        Ok(())
    }
}

#[async_trait]
impl ClientStore for MemoryStore {
    async fn find_client(
        &self,
        client_id: ClientId,
    ) -> std::result::Result<Option<Client>, StoreError> {
        let guard = self.inner.read().expect("poisoned lock");
        Ok(guard.clients.get(&client_id).cloned())
    }

    async fn add_scopes_to_client(
        &self,
        client_id: ClientId,
        scopes: Vec<ScopeId>,
    ) -> std::result::Result<(), StoreError> {
        let mut guard = self.inner.write().expect("poisoned lock");
        if !guard.clients.contains_key(&client_id) {
            return Err(Box::new(MissingReference(format!("client {client_id}"))));
        }
        guard.require_scopes(&scopes)?;
        guard.client_scopes.entry(client_id).or_default().extend(scopes);
        Ok(())
    }

    async fn client_scope_keys(
        &self,
        client_id: ClientId,
    ) -> std::result::Result<Vec<ScopeKey>, StoreError> {
        let guard = self.inner.read().expect("poisoned lock");
        Ok(guard.scope_keys(guard.client_scopes.get(&client_id).into_iter().flatten()))
    }
}
