//! Request-scoped principals and composable authorization policies.
//!
//! Checks fail closed: a request without a verified principal is
//! [`Error::Unauthorized`], and a principal failing a predicate is
//! [`Error::Forbidden`].

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;

use crate::credential_store::CredentialStore;
use crate::error::{Error, Result};
use crate::token::TokenEngine;
use crate::types::{Principal, RoleKey, ScopeKey, SubjectType};

/// Principal attached to a single request.
///
/// Cloning shares the principal; nothing downstream can mutate it.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    principal: Option<Arc<Principal>>,
}

impl AuthContext {
    /// Context of a request that has not been authenticated.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Context carrying a verified principal.
    pub fn authenticated(principal: Principal) -> Self {
        Self {
            principal: Some(Arc::new(principal)),
        }
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.principal.is_some()
    }

    /// Evaluates `policy` against this context.
    pub fn enforce(&self, policy: &Policy) -> Result<()> {
        policy.check(self.principal())
    }
}

/// Verifies an access token and builds the request context from its claims.
pub async fn authenticate<C: CredentialStore>(
    engine: &TokenEngine<C>,
    token: &str,
) -> Result<AuthContext> {
    let claims = engine.verify_access(token).await?;
    Ok(AuthContext::authenticated(Principal::from_claims(&claims)))
}

/// Extracts the token from an `Authorization` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Authorization predicate over a [`Principal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    /// Holds at least one of the scopes.
    AnyScope(Vec<ScopeKey>),
    /// Holds every one of the scopes.
    AllScopes(Vec<ScopeKey>),
    /// Holds at least one of the roles.
    AnyRole(Vec<RoleKey>),
    /// Audience contains the value.
    Audience(String),
    /// Subject type matches exactly.
    SubjectType(SubjectType),
    /// Every nested policy passes.
    All(Vec<Policy>),
}

impl Policy {
    pub fn require_scopes(scopes: impl IntoIterator<Item = ScopeKey>) -> Self {
        Self::AnyScope(scopes.into_iter().collect())
    }

    pub fn require_all_scopes(scopes: impl IntoIterator<Item = ScopeKey>) -> Self {
        Self::AllScopes(scopes.into_iter().collect())
    }

    pub fn require_roles(roles: impl IntoIterator<Item = RoleKey>) -> Self {
        Self::AnyRole(roles.into_iter().collect())
    }

    pub fn require_audience(audience: impl Into<String>) -> Self {
        Self::Audience(audience.into())
    }

    pub fn require_subject_type(subject_type: SubjectType) -> Self {
        Self::SubjectType(subject_type)
    }

    pub fn all(policies: impl IntoIterator<Item = Policy>) -> Self {
        Self::All(policies.into_iter().collect())
    }

    /// Checks the policy against an optional principal.
    pub fn check(&self, principal: Option<&Principal>) -> Result<()> {
        let principal = principal
            .filter(|principal| !principal.id().as_str().is_empty())
            .ok_or(Error::Unauthorized)?;
        self.evaluate(principal)
    }

    fn evaluate(&self, principal: &Principal) -> Result<()> {
        let passed = match self {
            Self::AnyScope(required) => has_any(principal.scopes(), required),
            Self::AllScopes(required) => has_all(principal.scopes(), required),
            Self::AnyRole(required) => has_any(principal.roles(), required),
            Self::Audience(required) => principal.audience().iter().any(|aud| aud == required),
            Self::SubjectType(required) => principal.subject_type() == *required,
            Self::All(policies) => {
                return policies
                    .iter()
                    .try_for_each(|policy| policy.evaluate(principal));
            }
        };
        if passed {
            Ok(())
        } else {
            Err(Error::Forbidden(self.reason().to_string()))
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            Self::AnyScope(_) => "missing required scope",
            Self::AllScopes(_) => "missing required scopes",
            Self::AnyRole(_) => "missing required role",
            Self::Audience(_) => "wrong audience",
            Self::SubjectType(_) => "wrong subject type",
            Self::All(_) => "policy not satisfied",
        }
    }
}

fn has_any<T: Eq + Hash>(held: &[T], required: &[T]) -> bool {
    let held: HashSet<&T> = held.iter().collect();
    required.iter().any(|item| held.contains(item))
}

fn has_all<T: Eq + Hash>(held: &[T], required: &[T]) -> bool {
    let held: HashSet<&T> = held.iter().collect();
    required.iter().all(|item| held.contains(item))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::TokenConfig;
    use crate::memory_credentials::MemoryCredentialStore;
    use crate::token::TokenEngineBuilder;
    use crate::types::{ClientId, SubjectId};
    use chrono::Utc;

    fn scopes(keys: &[&str]) -> Vec<ScopeKey> {
        keys.iter().map(|key| ScopeKey::new(key).unwrap()).collect()
    }

    fn user_with(scope_keys: &[&str]) -> Principal {
        Principal::user(SubjectId::new("user-1").unwrap(), "u@example.com")
            .with_roles(vec![RoleKey::new("editor").unwrap()])
            .with_scopes(scopes(scope_keys))
            .with_audience(vec!["api".into()])
    }

    #[test]
    fn any_of_and_all_of_scopes() {
        let any = Policy::require_scopes(scopes(&["a", "b"]));
        let all = Policy::require_all_scopes(scopes(&["a", "b"]));

        let only_a = user_with(&["a"]);
        let both = user_with(&["a", "b"]);
        let neither = user_with(&["c"]);

        assert!(any.check(Some(&only_a)).is_ok());
        assert!(any.check(Some(&both)).is_ok());
        assert!(matches!(any.check(Some(&neither)), Err(Error::Forbidden(_))));

        assert!(matches!(all.check(Some(&only_a)), Err(Error::Forbidden(_))));
        assert!(all.check(Some(&both)).is_ok());
    }

    #[test]
    fn missing_principal_is_unauthorized() {
        let policy = Policy::require_scopes(scopes(&["a"]));
        assert!(matches!(policy.check(None), Err(Error::Unauthorized)));
        assert!(matches!(
            AuthContext::anonymous().enforce(&policy),
            Err(Error::Unauthorized)
        ));

        let blank = Principal::user(SubjectId::from_string(String::new()), "");
        assert!(matches!(policy.check(Some(&blank)), Err(Error::Unauthorized)));
    }

    #[test]
    fn roles_audience_and_subject_type() {
        let user = user_with(&[]);
        assert!(Policy::require_roles([RoleKey::new("editor").unwrap()]).check(Some(&user)).is_ok());
        assert!(
            Policy::require_roles([RoleKey::new("admin").unwrap()])
                .check(Some(&user))
                .is_err()
        );
        assert!(Policy::require_audience("api").check(Some(&user)).is_ok());
        assert!(Policy::require_audience("billing").check(Some(&user)).is_err());

        let service = Principal::service(
            SubjectId::new("client-1").unwrap(),
            ClientId::new("svc-a").unwrap(),
        );
        let service_only = Policy::require_subject_type(SubjectType::Service);
        assert!(service_only.check(Some(&service)).is_ok());
        let err = service_only.check(Some(&user)).unwrap_err();
        assert_eq!(err.to_string(), "forbidden: wrong subject type");
    }

    #[test]
    fn combined_policy_reports_first_failure() {
        let policy = Policy::all([
            Policy::require_subject_type(SubjectType::User),
            Policy::require_all_scopes(scopes(&["read:users", "write:users"])),
        ]);
        let ctx = AuthContext::authenticated(user_with(&["read:users"]));

        let err = ctx.enforce(&policy).unwrap_err();
        assert_eq!(err.to_string(), "forbidden: missing required scopes");
    }

    #[test]
    fn empty_any_of_set_fails_closed() {
        let policy = Policy::require_scopes(Vec::new());
        assert!(policy.check(Some(&user_with(&["a"]))).is_err());
    }

    #[test]
    fn bearer_header_parsing() {
        assert_eq!(bearer_token("Bearer abc.def"), Some("abc.def"));
        assert_eq!(bearer_token("bearer  abc"), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("abc"), None);
    }

    #[tokio::test]
    async fn authenticate_builds_context_from_verified_claims() {
        let mut config = TokenConfig::new("access-secret", "refresh-secret");
        config.default_audience = vec!["api".into()];
        let engine = TokenEngineBuilder::new(MemoryCredentialStore::new(), config)
            .clock(ManualClock::new(Utc::now()))
            .build()
            .unwrap();
        let pair = engine.issue_pair(&user_with(&["read:users"])).await.unwrap();

        let ctx = authenticate(&engine, &pair.access_token).await.unwrap();
        assert!(ctx.is_authenticated());
        assert_eq!(ctx.principal().unwrap().id().as_str(), "user-1");
        assert!(
            ctx.enforce(&Policy::require_scopes(scopes(&["read:users"])))
                .is_ok()
        );

        assert!(matches!(
            authenticate(&engine, "garbage").await,
            Err(Error::InvalidToken)
        ));
    }
}
