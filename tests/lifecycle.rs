#![cfg(all(feature = "memory-store", feature = "memory-credentials"))]

use chrono::{TimeDelta, Utc};
use rs_authcore::{
    Client, ClientCredentialValidator, Clock, ClientId, CredentialCache, Error, ManualClock,
    MemoryCredentialStore, MemoryStore, PermissionConfig, PermissionResolver, Policy, Principal,
    ResolverBuilder, RoleKey, ScopeKey, SubjectId, SubjectType, TokenConfig, TokenEngine,
    TokenEngineBuilder, authenticate, hash_secret,
};

type Resolver = PermissionResolver<MemoryStore, CredentialCache<MemoryCredentialStore>>;

struct Harness {
    store: MemoryStore,
    resolver: Resolver,
    engine: TokenEngine<MemoryCredentialStore>,
    clock: ManualClock,
}

fn harness() -> Harness {
    let store = MemoryStore::new();
    let credentials = MemoryCredentialStore::new();
    let clock = ManualClock::new(Utc::now());

    let mut config = TokenConfig::new("lifecycle-access-secret", "lifecycle-refresh-secret");
    config.default_audience = vec!["api".to_string()];
    let engine = TokenEngineBuilder::new(credentials.clone(), config)
        .clock(clock.clone())
        .build()
        .unwrap();

    let cache = CredentialCache::new(credentials, &PermissionConfig::default());
    let resolver = ResolverBuilder::new(store.clone())
        .cache(cache)
        .clock(clock.clone())
        .build();

    Harness {
        store,
        resolver,
        engine,
        clock,
    }
}

fn scope_keys(keys: &[&str]) -> Vec<ScopeKey> {
    keys.iter().map(|key| ScopeKey::new(key).unwrap()).collect()
}

async fn seed_admin(resolver: &Resolver, user: &SubjectId) {
    let admin = resolver
        .create_role(RoleKey::new("admin").unwrap(), "Administrators")
        .await
        .unwrap();
    let mut scope_ids = Vec::new();
    for key in ["read:users", "write:users", "admin:all"] {
        let scope = resolver
            .create_scope(ScopeKey::new(key).unwrap(), key)
            .await
            .unwrap();
        scope_ids.push(scope.id);
    }
    resolver
        .add_scopes_to_role(&admin.id, scope_ids)
        .await
        .unwrap();
    resolver
        .add_roles_to_user(user, vec![admin.id])
        .await
        .unwrap();
}

#[tokio::test]
async fn user_session_lifecycle() {
    let h = harness();
    let user = SubjectId::new("user-1").unwrap();
    seed_admin(&h.resolver, &user).await;

    let grants = h
        .resolver
        .list_user_scopes_effective(&user, h.clock.now())
        .await
        .unwrap();
    let principal = Principal::user(user.clone(), "alice@example.com")
        .with_roles(grants.roles)
        .with_scopes(grants.scopes);

    let pair = h.engine.issue_pair(&principal).await.unwrap();
    assert!(pair.access_exp < pair.refresh_exp);

    let ctx = authenticate(&h.engine, &pair.access_token).await.unwrap();
    ctx.enforce(&Policy::all([
        Policy::require_subject_type(SubjectType::User),
        Policy::require_roles([RoleKey::new("admin").unwrap()]),
        Policy::require_all_scopes(scope_keys(&["read:users", "write:users"])),
        Policy::require_audience("api"),
    ]))
    .unwrap();

    let rotated = h.engine.rotate(&pair.refresh_token).await.unwrap();
    let claims = h.engine.verify_access(&rotated.access_token).await.unwrap();
    assert_eq!(claims.subject_id, user);
    assert_eq!(claims.email.as_deref(), Some("alice@example.com"));
    assert!(matches!(
        h.engine.rotate(&pair.refresh_token).await,
        Err(Error::RefreshNotFound)
    ));

    h.engine
        .revoke_pair(&rotated.access_token, &rotated.refresh_token)
        .await
        .unwrap();
    assert!(matches!(
        h.engine.verify_access(&rotated.access_token).await,
        Err(Error::Revoked)
    ));
    assert!(matches!(
        h.engine.rotate(&rotated.refresh_token).await,
        Err(Error::RefreshNotFound)
    ));
    h.engine
        .revoke_pair(&rotated.access_token, &rotated.refresh_token)
        .await
        .unwrap();

    let introspection = h.engine.introspect(&rotated.access_token).await.unwrap();
    assert!(!introspection.active);
    assert!(introspection.claims.is_none());
}

#[tokio::test]
async fn expiring_direct_grant_scenario() {
    let h = harness();
    let user = SubjectId::new("user-1").unwrap();
    seed_admin(&h.resolver, &user).await;
    let report = h
        .resolver
        .create_scope(ScopeKey::new("extra:report").unwrap(), "Reports")
        .await
        .unwrap();
    let now = Utc::now();
    h.resolver
        .grant_user_scope(&user, &report.id, "admin-1", Some(now + TimeDelta::hours(1)))
        .await
        .unwrap();

    let current = h.resolver.list_user_scopes_effective(&user, now).await.unwrap();
    assert_eq!(
        current.scopes,
        scope_keys(&["admin:all", "extra:report", "read:users", "write:users"])
    );

    let later = h
        .resolver
        .list_user_scopes_effective(&user, now + TimeDelta::hours(2))
        .await
        .unwrap();
    assert_eq!(
        later.scopes,
        scope_keys(&["admin:all", "read:users", "write:users"])
    );
}

#[tokio::test]
async fn grant_then_revoke_is_visible_immediately() {
    let h = harness();
    let user = SubjectId::new("user-2").unwrap();
    let report = h
        .resolver
        .create_scope(ScopeKey::new("extra:report").unwrap(), "Reports")
        .await
        .unwrap();
    let now = Utc::now();

    assert!(
        h.resolver
            .list_user_scopes_effective(&user, now)
            .await
            .unwrap()
            .scopes
            .is_empty()
    );
    h.resolver
        .grant_user_scope(&user, &report.id, "admin-1", None)
        .await
        .unwrap();
    assert_eq!(
        h.resolver
            .list_user_scopes_effective(&user, now)
            .await
            .unwrap()
            .scopes,
        scope_keys(&["extra:report"])
    );
    h.resolver.revoke_user_scope(&user, &report.id).await.unwrap();
    assert!(
        h.resolver
            .list_user_scopes_effective(&user, now)
            .await
            .unwrap()
            .scopes
            .is_empty()
    );
}

#[tokio::test]
async fn client_credentials_exchange() {
    let h = harness();
    h.store.insert_client(Client {
        id: SubjectId::new("client-record-1").unwrap(),
        client_id: ClientId::new("svc-a").unwrap(),
        secret_hash: hash_secret("svc-a-secret").unwrap(),
        name: "Service A".to_string(),
        allowed_scopes: vec!["read:users".to_string(), "write:users".to_string()],
        allowed_audience: vec!["service-b".to_string()],
        active: true,
    });
    let validator = ClientCredentialValidator::new(h.store.clone());

    let principal = validator
        .execute(
            "svc-a",
            "svc-a-secret",
            &["read:users".to_string(), "admin:all".to_string()],
            &["service-b".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(principal.scopes(), scope_keys(&["read:users"]).as_slice());
    assert_eq!(principal.audience(), ["service-b".to_string()].as_slice());

    let (token, exp) = h.engine.issue_access_only(&principal).unwrap();
    let claims = h.engine.verify_access(&token).await.unwrap();
    assert_eq!(claims.subject_type, SubjectType::Service);
    assert_eq!(claims.client_id, Some(ClientId::new("svc-a").unwrap()));
    assert_eq!(claims.expires_at, exp);

    let ctx = authenticate(&h.engine, &token).await.unwrap();
    assert!(matches!(
        ctx.enforce(&Policy::require_subject_type(SubjectType::User)),
        Err(Error::Forbidden(_))
    ));

    let err = validator
        .execute(
            "svc-a",
            "svc-a-secret",
            &["read:users".to_string()],
            &["service-x".to_string()],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidAudience));
}

#[tokio::test]
async fn tokens_expire_on_the_injected_clock() {
    let h = harness();
    let principal = Principal::user(SubjectId::new("user-3").unwrap(), "");
    let pair = h.engine.issue_pair(&principal).await.unwrap();

    h.clock.advance(TimeDelta::minutes(15));
    assert!(matches!(
        h.engine.verify_access(&pair.access_token).await,
        Err(Error::InvalidToken)
    ));
    let rotated = h.engine.rotate(&pair.refresh_token).await.unwrap();
    assert!(h.engine.verify_access(&rotated.access_token).await.is_ok());
}

#[tokio::test]
async fn bulk_revoke_for_owner() {
    let h = harness();
    let owner = SubjectId::new("user-4").unwrap();
    let principal = Principal::user(owner.clone(), "");
    let first = h.engine.issue_pair(&principal).await.unwrap();
    let second = h.engine.issue_pair(&principal).await.unwrap();

    assert_eq!(h.engine.revoke_all_for_owner(&owner).await.unwrap(), 2);
    for pair in [first, second] {
        assert!(matches!(
            h.engine.rotate(&pair.refresh_token).await,
            Err(Error::RefreshNotFound)
        ));
    }
}
