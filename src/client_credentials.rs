use crate::config::PermissionConfig;
use crate::credential_store::bounded;
use crate::error::{Error, Result};
use crate::secret::{Argon2Verifier, SecretVerifier};
use crate::store::ClientStore;
use crate::types::{ClientId, Principal, ScopeKey};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Authenticates service clients and derives their service principal.
///
/// Unknown clients, inactive clients and wrong secrets all fail with
/// [`Error::InvalidClient`] after the same amount of hashing work.
pub struct ClientCredentialValidator<S, V = Argon2Verifier> {
    store: S,
    verifier: V,
    store_timeout: Duration,
}

impl<S, V> fmt::Debug for ClientCredentialValidator<S, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentialValidator")
            .field("store_timeout", &self.store_timeout)
            .finish_non_exhaustive()
    }
}

impl<S> ClientCredentialValidator<S, Argon2Verifier> {
    /// Creates a validator using argon2 secret hashes.
    pub fn new(store: S) -> Self {
        Self::with_verifier(store, Argon2Verifier::new())
    }
}

impl<S, V> ClientCredentialValidator<S, V> {
    /// Creates a validator with a custom secret verifier.
    pub fn with_verifier(store: S, verifier: V) -> Self {
        Self {
            store,
            verifier,
            store_timeout: PermissionConfig::default().store_timeout(),
        }
    }

    /// Sets the budget for the client lookup.
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }
}

impl<S, V> ClientCredentialValidator<S, V>
where
    S: ClientStore + Send + Sync,
    V: SecretVerifier,
{
    /// Validates a client-credentials request.
    ///
    /// The audience must overlap the client's allowed audience. Granted
    /// scopes are the requested scopes the client is allowed, in request order.
    pub async fn execute(
        &self,
        client_id: &str,
        secret: &str,
        scopes: &[String],
        audience: &[String],
    ) -> Result<Principal> {
        let client = match ClientId::new(client_id) {
            Ok(id) => bounded(self.store_timeout, self.store.find_client(id))
                .await
                .map_err(Error::from)?,
            Err(_) => None,
        };

        let client = match client {
            Some(client) if client.active => client,
            _ => {
                self.verifier.verify_dummy(secret);
                debug!(client_id = client_id.trim(), "rejected unknown or inactive client");
                return Err(Error::InvalidClient);
            }
        };
        if !self.verifier.verify(secret, &client.secret_hash) {
            debug!(client_id = %client.client_id, "rejected client secret");
            return Err(Error::InvalidClient);
        }

        let allowed_audience = trim_all(&client.allowed_audience);
        let granted_audience = intersect(&trim_all(audience), &allowed_audience);
        if granted_audience.is_empty() {
            return Err(Error::InvalidAudience);
        }

        let allowed_scopes = trim_all(&client.allowed_scopes);
        let granted_scopes: Vec<ScopeKey> = intersect(&trim_all(scopes), &allowed_scopes)
            .into_iter()
            .map(ScopeKey::from_string)
            .collect();

        debug!(
            client_id = %client.client_id,
            scopes = granted_scopes.len(),
            "accepted client credentials"
        );
        Ok(Principal::service(client.id, client.client_id)
            .with_scopes(granted_scopes)
            .with_audience(granted_audience))
    }
}

fn trim_all(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

/// Unique members of `requested` that appear in `allowed`, in request order.
fn intersect(requested: &[String], allowed: &[String]) -> Vec<String> {
    let allowed: HashSet<&str> = allowed.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    requested
        .iter()
        .filter(|value| allowed.contains(value.as_str()))
        .filter(|value| seen.insert(value.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::memory_store::MemoryStore;
    use crate::secret::hash_secret;
    use crate::types::{Client, ScopeId, SubjectId, SubjectType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn client(active: bool) -> Client {
        Client {
            id: SubjectId::new("client-record-1").unwrap(),
            client_id: ClientId::new("svc-a").unwrap(),
            secret_hash: hash_secret("s3cret").unwrap(),
            name: "Service A".into(),
            allowed_scopes: strings(&["read:users", "write:users"]),
            allowed_audience: strings(&["service-b"]),
            active,
        }
    }

    fn validator(active: bool) -> ClientCredentialValidator<MemoryStore> {
        let store = MemoryStore::new();
        store.insert_client(client(active));
        ClientCredentialValidator::new(store)
    }

    #[derive(Default)]
    struct CountingVerifier {
        real: AtomicUsize,
        dummy: AtomicUsize,
    }

    impl SecretVerifier for CountingVerifier {
        fn verify(&self, secret: &str, _hash: &str) -> bool {
            self.real.fetch_add(1, Ordering::SeqCst);
            secret == "s3cret"
        }

        fn verify_dummy(&self, _secret: &str) {
            self.dummy.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct DownStore;

    #[async_trait]
    impl ClientStore for DownStore {
        async fn find_client(
            &self,
            _client_id: ClientId,
        ) -> std::result::Result<Option<Client>, StoreError> {
            Err("connection refused".into())
        }

        async fn add_scopes_to_client(
            &self,
            _client_id: ClientId,
            _scopes: Vec<ScopeId>,
        ) -> std::result::Result<(), StoreError> {
            Err("connection refused".into())
        }

        async fn client_scope_keys(
            &self,
            _client_id: ClientId,
        ) -> std::result::Result<Vec<ScopeKey>, StoreError> {
            Err("connection refused".into())
        }
    }

    #[tokio::test]
    async fn granted_scopes_should_be_the_allowed_intersection() {
        let principal = validator(true)
            .execute(
                "svc-a",
                "s3cret",
                &strings(&["read:users", "admin:all", " read:users "]),
                &strings(&["service-b"]),
            )
            .await
            .unwrap();

        assert_eq!(principal.subject_type(), SubjectType::Service);
        assert_eq!(principal.id().as_str(), "client-record-1");
        assert_eq!(principal.client_id().map(ClientId::as_str), Some("svc-a"));
        assert_eq!(principal.email(), None);
        assert_eq!(principal.scopes(), &[ScopeKey::new("read:users").unwrap()]);
        assert_eq!(principal.audience(), &["service-b".to_string()]);
    }

    #[tokio::test]
    async fn foreign_audience_should_be_rejected() {
        let err = validator(true)
            .execute(
                "svc-a",
                "s3cret",
                &strings(&["read:users"]),
                &strings(&["service-x"]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAudience));

        let err = validator(true)
            .execute("svc-a", "s3cret", &[], &strings(&["  "]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAudience));
    }

    #[tokio::test]
    async fn bad_credentials_should_share_one_error() {
        let audience = strings(&["service-b"]);
        let wrong_secret = validator(true)
            .execute("svc-a", "nope", &[], &audience)
            .await
            .unwrap_err();
        let unknown = validator(true)
            .execute("svc-z", "s3cret", &[], &audience)
            .await
            .unwrap_err();
        let inactive = validator(false)
            .execute("svc-a", "s3cret", &[], &audience)
            .await
            .unwrap_err();
        let malformed = validator(true)
            .execute("svc a", "s3cret", &[], &audience)
            .await
            .unwrap_err();

        for err in [wrong_secret, unknown, inactive, malformed] {
            assert!(matches!(err, Error::InvalidClient));
        }
    }

    #[tokio::test]
    async fn unknown_client_should_still_hash() {
        let store = MemoryStore::new();
        store.insert_client(client(true));
        let validator = ClientCredentialValidator::with_verifier(store, CountingVerifier::default());
        let audience = strings(&["service-b"]);

        let _ = validator.execute("svc-z", "s3cret", &[], &audience).await;
        let _ = validator.execute("svc-a", "wrong", &[], &audience).await;

        assert_eq!(validator.verifier.dummy.load(Ordering::SeqCst), 1);
        assert_eq!(validator.verifier.real.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn store_outage_should_not_look_like_bad_credentials() {
        let validator = ClientCredentialValidator::new(DownStore);
        let err = validator
            .execute("svc-a", "s3cret", &[], &strings(&["service-b"]))
            .await
            .unwrap_err();

        assert!(err.is_store_unavailable());
    }

    #[test]
    fn intersect_should_keep_request_order_without_duplicates() {
        let out = intersect(
            &strings(&["b", "a", "b", "c"]),
            &strings(&["a", "b"]),
        );
        assert_eq!(out, strings(&["b", "a"]));
    }
}
