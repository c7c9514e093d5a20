use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

const MAX_NAME_LEN: usize = 128;

fn validate_simple_name(value: &str, kind: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidId(format!("{kind} must not be empty")));
    }
    if trimmed.len() > MAX_NAME_LEN {
        return Err(Error::InvalidId(format!(
            "{kind} length must be <= {MAX_NAME_LEN}"
        )));
    }
    if !trimmed.chars().all(is_allowed_name_char) {
        return Err(Error::InvalidId(format!(
            "{kind} contains invalid characters"
        )));
    }
    Ok(trimmed.to_string())
}

fn is_allowed_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, ':' | '_' | '-' | '.' | '@')
}

macro_rules! define_id_type {
    ($(#[$doc:meta])* $name:ident, $kind:expr) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a validated identifier.
            pub fn new(value: impl AsRef<str>) -> Result<Self> {
                validate_simple_name(value.as_ref(), $kind).map(Self)
            }

            /// Creates an identifier from a trusted string without validation.
            pub fn from_string(value: String) -> Self {
                Self(value)
            }

            /// Returns the underlying string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(value: &str) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::from_string(value)
            }
        }
    };
}

define_id_type!(
    /// Identifier of a token subject: a user id or a client record id.
    SubjectId,
    "subject id"
);
define_id_type!(
    /// Public client identifier used in client-credential exchanges.
    ClientId,
    "client id"
);
define_id_type!(
    /// Role record identifier.
    RoleId,
    "role id"
);
define_id_type!(
    /// Scope record identifier.
    ScopeId,
    "scope id"
);
define_id_type!(
    /// Unique role key such as `admin`.
    RoleKey,
    "role key"
);
define_id_type!(
    /// Unique scope key such as `read:users`.
    ScopeKey,
    "scope key"
);

/// Kind of authenticated actor.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectType {
    /// Human user.
    #[default]
    User,
    /// Service client.
    Service,
}

impl SubjectType {
    /// Returns the wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Service => "service",
        }
    }
}

impl fmt::Display for SubjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An authenticated actor with its authorization attributes.
///
/// Fields are only settable while building; once handed out a principal is
/// read-only.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Principal {
    subject_type: SubjectType,
    id: SubjectId,
    email: Option<String>,
    roles: Vec<RoleKey>,
    scopes: Vec<ScopeKey>,
    client_id: Option<ClientId>,
    audience: Vec<String>,
}

impl Principal {
    /// Starts a user principal.
    pub fn user(id: SubjectId, email: impl Into<String>) -> Self {
        let email = email.into();
        Self {
            subject_type: SubjectType::User,
            id,
            email: (!email.is_empty()).then_some(email),
            roles: Vec::new(),
            scopes: Vec::new(),
            client_id: None,
            audience: Vec::new(),
        }
    }

    /// Starts a service principal for a client.
    pub fn service(id: SubjectId, client_id: ClientId) -> Self {
        Self {
            subject_type: SubjectType::Service,
            id,
            email: None,
            roles: Vec::new(),
            scopes: Vec::new(),
            client_id: Some(client_id),
            audience: Vec::new(),
        }
    }

    /// Sets the role keys.
    pub fn with_roles(mut self, roles: Vec<RoleKey>) -> Self {
        self.roles = roles;
        self
    }

    /// Sets the scope keys.
    pub fn with_scopes(mut self, scopes: Vec<ScopeKey>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Sets the intended audience.
    pub fn with_audience(mut self, audience: Vec<String>) -> Self {
        self.audience = audience;
        self
    }

    /// Rebuilds a principal from verified claims.
    pub fn from_claims(claims: &TokenClaims) -> Self {
        Self {
            subject_type: claims.subject_type,
            id: claims.subject_id.clone(),
            email: claims.email.clone(),
            roles: claims.roles.clone(),
            scopes: claims.scopes.clone(),
            client_id: claims.client_id.clone(),
            audience: claims.audience.clone(),
        }
    }

    pub fn subject_type(&self) -> SubjectType {
        self.subject_type
    }

    pub fn id(&self) -> &SubjectId {
        &self.id
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn roles(&self) -> &[RoleKey] {
        &self.roles
    }

    pub fn scopes(&self) -> &[ScopeKey] {
        &self.scopes
    }

    pub fn client_id(&self) -> Option<&ClientId> {
        self.client_id.as_ref()
    }

    pub fn audience(&self) -> &[String] {
        &self.audience
    }
}

/// Access and refresh tokens returned to callers.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_exp: DateTime<Utc>,
    pub refresh_exp: DateTime<Utc>,
}

/// Normalized claims extracted from a verified token.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub subject_type: SubjectType,
    pub subject_id: SubjectId,
    pub email: Option<String>,
    pub roles: Vec<RoleKey>,
    pub scopes: Vec<ScopeKey>,
    pub client_id: Option<ClientId>,
    pub audience: Vec<String>,
    pub jti: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub issuer: String,
}

/// Result of token introspection. Inactive tokens carry no claims.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Introspection {
    pub active: bool,
    pub claims: Option<TokenClaims>,
}

impl Introspection {
    pub(crate) fn inactive() -> Self {
        Self {
            active: false,
            claims: None,
        }
    }

    pub(crate) fn active(claims: TokenClaims) -> Self {
        Self {
            active: true,
            claims: Some(claims),
        }
    }
}

/// Role catalog entry.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub key: RoleKey,
    pub desc: String,
}

/// Scope catalog entry.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub id: ScopeId,
    pub key: ScopeKey,
    pub desc: String,
}

/// Registered service client.
#[derive(Clone, Eq, PartialEq)]
pub struct Client {
    pub id: SubjectId,
    pub client_id: ClientId,
    pub secret_hash: String,
    pub name: String,
    pub allowed_scopes: Vec<String>,
    pub allowed_audience: Vec<String>,
    pub active: bool,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("secret_hash", &"<redacted>")
            .field("name", &self.name)
            .field("allowed_scopes", &self.allowed_scopes)
            .field("allowed_audience", &self.allowed_audience)
            .field("active", &self.active)
            .finish()
    }
}

/// Direct, role-independent scope grant. Upserted by `(user_id, scope_id)`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UserScopeGrant {
    pub user_id: SubjectId,
    pub scope_id: ScopeId,
    pub granted_by: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A direct grant that is active at the instant it was queried for.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirectGrant {
    pub scope: ScopeKey,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Resolved roles and scopes of a principal.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Grants {
    pub roles: Vec<RoleKey>,
    pub scopes: Vec<ScopeKey>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_key_accepts_colon_separated_names() {
        let key = ScopeKey::new(" read:users ").expect("scope key");
        assert_eq!(key.as_str(), "read:users");
    }

    #[test]
    fn subject_id_rejects_empty_input() {
        let err = SubjectId::new("   ").expect_err("must reject");
        assert!(err.to_string().contains("subject id"));
    }

    #[test]
    fn role_key_rejects_invalid_chars() {
        let err = RoleKey::new("ad min").expect_err("must reject");
        assert!(err.to_string().contains("role key"));
    }

    #[test]
    fn user_principal_drops_empty_email() {
        let principal = Principal::user(SubjectId::from_string("u1".into()), "");
        assert_eq!(principal.email(), None);
        assert_eq!(principal.subject_type(), SubjectType::User);
        assert!(principal.client_id().is_none());
    }

    #[test]
    fn subject_type_serializes_lowercase() {
        let json = serde_json::to_string(&SubjectType::Service).unwrap();
        assert_eq!(json, "\"service\"");
    }
}
