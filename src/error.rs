use thiserror::Error;

/// Store-layer error type.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad signature, malformed token, wrong leg or expired token.
    #[error("invalid token")]
    InvalidToken,
    /// Access token JTI is blacklisted.
    #[error("token revoked")]
    Revoked,
    /// Refresh JTI is absent: expired, already rotated or revoked.
    #[error("refresh token not found")]
    RefreshNotFound,
    /// Unknown or inactive client, or secret mismatch.
    #[error("invalid client")]
    InvalidClient,
    /// Requested audience does not overlap the client's allowed audience.
    #[error("invalid audience")]
    InvalidAudience,
    /// Timeout or connection failure against an external store.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
    /// Duplicate unique key on an admin create operation.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Admin mutation referenced a record that does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// No authenticated principal is attached to the request.
    #[error("unauthorized")]
    Unauthorized,
    /// The principal does not satisfy a policy predicate.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Internal signing failure.
    #[error("failed to sign token")]
    Sign(#[source] jsonwebtoken::errors::Error),
    /// Client secret could not be hashed.
    #[error("failed to hash secret: {0}")]
    SecretHash(String),
    /// Invalid identifier input.
    #[error("invalid id: {0}")]
    InvalidId(String),
    /// Invalid configuration.
    #[error("invalid config: {0}")]
    Config(String),
}

impl Error {
    /// Returns true for failures of the external stores.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

/// Returned by relational stores when a unique key already exists.
#[derive(Debug, Error)]
#[error("duplicate key {0}")]
pub struct DuplicateKey(pub String);

/// Returned by relational stores when a referenced record does not exist.
#[derive(Debug, Error)]
#[error("missing reference {0}")]
pub struct MissingReference(pub String);

/// Returned when a store call exceeds its time budget.
#[derive(Debug, Error)]
#[error("store call timed out after {0:?}")]
pub struct StoreTimeout(pub std::time::Duration);

impl From<StoreError> for Error {
    fn from(error: StoreError) -> Self {
        let error = match error.downcast::<DuplicateKey>() {
            Ok(duplicate) => return Self::Conflict(duplicate.0),
            Err(other) => other,
        };
        match error.downcast::<MissingReference>() {
            Ok(missing) => Self::NotFound(missing.0),
            Err(other) => Self::StoreUnavailable(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_key_maps_to_conflict() {
        let err = Error::from(Box::new(DuplicateKey("role admin".into())) as StoreError);
        assert!(matches!(err, Error::Conflict(key) if key == "role admin"));
    }

    #[test]
    fn missing_reference_maps_to_not_found() {
        let err = Error::from(Box::new(MissingReference("scope s1".into())) as StoreError);
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn other_store_errors_are_unavailable() {
        let err = Error::from(StoreError::from("connection refused"));
        assert!(err.is_store_unavailable());
    }
}
