use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use crate::credential_store::CredentialStore;
use crate::error::{Error, Result, StoreError};

/// Credential store backed by Redis.
///
/// `take` maps to `GETDEL`, so concurrent rotations of one refresh token see
/// the owner at most once.
#[derive(Clone)]
pub struct RedisCredentialStore {
    conn_manager: ConnectionManager,
}

impl fmt::Debug for RedisCredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCredentialStore").finish_non_exhaustive()
    }
}

impl RedisCredentialStore {
    /// Connects to `redis_url` and checks the connection with `PING`.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).map_err(unavailable)?;
        let conn_manager = ConnectionManager::new(client).await.map_err(unavailable)?;

        let mut conn = conn_manager.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(Self { conn_manager })
    }

    /// Wraps an existing connection manager.
    pub fn from_manager(conn_manager: ConnectionManager) -> Self {
        Self { conn_manager }
    }
}

fn unavailable(err: redis::RedisError) -> Error {
    Error::StoreUnavailable(Box::new(err))
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CredentialStore for RedisCredentialStore {
    async fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
        let mut conn = self.conn_manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> std::result::Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        conn.pset_ex::<_, _, ()>(key, value, millis(ttl)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> std::result::Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();
        let removed: usize = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> std::result::Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn take(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
        let mut conn = self.conn_manager.clone();
        let value: Option<String> = conn.get_del(key).await?;
        Ok(value)
    }

    async fn set_add(&self, key: &str, member: &str) -> std::result::Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> std::result::Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        conn.srem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> std::result::Result<Vec<String>, StoreError> {
        let mut conn = self.conn_manager.clone();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> std::result::Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        let ms = i64::try_from(millis(ttl)).unwrap_or(i64::MAX);
        conn.pexpire::<_, ()>(key, ms).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn redis_url() -> String {
        std::env::var("AUTH_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".into())
    }

    #[test]
    fn millis_never_rounds_to_zero() {
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2_000);
    }

    #[tokio::test]
    #[ignore]
    async fn redis_store_operations() {
        let store = RedisCredentialStore::connect(&redis_url()).await.unwrap();
        let key = format!("authcore-test:{}", Uuid::new_v4());
        let set = format!("{key}:set");

        store.set(&key, "owner", Duration::from_secs(30)).await.unwrap();
        assert!(store.exists(&key).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("owner"));
        assert_eq!(store.take(&key).await.unwrap().as_deref(), Some("owner"));
        assert_eq!(store.take(&key).await.unwrap(), None);
        assert!(!store.delete(&key).await.unwrap());

        store.set_add(&set, "j1").await.unwrap();
        store.set_add(&set, "j2").await.unwrap();
        store.set_remove(&set, "j1").await.unwrap();
        store.expire(&set, Duration::from_secs(30)).await.unwrap();
        assert_eq!(store.set_members(&set).await.unwrap(), vec!["j2".to_string()]);
        assert!(store.delete(&set).await.unwrap());
    }
}
