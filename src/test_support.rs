//! Fault-injecting wrappers shared by unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::credential_store::CredentialStore;
use crate::error::StoreError;

/// Wraps a credential store and fails or stalls calls on demand.
#[derive(Debug, Clone)]
pub(crate) struct FlakyCredentialStore<C> {
    inner: C,
    failing: Arc<AtomicBool>,
    delay_ms: Arc<AtomicU64>,
    failing_writes: Arc<AtomicU64>,
}

impl<C> FlakyCredentialStore<C> {
    pub(crate) fn new(inner: C) -> Self {
        Self {
            inner,
            failing: Arc::new(AtomicBool::new(false)),
            delay_ms: Arc::new(AtomicU64::new(0)),
            failing_writes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn set_failing(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Fails the next `count` calls to `set`; everything else passes through.
    pub(crate) fn fail_next_writes(&self, count: u64) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    async fn gate(&self) -> std::result::Result<(), StoreError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err("connection refused".into());
        }
        Ok(())
    }
}

#[async_trait]
impl<C: CredentialStore> CredentialStore for FlakyCredentialStore<C> {
    async fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
        self.gate().await?;
        self.inner.get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> std::result::Result<(), StoreError> {
        self.gate().await?;
        let write_blocked = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if write_blocked {
            return Err("write rejected".into());
        }
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> std::result::Result<bool, StoreError> {
        self.gate().await?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> std::result::Result<bool, StoreError> {
        self.gate().await?;
        self.inner.exists(key).await
    }

    async fn take(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
        self.gate().await?;
        self.inner.take(key).await
    }

    async fn set_add(&self, key: &str, member: &str) -> std::result::Result<(), StoreError> {
        self.gate().await?;
        self.inner.set_add(key, member).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> std::result::Result<(), StoreError> {
        self.gate().await?;
        self.inner.set_remove(key, member).await
    }

    async fn set_members(&self, key: &str) -> std::result::Result<Vec<String>, StoreError> {
        self.gate().await?;
        self.inner.set_members(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> std::result::Result<(), StoreError> {
        self.gate().await?;
        self.inner.expire(key, ttl).await
    }
}
