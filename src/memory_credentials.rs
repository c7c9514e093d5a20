use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::credential_store::CredentialStore;
use crate::error::StoreError;

/// In-memory credential store with per-key TTL.
///
/// Intended for tests and single-process deployments. Expired entries are
/// dropped lazily on access and pruned on every write. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    inner: Arc<Mutex<StoreState>>,
}

#[derive(Debug, Default)]
struct StoreState {
    entries: HashMap<String, Entry>,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Set(HashSet<String>),
}

impl MemoryCredentialStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live keys.
    pub fn len(&self) -> usize {
        let mut guard = self.inner.lock().expect("poisoned lock");
        Self::prune_expired(&mut guard, Instant::now());
        guard.entries.len()
    }

    /// Returns true when no live keys remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the remaining lifetime of `key`, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut guard = self.inner.lock().expect("poisoned lock");
        Self::live_entry(&mut guard, key, now)?
            .expires_at
            .map(|at| at.saturating_duration_since(now))
    }

    fn is_expired(entry: &Entry, now: Instant) -> bool {
        entry.expires_at.is_some_and(|at| at <= now)
    }

    fn prune_expired(state: &mut StoreState, now: Instant) {
        state
            .entries
            .retain(|_, entry| !Self::is_expired(entry, now));
    }

    fn live_entry<'a>(state: &'a mut StoreState, key: &str, now: Instant) -> Option<&'a mut Entry> {
        if state
            .entries
            .get(key)
            .is_some_and(|entry| Self::is_expired(entry, now))
        {
            state.entries.remove(key);
            return None;
        }
        state.entries.get_mut(key)
    }
}

fn wrong_type(key: &str) -> StoreError {
    format!("wrong value type at key {key}").into()
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        match Self::live_entry(&mut guard, key, Instant::now()) {
            None => Ok(None),
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> std::result::Result<(), StoreError> {
        let now = Instant::now();
        let mut guard = self.inner.lock().expect("poisoned lock");
        Self::prune_expired(&mut guard, now);
        guard.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> std::result::Result<bool, StoreError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        Ok(Self::live_entry(&mut guard, key, Instant::now()).is_some()
            && guard.entries.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> std::result::Result<bool, StoreError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        Ok(Self::live_entry(&mut guard, key, Instant::now()).is_some())
    }

    async fn take(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        if Self::live_entry(&mut guard, key, Instant::now()).is_none() {
            return Ok(None);
        }
        match guard.entries.remove(key) {
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Ok(Some(text)),
            Some(entry) => {
                guard.entries.insert(key.to_string(), entry);
                Err(wrong_type(key))
            }
            None => Ok(None),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> std::result::Result<(), StoreError> {
        let now = Instant::now();
        let mut guard = self.inner.lock().expect("poisoned lock");
        if Self::live_entry(&mut guard, key, now).is_none() {
            guard.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Set(HashSet::new()),
                    expires_at: None,
                },
            );
        }
        match guard.entries.get_mut(key) {
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => {
                members.insert(member.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> std::result::Result<(), StoreError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        let now_empty = match Self::live_entry(&mut guard, key, Instant::now()) {
            None => return Ok(()),
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => {
                members.remove(member);
                members.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
        };
        if now_empty {
            guard.entries.remove(key);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> std::result::Result<Vec<String>, StoreError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        match Self::live_entry(&mut guard, key, Instant::now()) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> std::result::Result<(), StoreError> {
        let now = Instant::now();
        let mut guard = self.inner.lock().expect("poisoned lock");
        if let Some(entry) = Self::live_entry(&mut guard, key, now) {
            entry.expires_at = Some(now + ttl);
        }
        Ok(())
    }
}
