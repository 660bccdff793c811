//! In-memory lock store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::store::{LockStore, LockStoreError};

#[derive(Debug, Clone)]
struct Entry {
    token: String,
    expires_at: Instant,
}

/// Single-process lock store with the same conditional semantics as the
/// Redis store. Expiry is enforced lazily: an entry past its deadline is
/// treated as absent by every operation.
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn live_token(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<String> {
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.token.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait::async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_set(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        if Self::live_token(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn holder(&self, key: &str) -> Result<Option<String>, LockStoreError> {
        let mut entries = self.entries.lock().unwrap();
        Ok(Self::live_token(&mut entries, key, Instant::now()))
    }

    async fn release_if_held(&self, key: &str, token: &str) -> Result<bool, LockStoreError> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        match Self::live_token(&mut entries, key, now) {
            Some(current) if current == token => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend_if_held(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockStoreError> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        match Self::live_token(&mut entries, key, now) {
            Some(current) if current == token => {
                if let Some(entry) = entries.get_mut(key) {
                    entry.expires_at = now + ttl;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
