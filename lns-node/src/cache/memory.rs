use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::CacheStore;
use crate::error::Result;

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug, Clone)]
struct LockLease {
    token: String,
    expires_at: Instant,
}

/// In-process implementation of the shared store.
///
/// Share one instance through an `Arc` between simulated server instances.
/// Expiry uses tokio's clock so paused-time tests can jump past leases.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: DashMap<String, StoredValue>,
    locks: DashMap<String, LockLease>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys (locks excluded)
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.value().is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        self.entries.remove_if(key, |_, v| !v.is_live(now));
        Ok(self.entries.get(key).map(|v| v.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.entries
            .insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn key_delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .map_or(false, |(_, v)| v.is_live(now)))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let now = Instant::now();
        let swapped = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = Some(occupied.get())
                    .filter(|v| v.is_live(now))
                    .map(|v| v.value.as_slice());
                if current == expected {
                    occupied.insert(StoredValue::new(new, ttl));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(StoredValue::new(new, ttl));
                    true
                } else {
                    false
                }
            }
        };
        Ok(swapped)
    }

    async fn lock_take(&self, name: &str, token: &str, lease: Duration) -> Result<bool> {
        let now = Instant::now();
        let taken = match self.locks.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                let held = occupied.get();
                if held.token == token || now >= held.expires_at {
                    occupied.insert(LockLease {
                        token: token.to_string(),
                        expires_at: now + lease,
                    });
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LockLease {
                    token: token.to_string(),
                    expires_at: now + lease,
                });
                true
            }
        };
        debug!(lock = %name, token = %token, taken = taken, "Lock take");
        Ok(taken)
    }

    async fn lock_release(&self, name: &str, token: &str) -> Result<bool> {
        let now = Instant::now();
        let released = self
            .locks
            .remove_if(name, |_, held| held.token == token && now < held.expires_at)
            .is_some();
        Ok(released)
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let before = self.entries.len() + self.locks.len();
        self.entries.retain(|_, v| v.is_live(now));
        self.locks.retain(|_, l| now < l.expires_at);
        Ok(before.saturating_sub(self.entries.len() + self.locks.len()))
    }
}
