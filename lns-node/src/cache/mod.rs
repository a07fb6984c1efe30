//! Shared distributed cache store.
//!
//! Every instance of the fleet talks to the same store. It is the only
//! cross-instance shared mutable resource besides the cross-instance channel:
//! plain keys with expiry, an atomic compare-and-swap used for object
//! updates, and named leased locks.

pub mod memory;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{LnsError, Result};

pub use memory::InMemoryCacheStore;

/// Maximum compare-and-swap rounds before `update_object` gives up
const MAX_CAS_ROUNDS: usize = 64;

/// Key layout in the shared store
pub mod keys {
    use crate::device::{DevAddr, DevEui};

    pub fn dev_addr_table(dev_addr: DevAddr) -> String {
        format!("devAddrTable:{}", dev_addr)
    }

    pub fn device_seed(dev_eui: DevEui) -> String {
        format!("deviceSeed:{}", dev_eui)
    }

    pub fn dedup(dev_eui: DevEui) -> String {
        format!("{}:dedup", dev_eui)
    }

    pub fn fcnt_down(dev_eui: DevEui) -> String {
        format!("{}:fcntdown", dev_eui)
    }

    pub fn station_owner(gateway_id: &str) -> String {
        format!("stationOwner:{}", gateway_id)
    }

    pub const LAST_FULL_RELOAD: &str = "devAddrTable:lastFullReload";
    pub const LAST_DELTA_UPDATE: &str = "devAddrTable:lastDeltaUpdate";
}

/// Interface to the shared key/value store
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Returns whether a key was removed
    async fn key_delete(&self, key: &str) -> Result<bool>;

    /// Atomically replace the value if it still equals `expected`
    /// (`None` meaning "absent or expired").
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Take or re-take a leased lock. Re-taking with the same token extends the lease.
    async fn lock_take(&self, name: &str, token: &str, lease: Duration) -> Result<bool>;

    /// Release a lock. A wrong token or an expired lease is a no-op returning `false`.
    async fn lock_release(&self, name: &str, token: &str) -> Result<bool>;

    /// Drop expired keys and leases, returning how many went. Stores that
    /// expire entries on their own keep the default.
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Periodically purge expired entries until the task is aborted
pub fn start_purge_task(store: Arc<dyn CacheStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => debug!(purged = purged, "Expired cache entries purged"),
                Err(e) => warn!(error = %e, "Cache purge failed"),
            }
        }
    })
}

/// Typed helpers over any store
#[async_trait]
pub trait CacheStoreExt: CacheStore {
    async fn get_object<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_object<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, bytes, ttl).await
    }
}

impl<S: CacheStore + ?Sized> CacheStoreExt for S {}

/// What an `update_object` closure wants done with the current value
pub enum Update<T, R> {
    /// Store the new value and return `R`
    Write(T, R),
    /// Leave the stored value untouched and return `R`
    Keep(R),
}

/// Read-modify-write an object with compare-and-swap, retrying on contention.
///
/// The closure may run several times and must not have side effects.
pub async fn update_object<S, T, R, F>(
    store: &S,
    key: &str,
    ttl: Option<Duration>,
    mut apply: F,
) -> Result<R>
where
    S: CacheStore + ?Sized,
    T: Serialize + DeserializeOwned,
    F: FnMut(Option<T>) -> Update<T, R>,
{
    for round in 0..MAX_CAS_ROUNDS {
        let current = store.get(key).await?;
        let decoded = match &current {
            Some(bytes) => Some(serde_json::from_slice::<T>(bytes)?),
            None => None,
        };

        match apply(decoded) {
            Update::Keep(result) => return Ok(result),
            Update::Write(value, result) => {
                let bytes = serde_json::to_vec(&value)?;
                if store
                    .compare_and_swap(key, current.as_deref(), bytes, ttl)
                    .await?
                {
                    return Ok(result);
                }
                debug!(key = %key, round = round, "Compare-and-swap lost, retrying");
                tokio::task::yield_now().await;
            }
        }
    }

    Err(LnsError::Cache(format!(
        "update of {} did not converge after {} rounds",
        key, MAX_CAS_ROUNDS
    )))
}
