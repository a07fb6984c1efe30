//! Shared device-address index.
//!
//! `devAddrTable:{DevAddr}` maps a network address to every device that
//! currently uses it. Instances rebuild the index from provisioning
//! periodically; the full and incremental rebuilds are serialized across the
//! fleet by the two well-known distributed locks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{keys, update_object, CacheStore, CacheStoreExt, Update};
use crate::config::DevAddrCacheConfig;
use crate::device::{DevAddr, DevEui, DeviceIdentity, SessionSeed};
use crate::error::{LnsError, Result};
use crate::lock::{DistributedLockManager, FULL_UPDATE_LOCK, GLOBAL_UPDATE_LOCK};
use crate::provisioning::ProvisioningBackend;

/// One device entry under a network address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevAddrCacheInfo {
    pub identity: DeviceIdentity,
    /// Gateway the device was last heard through
    #[serde(default)]
    pub gateway_id: Option<String>,
    pub last_updated: DateTime<Utc>,
    /// Network session key hint, used to pick the right device on collisions
    #[serde(default)]
    pub nwk_s_key: Option<String>,
}

impl DevAddrCacheInfo {
    pub fn from_seed(seed: &SessionSeed) -> Self {
        Self {
            identity: seed.identity,
            gateway_id: seed.preferred_gateway.clone(),
            last_updated: seed.updated_at.unwrap_or_else(Utc::now),
            nwk_s_key: seed.keys.nwk_s_key.clone(),
        }
    }
}

type AddrTable = BTreeMap<DevEui, DevAddrCacheInfo>;

/// What a sync round did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Full rebuild with the number of devices written
    Full(usize),
    /// Incremental update with the number of devices changed
    Delta(usize),
}

pub struct DevAddrCache {
    store: Arc<dyn CacheStore>,
    locks: DistributedLockManager,
    config: DevAddrCacheConfig,
}

impl DevAddrCache {
    pub fn new(
        store: Arc<dyn CacheStore>,
        locks: DistributedLockManager,
        config: DevAddrCacheConfig,
    ) -> Self {
        Self {
            store,
            locks,
            config,
        }
    }

    /// Devices currently registered under `dev_addr`
    pub async fn lookup(&self, dev_addr: DevAddr) -> Result<Vec<DevAddrCacheInfo>> {
        let table: Option<AddrTable> = self
            .store
            .get_object(&keys::dev_addr_table(dev_addr))
            .await?;
        Ok(table.map(|t| t.into_values().collect()).unwrap_or_default())
    }

    pub async fn store_info(&self, info: DevAddrCacheInfo) -> Result<()> {
        let key = keys::dev_addr_table(info.identity.dev_addr);
        update_object(
            self.store.as_ref(),
            &key,
            Some(self.config.entry_ttl()),
            |current: Option<AddrTable>| {
                let mut table = current.unwrap_or_default();
                table.insert(info.identity.dev_eui, info.clone());
                Update::Write(table, ())
            },
        )
        .await
    }

    /// Remove one device from an address entry. Returns whether it was present.
    pub async fn remove(&self, dev_addr: DevAddr, dev_eui: DevEui) -> Result<bool> {
        let key = keys::dev_addr_table(dev_addr);
        let ttl = Some(self.config.entry_ttl());
        update_object(self.store.as_ref(), &key, ttl, |current: Option<AddrTable>| {
            match current {
                Some(mut table) if table.contains_key(&dev_eui) => {
                    table.remove(&dev_eui);
                    Update::Write(table, true)
                }
                _ => Update::Keep(false),
            }
        })
        .await
    }

    pub async fn load_seed(&self, dev_eui: DevEui) -> Result<Option<SessionSeed>> {
        self.store.get_object(&keys::device_seed(dev_eui)).await
    }

    pub async fn store_seed(&self, seed: &SessionSeed) -> Result<()> {
        self.store
            .set_object(
                &keys::device_seed(seed.identity.dev_eui),
                seed,
                Some(self.config.entry_ttl()),
            )
            .await
    }

    /// Run whichever rebuild is due and not already running elsewhere.
    ///
    /// A full rebuild is attempted when the last one is older than the
    /// configured interval; otherwise (or if another instance holds the full
    /// lock) an incremental update. `LnsError::LockUnavailable` means another
    /// instance is doing the work and the caller should try again later.
    pub async fn perform_needed_syncs(
        &self,
        provisioning: &dyn ProvisioningBackend,
    ) -> Result<SyncOutcome> {
        let last_full: Option<DateTime<Utc>> =
            self.store.get_object(keys::LAST_FULL_RELOAD).await?;
        let full_due = match last_full {
            None => true,
            Some(at) => {
                let elapsed = Utc::now().signed_duration_since(at);
                elapsed.to_std().map_or(false, |e| e >= self.config.full_reload_interval())
            }
        };

        if full_due {
            let lease = self.locks.config().full_update_lease();
            match self.locks.acquire_with_renewal(FULL_UPDATE_LOCK, lease).await {
                Ok(guard) => {
                    let result = self.full_reload(provisioning).await;
                    guard.release().await?;
                    return result.map(SyncOutcome::Full);
                }
                Err(LnsError::LockUnavailable(_)) => {
                    debug!("Full reload running elsewhere, trying incremental update");
                }
                Err(e) => return Err(e),
            }
        }

        let lease = self.locks.config().delta_update_lease();
        let guard = self
            .locks
            .acquire_with_renewal(GLOBAL_UPDATE_LOCK, lease)
            .await?;
        let result = self.delta_reload(provisioning, last_full).await;
        guard.release().await?;
        result.map(SyncOutcome::Delta)
    }

    async fn full_reload(&self, provisioning: &dyn ProvisioningBackend) -> Result<usize> {
        let started = Utc::now();
        let seeds = provisioning.list_devices(None).await?;

        let mut tables: BTreeMap<DevAddr, AddrTable> = BTreeMap::new();
        for seed in &seeds {
            tables
                .entry(seed.identity.dev_addr)
                .or_default()
                .insert(seed.identity.dev_eui, DevAddrCacheInfo::from_seed(seed));
        }

        let ttl = Some(self.config.entry_ttl());
        for (dev_addr, table) in &tables {
            self.store
                .set_object(&keys::dev_addr_table(*dev_addr), table, ttl)
                .await?;
        }
        for seed in seeds.iter() {
            self.merge_seed(seed).await?;
        }

        self.store
            .set_object(keys::LAST_FULL_RELOAD, &started, None)
            .await?;
        self.store
            .set_object(keys::LAST_DELTA_UPDATE, &started, None)
            .await?;

        info!(devices = seeds.len(), addresses = tables.len(), "Device address index rebuilt");
        Ok(seeds.len())
    }

    async fn delta_reload(
        &self,
        provisioning: &dyn ProvisioningBackend,
        last_full: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let started = Utc::now();
        let last_delta: Option<DateTime<Utc>> =
            self.store.get_object(keys::LAST_DELTA_UPDATE).await?;
        let since = last_delta.or(last_full);
        let seeds = provisioning.list_devices(since).await?;

        for seed in &seeds {
            if let Some(previous) = self.load_seed(seed.identity.dev_eui).await? {
                let old_addr = previous.identity.dev_addr;
                if old_addr != seed.identity.dev_addr {
                    // device rejoined under a new address
                    self.remove(old_addr, seed.identity.dev_eui).await?;
                }
            }
            self.store_info(DevAddrCacheInfo::from_seed(seed)).await?;
            self.merge_seed(seed).await?;
        }

        self.store
            .set_object(keys::LAST_DELTA_UPDATE, &started, None)
            .await?;

        debug!(changed = seeds.len(), "Device address index updated");
        Ok(seeds.len())
    }

    /// Write a provisioning seed without rolling back counters already
    /// advanced by live sessions.
    pub(crate) async fn merge_seed(&self, fresh: &SessionSeed) -> Result<()> {
        let key = keys::device_seed(fresh.identity.dev_eui);
        let ttl = Some(self.config.entry_ttl());
        update_object(self.store.as_ref(), &key, ttl, |current: Option<SessionSeed>| {
            let mut merged = fresh.clone();
            if let Some(existing) = current {
                if existing.identity == fresh.identity {
                    merged.fcnt_up = merged.fcnt_up.max(existing.fcnt_up);
                    merged.fcnt_down = merged.fcnt_down.max(existing.fcnt_down);
                    if merged.preferred_gateway.is_none() {
                        merged.preferred_gateway = existing.preferred_gateway;
                    }
                }
            }
            Update::Write(merged, ())
        })
        .await
    }

    /// Periodically run `perform_needed_syncs` until the task is aborted
    pub fn start_sync_task(
        self: Arc<Self>,
        provisioning: Arc<dyn ProvisioningBackend>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.sync_interval());
            loop {
                interval.tick().await;
                match self.perform_needed_syncs(provisioning.as_ref()).await {
                    Ok(outcome) => debug!(?outcome, "Device address sync finished"),
                    Err(LnsError::LockUnavailable(lock)) => {
                        debug!(lock = %lock, "Device address sync running elsewhere, retrying next tick")
                    }
                    Err(e) => warn!(error = %e, "Device address sync failed"),
                }
            }
        })
    }
}
