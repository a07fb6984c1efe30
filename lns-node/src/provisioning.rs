//! Device provisioning backend.
//!
//! The registry only falls back to this collaborator when the shared cache
//! has neither an index entry nor a seed for a device address.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

use crate::device::{DeduplicationMode, DevAddr, DevEui, DeviceIdentity, SessionSeed};
use crate::error::{LnsError, Result};

#[async_trait]
pub trait ProvisioningBackend: Send + Sync + 'static {
    /// Resolve a network address to the device currently holding it
    async fn resolve(&self, dev_addr: DevAddr) -> Result<Option<DeviceIdentity>>;

    /// Load the bootstrap record of a resolved device
    async fn load_seed(&self, identity: &DeviceIdentity) -> Result<Option<SessionSeed>>;

    /// Devices changed since `since`, or every device when `None`
    async fn list_devices(&self, since: Option<DateTime<Utc>>) -> Result<Vec<SessionSeed>>;
}

/// In-memory provisioning backend, optionally loaded from a JSON seed file
#[derive(Debug, Default)]
pub struct StaticProvisioning {
    devices: DashMap<DevEui, SessionSeed>,
    resolve_calls: AtomicUsize,
}

impl StaticProvisioning {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seeds(seeds: impl IntoIterator<Item = SessionSeed>) -> Self {
        let provisioning = Self::new();
        for seed in seeds {
            provisioning.upsert(seed);
        }
        provisioning
    }

    /// Load a JSON array of seeds. Entries without a `dedup_mode` get `default_mode`.
    pub fn from_file(path: impl AsRef<Path>, default_mode: DeduplicationMode) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let invalid =
            |e: serde_json::Error| LnsError::Provisioning(format!("invalid seed file {}: {}", path.display(), e));

        let entries: Vec<serde_json::Value> = serde_json::from_str(&content).map_err(invalid)?;
        let default_mode = serde_json::to_value(default_mode)?;
        let mut seeds = Vec::with_capacity(entries.len());
        for mut entry in entries {
            if let Some(object) = entry.as_object_mut() {
                object
                    .entry("dedup_mode")
                    .or_insert_with(|| default_mode.clone());
            }
            seeds.push(serde_json::from_value::<SessionSeed>(entry).map_err(invalid)?);
        }

        info!(path = %path.display(), devices = seeds.len(), "Loaded provisioning seeds");
        Ok(Self::with_seeds(seeds))
    }

    /// Add or replace a device. Stamps the update time so delta listings see it.
    pub fn upsert(&self, mut seed: SessionSeed) {
        if seed.updated_at.is_none() {
            seed.updated_at = Some(Utc::now());
        }
        self.devices.insert(seed.identity.dev_eui, seed);
    }

    pub fn remove(&self, dev_eui: DevEui) -> Option<SessionSeed> {
        self.devices.remove(&dev_eui).map(|(_, seed)| seed)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Number of `resolve` calls served so far
    pub fn resolve_count(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProvisioningBackend for StaticProvisioning {
    async fn resolve(&self, dev_addr: DevAddr) -> Result<Option<DeviceIdentity>> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        // on an address collision the most recently updated device wins
        let identity = self
            .devices
            .iter()
            .filter(|entry| entry.identity.dev_addr == dev_addr)
            .max_by_key(|entry| entry.updated_at)
            .map(|entry| entry.identity);
        debug!(dev_addr = %dev_addr, found = identity.is_some(), "Provisioning lookup");
        Ok(identity)
    }

    async fn load_seed(&self, identity: &DeviceIdentity) -> Result<Option<SessionSeed>> {
        Ok(self
            .devices
            .get(&identity.dev_eui)
            .filter(|seed| seed.identity.dev_addr == identity.dev_addr)
            .map(|seed| seed.value().clone()))
    }

    async fn list_devices(&self, since: Option<DateTime<Utc>>) -> Result<Vec<SessionSeed>> {
        Ok(self
            .devices
            .iter()
            .filter(|entry| match (since, entry.updated_at) {
                (None, _) => true,
                (Some(since), Some(updated)) => updated > since,
                (Some(_), None) => false,
            })
            .map(|entry| entry.value().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn seed(eui: u64, addr: u32) -> SessionSeed {
        SessionSeed::new(DeviceIdentity::new(DevEui(eui), DevAddr(addr)))
    }

    #[tokio::test]
    async fn test_resolve_and_load() {
        let provisioning = StaticProvisioning::with_seeds(vec![seed(1, 0x10), seed(2, 0x20)]);
        let identity = provisioning.resolve(DevAddr(0x20)).await.unwrap().unwrap();
        assert_eq!(identity.dev_eui, DevEui(2));
        assert!(provisioning.resolve(DevAddr(0x30)).await.unwrap().is_none());
        assert_eq!(provisioning.resolve_count(), 2);

        let loaded = provisioning.load_seed(&identity).await.unwrap().unwrap();
        assert_eq!(loaded.identity, identity);

        // stale address
        let stale = DeviceIdentity::new(DevEui(2), DevAddr(0x99));
        assert!(provisioning.load_seed(&stale).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_devices_since() {
        let provisioning = StaticProvisioning::new();
        let mut old = seed(1, 0x10);
        old.updated_at = Some(Utc::now() - chrono::Duration::hours(2));
        provisioning.upsert(old);
        let cutoff = Utc::now() - chrono::Duration::hours(1);
        provisioning.upsert(seed(2, 0x20));

        assert_eq!(provisioning.list_devices(None).await.unwrap().len(), 2);
        let changed = provisioning.list_devices(Some(cutoff)).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].identity.dev_eui, DevEui(2));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"identity": {{"dev_eui": "0004A30B001C0530", "dev_addr": "26011B01"}}, "dedup_mode": "Drop", "fcnt_up": 4}}]"#
        )
        .unwrap();

        let provisioning =
            StaticProvisioning::from_file(file.path(), DeduplicationMode::Mark).unwrap();
        assert_eq!(provisioning.len(), 1);
        let seeds = futures::executor::block_on(provisioning.list_devices(None)).unwrap();
        assert_eq!(seeds[0].dedup_mode, DeduplicationMode::Drop);
        assert_eq!(seeds[0].fcnt_up, 4);

        let mut implicit = tempfile::NamedTempFile::new().unwrap();
        write!(
            implicit,
            r#"[{{"identity": {{"dev_eui": "0004A30B001C0531", "dev_addr": "26011B02"}}}}]"#
        )
        .unwrap();
        let provisioning =
            StaticProvisioning::from_file(implicit.path(), DeduplicationMode::Mark).unwrap();
        let seeds = futures::executor::block_on(provisioning.list_devices(None)).unwrap();
        assert_eq!(seeds[0].dedup_mode, DeduplicationMode::Mark);

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        write!(broken, "not json").unwrap();
        assert!(matches!(
            StaticProvisioning::from_file(broken.path(), DeduplicationMode::None),
            Err(LnsError::Provisioning(_))
        ));
    }
}
