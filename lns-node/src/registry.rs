//! Local device registry.
//!
//! Maps a network address to the live `DeviceSession` of this instance.
//! Construction is serialized per key through a `OnceCell`, so concurrent
//! first accesses share one object while distinct keys resolve in parallel.

use chrono::Utc;
use dashmap::DashMap;
use metrics::gauge;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::RegistryConfig;
use crate::devaddr_cache::{DevAddrCache, DevAddrCacheInfo};
use crate::device::{DevAddr, DeviceSession, SessionSeed, SessionState};
use crate::error::{LnsError, Result};
use crate::provisioning::ProvisioningBackend;

type SessionCell = Arc<OnceCell<Arc<DeviceSession>>>;

pub struct DeviceRegistry {
    sessions: DashMap<DevAddr, SessionCell>,
    index: Arc<DevAddrCache>,
    provisioning: Arc<dyn ProvisioningBackend>,
    config: RegistryConfig,
    constructions: AtomicUsize,
}

impl DeviceRegistry {
    pub fn new(
        index: Arc<DevAddrCache>,
        provisioning: Arc<dyn ProvisioningBackend>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            index,
            provisioning,
            config,
            constructions: AtomicUsize::new(0),
        }
    }

    /// Return the session for `dev_addr`, constructing it on first access.
    ///
    /// Fails with `LnsError::NotFound` when neither the shared cache nor the
    /// provisioning backend knows the address. A failed construction leaves
    /// no entry behind, so the next call resolves afresh.
    #[instrument(skip(self), fields(dev_addr = %dev_addr))]
    pub async fn get_or_create(&self, dev_addr: DevAddr) -> Result<Arc<DeviceSession>> {
        let cell = self
            .sessions
            .entry(dev_addr)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        match cell.get_or_try_init(|| self.construct(dev_addr)).await {
            Ok(session) => Ok(Arc::clone(session)),
            Err(e) => {
                self.sessions
                    .remove_if(&dev_addr, |_, c| Arc::ptr_eq(c, &cell) && !c.initialized());
                Err(e)
            }
        }
    }

    /// Resolve through the shared index first, then provisioning
    async fn construct(&self, dev_addr: DevAddr) -> Result<Arc<DeviceSession>> {
        let seed = match self.seed_from_index(dev_addr).await {
            Ok(Some(seed)) => seed,
            Ok(None) => self.seed_from_provisioning(dev_addr).await?,
            Err(e) => {
                warn!(dev_addr = %dev_addr, error = %e, "Shared cache lookup failed, asking provisioning");
                self.seed_from_provisioning(dev_addr).await?
            }
        };

        self.constructions.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(DeviceSession::from_seed(seed));
        info!(
            dev_eui = %session.dev_eui(),
            dev_addr = %dev_addr,
            mode = ?session.dedup_mode(),
            "Device session created"
        );
        gauge!("registry_sessions", self.sessions.len() as f64);
        Ok(session)
    }

    async fn seed_from_index(&self, dev_addr: DevAddr) -> Result<Option<SessionSeed>> {
        let candidate = self
            .index
            .lookup(dev_addr)
            .await?
            .into_iter()
            .max_by_key(|info| info.last_updated);

        let Some(info) = candidate else {
            return Ok(None);
        };
        let seed = self
            .index
            .load_seed(info.identity.dev_eui)
            .await?
            .filter(|seed| seed.identity == info.identity);
        debug!(dev_addr = %dev_addr, hydrated = seed.is_some(), "Shared index hit");
        Ok(seed)
    }

    async fn seed_from_provisioning(&self, dev_addr: DevAddr) -> Result<SessionSeed> {
        let identity = self
            .provisioning
            .resolve(dev_addr)
            .await?
            .ok_or_else(|| LnsError::NotFound(dev_addr.to_string()))?;

        let seed = self
            .provisioning
            .load_seed(&identity)
            .await?
            .unwrap_or_else(|| SessionSeed::new(identity));

        // write-back so other instances hydrate from the shared cache
        if let Err(e) = self.write_back(&seed).await {
            warn!(dev_eui = %identity.dev_eui, error = %e, "Failed to write device seed back to shared cache");
        }
        Ok(seed)
    }

    async fn write_back(&self, seed: &SessionSeed) -> Result<()> {
        self.index
            .store_info(DevAddrCacheInfo::from_seed(seed))
            .await?;
        self.index.store_seed(seed).await
    }

    /// Drop the local entry, e.g. after a rejoin moved the device to another address
    pub fn invalidate(&self, dev_addr: DevAddr) -> Option<Arc<DeviceSession>> {
        let removed = self
            .sessions
            .remove(&dev_addr)
            .and_then(|(_, cell)| cell.get().cloned());
        if let Some(session) = &removed {
            debug!(dev_eui = %session.dev_eui(), dev_addr = %dev_addr, "Device session invalidated");
        }
        removed
    }

    /// Write the session state back to the shared cache.
    ///
    /// Counters are merged with the stored seed, never lowered: an instance
    /// holding an older view of the device cannot roll back what another
    /// instance already applied.
    pub async fn persist(&self, session: &DeviceSession, state: &SessionState) -> Result<()> {
        let seed = session.snapshot(state);
        self.index
            .store_info(DevAddrCacheInfo::from_seed(&seed))
            .await?;
        self.index.merge_seed(&seed).await
    }

    /// Overwrite the stored seed after the fleet restarted the device counters
    pub async fn persist_reset(&self, session: &DeviceSession, state: &SessionState) -> Result<()> {
        self.write_back(&session.snapshot(state)).await
    }

    /// Remove sessions idle for longer than the eviction window. The shared cache is untouched.
    pub fn evict_idle(&self) -> usize {
        let now_ms = Utc::now().timestamp_millis();
        let window_ms = self.config.idle_eviction().as_millis() as i64;
        let before = self.sessions.len();

        self.sessions.retain(|_, cell| match cell.get() {
            Some(session) => session.idle_ms(now_ms) < window_ms,
            // construction in flight
            None => true,
        });

        let evicted = before.saturating_sub(self.sessions.len());
        if evicted > 0 {
            info!(evicted = evicted, remaining = self.sessions.len(), "Evicted idle device sessions");
            gauge!("registry_sessions", self.sessions.len() as f64);
        }
        evicted
    }

    pub fn start_eviction_task(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.eviction_interval());
            loop {
                interval.tick().await;
                self.evict_idle();
            }
        })
    }

    /// Number of constructed sessions
    pub fn len(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sessions constructed since startup, evicted ones included
    pub fn construction_count(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }
}
