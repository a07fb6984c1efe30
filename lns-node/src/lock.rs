//! Named, leased mutual exclusion over the shared cache.
//!
//! Leases auto-expire so a crashed holder never blocks the fleet. Long
//! operations renew through a `LeaseGuard`; if renewal fails the lease may
//! lapse and another instance may proceed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::CacheStore;
use crate::config::LockConfig;
use crate::error::{LnsError, Result};

/// Serializes full rebuilds of the device-address index
pub const FULL_UPDATE_LOCK: &str = "fullUpdateKey";

/// Serializes incremental updates of the device-address index
pub const GLOBAL_UPDATE_LOCK: &str = "globalUpdateKey";

/// Lock manager bound to one instance
#[derive(Clone)]
pub struct DistributedLockManager {
    store: Arc<dyn CacheStore>,
    /// Default holder token of this instance
    instance_token: String,
    config: LockConfig,
}

impl DistributedLockManager {
    pub fn new(store: Arc<dyn CacheStore>, instance_id: &str, config: LockConfig) -> Self {
        Self {
            store,
            instance_token: format!("{}:{}", instance_id, Uuid::new_v4()),
            config,
        }
    }

    pub fn instance_token(&self) -> &str {
        &self.instance_token
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// `true` if the lock was acquired or re-acquired by the same token
    pub async fn acquire(&self, name: &str, token: &str, lease: Duration) -> Result<bool> {
        let acquired = self.store.lock_take(name, token, lease).await?;
        if acquired {
            debug!(lock = %name, token = %token, lease_ms = lease.as_millis() as u64, "Lock acquired");
        } else {
            debug!(lock = %name, "Lock held elsewhere");
        }
        Ok(acquired)
    }

    /// Release the lock. No-op if `token` is not the current holder.
    pub async fn release(&self, name: &str, token: &str) -> Result<()> {
        if !self.store.lock_release(name, token).await? {
            debug!(lock = %name, token = %token, "Release ignored: not the holder or lease expired");
        }
        Ok(())
    }

    /// Extend a held lease
    pub async fn renew(&self, name: &str, token: &str, lease: Duration) -> Result<bool> {
        self.acquire(name, token, lease).await
    }

    /// Renew at half the lease at the latest, never faster than every millisecond
    fn renewal_interval(&self, lease: Duration) -> Duration {
        self.config
            .renew_interval()
            .min(lease / 2)
            .max(Duration::from_millis(1))
    }

    /// Acquire with this instance's token and keep the lease alive in the
    /// background until the guard is released or dropped.
    ///
    /// Returns `LnsError::LockUnavailable` when another holder owns it.
    pub async fn acquire_with_renewal(&self, name: &str, lease: Duration) -> Result<LeaseGuard> {
        let token = self.instance_token.clone();
        if !self.acquire(name, &token, lease).await? {
            return Err(LnsError::LockUnavailable(name.to_string()));
        }

        let cancel = CancellationToken::new();
        let lost = Arc::new(AtomicBool::new(false));
        let renewal = {
            let store = Arc::clone(&self.store);
            let cancel = cancel.clone();
            let lost = Arc::clone(&lost);
            let name = name.to_string();
            let token = token.clone();
            let every = self.renewal_interval(lease);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            match store.lock_take(&name, &token, lease).await {
                                Ok(true) => debug!(lock = %name, "Lease renewed"),
                                Ok(false) => {
                                    warn!(lock = %name, "Lease lost to another holder");
                                    lost.store(true, Ordering::Relaxed);
                                    break;
                                }
                                Err(e) => warn!(lock = %name, error = %e, "Lease renewal failed"),
                            }
                        }
                    }
                }
            })
        };

        info!(lock = %name, "Holding lock with renewal");
        Ok(LeaseGuard {
            manager: self.clone(),
            name: name.to_string(),
            token,
            cancel,
            lost,
            renewal: Some(renewal),
        })
    }
}

/// A held lock whose lease is renewed in the background
pub struct LeaseGuard {
    manager: DistributedLockManager,
    name: String,
    token: String,
    cancel: CancellationToken,
    lost: Arc<AtomicBool>,
    renewal: Option<JoinHandle<()>>,
}

impl LeaseGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The lease was taken over by another holder while we held it
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Relaxed)
    }

    /// Stop renewing and release the lock
    pub async fn release(mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.renewal.take() {
            let _ = handle.await;
        }
        self.manager.release(&self.name, &self.token).await
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        // without an explicit release the lease simply runs out
        self.cancel.cancel();
    }
}
