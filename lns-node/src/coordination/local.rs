//! Bundled coordination evaluated directly against the shared cache.
//!
//! Every step is a compare-and-swap update keyed by DevEUI, so any number of
//! instances can call it concurrently for the same device.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{
    AdrOutcome, BundledCoordinationResult, CoordinationEndpoint, CoordinationRequest,
    DedupVerdict,
};
use crate::cache::{keys, update_object, CacheStore, CacheStoreExt, Update};
use crate::error::{CoordinationError, LnsError};

/// ADR call contract. The rate/power decision formula lives behind it.
pub trait AdrEngine: Send + Sync + 'static {
    /// Called for unique uplinks of ADR-enabled devices only
    fn evaluate(&self, request: &CoordinationRequest) -> Option<AdrOutcome>;
}

/// Engine that never asks for a change
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAdr;

impl AdrEngine for NoAdr {
    fn evaluate(&self, _request: &CoordinationRequest) -> Option<AdrOutcome> {
        None
    }
}

/// First copy of a frame seen by the fleet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DedupRecord {
    fcnt_up: u32,
    gateway_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct FcntDownRecord {
    fcnt_down: u32,
    /// Uplink counter the value was allocated for
    allocated_for: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Seen {
    First,
    /// First frame after an ABP device restarted its counters
    Reset,
    /// Same frame from the same gateway, e.g. a retried call
    Resubmit,
    Duplicate,
}

pub struct LocalCoordinationEndpoint {
    store: Arc<dyn CacheStore>,
    adr: Arc<dyn AdrEngine>,
    dedup_window: Duration,
}

impl LocalCoordinationEndpoint {
    pub fn new(store: Arc<dyn CacheStore>, adr: Arc<dyn AdrEngine>, dedup_window: Duration) -> Self {
        Self {
            store,
            adr,
            dedup_window,
        }
    }

    async fn check_duplicate(
        &self,
        request: &CoordinationRequest,
    ) -> crate::error::Result<(Seen, Option<String>)> {
        let uplink = &request.uplink;
        let record = DedupRecord {
            fcnt_up: uplink.fcnt_up,
            gateway_id: uplink.gateway_id.clone(),
        };

        update_object(
            self.store.as_ref(),
            &keys::dedup(request.dev_eui),
            Some(self.dedup_window),
            |current: Option<DedupRecord>| match current {
                // the restart is applied by whichever instance records it first
                None if uplink.abp_fcnt_reset => Update::Write(record.clone(), (Seen::Reset, None)),
                Some(seen) if uplink.abp_fcnt_reset && seen.fcnt_up > uplink.fcnt_up => {
                    Update::Write(record.clone(), (Seen::Reset, None))
                }
                None => Update::Write(record.clone(), (Seen::First, None)),
                Some(seen) if uplink.fcnt_up > seen.fcnt_up => {
                    Update::Write(record.clone(), (Seen::First, None))
                }
                Some(seen) if uplink.fcnt_up == seen.fcnt_up && uplink.gateway_id == seen.gateway_id => {
                    Update::Keep((Seen::Resubmit, Some(seen.gateway_id)))
                }
                Some(seen) => Update::Keep((Seen::Duplicate, Some(seen.gateway_id))),
            },
        )
        .await
    }

    async fn allocate_fcnt_down(
        &self,
        request: &CoordinationRequest,
        seen: Seen,
    ) -> crate::error::Result<u32> {
        let uplink = &request.uplink;
        update_object(
            self.store.as_ref(),
            &keys::fcnt_down(request.dev_eui),
            None,
            |current: Option<FcntDownRecord>| {
                if let Some(record) = current {
                    if seen == Seen::Resubmit && record.allocated_for == Some(uplink.fcnt_up) {
                        return Update::Keep(record.fcnt_down);
                    }
                }
                let stored = current.map_or(0, |record| record.fcnt_down);
                let next = stored.max(uplink.fcnt_down).saturating_add(1);
                Update::Write(
                    FcntDownRecord {
                        fcnt_down: next,
                        allocated_for: Some(uplink.fcnt_up),
                    },
                    next,
                )
            },
        )
        .await
    }

    /// Restart the downlink counter. Runs once per device restart, for the
    /// call that won the `Seen::Reset` verdict.
    async fn reset_fcnt_down(&self, request: &CoordinationRequest) -> crate::error::Result<()> {
        self.store
            .set_object(
                &keys::fcnt_down(request.dev_eui),
                &FcntDownRecord {
                    fcnt_down: 0,
                    allocated_for: None,
                },
                None,
            )
            .await
    }
}

fn storage_failure(e: LnsError) -> CoordinationError {
    match e {
        LnsError::Serialization(reason) => CoordinationError::non_transient(None, reason),
        other => CoordinationError::transient(other.to_string()),
    }
}

#[async_trait]
impl CoordinationEndpoint for LocalCoordinationEndpoint {
    async fn call(
        &self,
        request: &CoordinationRequest,
    ) -> Result<BundledCoordinationResult, CoordinationError> {
        let (seen, winner) = self
            .check_duplicate(request)
            .await
            .map_err(storage_failure)?;

        if seen == Seen::Duplicate {
            debug!(dev_eui = %request.dev_eui, fcnt_up = request.uplink.fcnt_up, "Duplicate uplink");
            return Ok(BundledCoordinationResult {
                dedup: DedupVerdict {
                    is_duplicate: true,
                    winning_gateway: winner,
                },
                next_fcnt_down: None,
                adr: None,
                counters_reset: false,
            });
        }

        let counters_reset = seen == Seen::Reset;
        if counters_reset {
            debug!(dev_eui = %request.dev_eui, fcnt_up = request.uplink.fcnt_up, "Counters restarted");
            self.reset_fcnt_down(request).await.map_err(storage_failure)?;
        }

        let adr = if request.uplink.adr_enabled {
            self.adr.evaluate(request)
        } else {
            None
        };
        let must_send = request.uplink.needs_fcnt_down
            || adr.as_ref().map_or(false, |a| a.confirm_to_device);

        let next_fcnt_down = if must_send {
            Some(
                self.allocate_fcnt_down(request, seen)
                    .await
                    .map_err(storage_failure)?,
            )
        } else {
            None
        };

        Ok(BundledCoordinationResult {
            dedup: DedupVerdict {
                is_duplicate: false,
                winning_gateway: Some(winner.unwrap_or_else(|| request.uplink.gateway_id.clone())),
            },
            next_fcnt_down,
            adr,
            counters_reset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheStore;
    use crate::coordination::UplinkDescriptor;
    use crate::device::{DevAddr, DevEui, DeviceIdentity};

    struct AlwaysConfirm;

    impl AdrEngine for AlwaysConfirm {
        fn evaluate(&self, _request: &CoordinationRequest) -> Option<AdrOutcome> {
            Some(AdrOutcome {
                confirm_to_device: true,
                data_rate: Some(5),
                tx_power: Some(2),
                nb_rep: Some(1),
            })
        }
    }

    fn endpoint(store: Arc<InMemoryCacheStore>, adr: Arc<dyn AdrEngine>) -> LocalCoordinationEndpoint {
        LocalCoordinationEndpoint::new(store, adr, Duration::from_secs(60))
    }

    fn request(fcnt_up: u32, gateway: &str, needs_fcnt_down: bool) -> CoordinationRequest {
        CoordinationRequest::new(
            DeviceIdentity::new(DevEui(0xAA), DevAddr(0xBB)),
            UplinkDescriptor {
                fcnt_up,
                gateway_id: gateway.to_string(),
                gateway_count: 1,
                adr_enabled: false,
                fcnt_down: 0,
                needs_fcnt_down,
                abp_fcnt_reset: false,
                data_rate: 5,
                snr: 3.0,
            },
        )
    }

    #[tokio::test]
    async fn test_dedup_rules() {
        let endpoint = endpoint(Arc::new(InMemoryCacheStore::new()), Arc::new(NoAdr));

        let first = endpoint.call(&request(7, "gw-a", false)).await.unwrap();
        assert!(!first.dedup.is_duplicate);

        // same frame through another gateway
        let copy = endpoint.call(&request(7, "gw-b", false)).await.unwrap();
        assert!(copy.dedup.is_duplicate);
        assert_eq!(copy.dedup.winning_gateway.as_deref(), Some("gw-a"));

        // retried call from the winning gateway
        let resubmit = endpoint.call(&request(7, "gw-a", false)).await.unwrap();
        assert!(!resubmit.dedup.is_duplicate);

        // replayed older frame
        assert!(endpoint.call(&request(6, "gw-a", false)).await.unwrap().dedup.is_duplicate);

        assert!(!endpoint.call(&request(8, "gw-b", false)).await.unwrap().dedup.is_duplicate);
    }

    #[tokio::test]
    async fn test_fcnt_down_is_monotonic_and_idempotent() {
        let endpoint = endpoint(Arc::new(InMemoryCacheStore::new()), Arc::new(NoAdr));

        let a = endpoint.call(&request(1, "gw-a", true)).await.unwrap();
        assert_eq!(a.next_fcnt_down, Some(1));
        // retry after an ambiguous failure gets the same value
        let again = endpoint.call(&request(1, "gw-a", true)).await.unwrap();
        assert_eq!(again.next_fcnt_down, Some(1));

        let mut ahead = request(2, "gw-a", true);
        ahead.uplink.fcnt_down = 10;
        assert_eq!(endpoint.call(&ahead).await.unwrap().next_fcnt_down, Some(11));
        assert_eq!(
            endpoint.call(&request(3, "gw-a", true)).await.unwrap().next_fcnt_down,
            Some(12)
        );

        // duplicates never allocate
        let dup = endpoint.call(&request(3, "gw-b", true)).await.unwrap();
        assert_eq!(dup.next_fcnt_down, None);
    }

    #[tokio::test]
    async fn test_abp_reset() {
        let endpoint = endpoint(Arc::new(InMemoryCacheStore::new()), Arc::new(NoAdr));
        endpoint.call(&request(40, "gw-a", true)).await.unwrap();

        let mut reset = request(1, "gw-a", true);
        reset.uplink.abp_fcnt_reset = true;
        let result = endpoint.call(&reset).await.unwrap();
        assert!(result.counters_reset);
        assert!(!result.dedup.is_duplicate);
        assert_eq!(result.next_fcnt_down, Some(1));
    }

    #[tokio::test]
    async fn test_abp_reset_applied_once_across_gateways() {
        let endpoint = endpoint(Arc::new(InMemoryCacheStore::new()), Arc::new(NoAdr));
        endpoint.call(&request(40, "gw-a", true)).await.unwrap();

        let mut first = request(1, "gw-a", true);
        first.uplink.abp_fcnt_reset = true;
        let mut copy = request(1, "gw-b", true);
        copy.uplink.abp_fcnt_reset = true;

        let applied = endpoint.call(&first).await.unwrap();
        assert!(applied.counters_reset);
        assert_eq!(applied.next_fcnt_down, Some(1));

        // a second instance still believing in a restart sees a plain duplicate
        let duplicate = endpoint.call(&copy).await.unwrap();
        assert!(duplicate.dedup.is_duplicate);
        assert!(!duplicate.counters_reset);
        assert_eq!(duplicate.dedup.winning_gateway.as_deref(), Some("gw-a"));
        assert_eq!(duplicate.next_fcnt_down, None);

        // a retried reset call neither resets again nor burns a counter
        let resubmit = endpoint.call(&first).await.unwrap();
        assert!(!resubmit.counters_reset);
        assert_eq!(resubmit.next_fcnt_down, Some(1));

        assert_eq!(endpoint.call(&request(2, "gw-b", true)).await.unwrap().next_fcnt_down, Some(2));
    }

    #[tokio::test]
    async fn test_adr_contract() {
        let endpoint = endpoint(Arc::new(InMemoryCacheStore::new()), Arc::new(AlwaysConfirm));

        // ADR disabled: engine not consulted
        let plain = endpoint.call(&request(1, "gw-a", false)).await.unwrap();
        assert!(plain.adr.is_none());
        assert!(plain.next_fcnt_down.is_none());

        let mut adr = request(2, "gw-a", false);
        adr.uplink.adr_enabled = true;
        let result = endpoint.call(&adr).await.unwrap();
        assert!(result.adr.as_ref().unwrap().confirm_to_device);
        // confirming to the device needs a downlink counter
        assert_eq!(result.next_fcnt_down, Some(1));
    }
}
