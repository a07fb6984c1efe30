//! Uplink dispatcher.
//!
//! Every device address gets its own pipeline: an unbounded queue drained by
//! one worker task. Uplinks of one device are processed in arrival order,
//! one at a time, while different devices run concurrently. Pipelines are
//! created on demand and retired after a quiet period.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::coordination::{CoordinationClient, UplinkDescriptor};
use crate::dedup::{DeduplicationAction, DeduplicationStrategy};
use crate::device::{AdrHistoryEntry, DevAddr};
use crate::downlink::{DownlinkMessage, DownlinkRouter, RouteOutcome};
use crate::error::{CoordinationError, LnsError};
use crate::events::{TelemetrySink, UplinkTelemetry};
use crate::registry::DeviceRegistry;
use crate::uplink::{
    ProcessedUplink, RadioMetadata, UplinkFrame, UplinkHandle, UplinkOutcome, UplinkRequest,
};

struct Pipeline {
    id: u64,
    sender: mpsc::UnboundedSender<UplinkRequest>,
}

struct DispatcherInner {
    instance_id: String,
    registry: Arc<DeviceRegistry>,
    coordination: CoordinationClient,
    router: DownlinkRouter,
    telemetry: Arc<dyn TelemetrySink>,
    pipelines: DashMap<DevAddr, Pipeline>,
    next_pipeline: AtomicU64,
    pipeline_idle: Duration,
}

/// Entry point for uplinks received by this instance
#[derive(Clone)]
pub struct MessageDispatcher {
    inner: Arc<DispatcherInner>,
}

impl MessageDispatcher {
    pub fn new(
        instance_id: &str,
        registry: Arc<DeviceRegistry>,
        coordination: CoordinationClient,
        router: DownlinkRouter,
        telemetry: Arc<dyn TelemetrySink>,
        pipeline_idle: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                instance_id: instance_id.to_string(),
                registry,
                coordination,
                router,
                telemetry,
                pipelines: DashMap::new(),
                next_pipeline: AtomicU64::new(0),
                pipeline_idle,
            }),
        }
    }

    /// Queue an uplink and return immediately.
    ///
    /// The outcome arrives on the request's own handle. Must be called from
    /// within a tokio runtime.
    pub fn dispatch_request(&self, request: UplinkRequest) {
        counter!("uplinks_received", 1);
        let dev_addr = request.dev_addr();

        // sends happen under the entry guard so a retiring worker can check
        // for an empty queue and unregister atomically
        match self.inner.pipelines.entry(dev_addr) {
            Entry::Occupied(mut occupied) => {
                if let Err(mpsc::error::SendError(request)) = occupied.get().sender.send(request) {
                    warn!(dev_addr = %dev_addr, "Pipeline worker gone, restarting");
                    let pipeline = self.spawn_pipeline(dev_addr);
                    Self::enqueue(&pipeline, request);
                    occupied.insert(pipeline);
                }
            }
            Entry::Vacant(vacant) => {
                let pipeline = self.spawn_pipeline(dev_addr);
                Self::enqueue(&pipeline, request);
                vacant.insert(pipeline);
            }
        }
    }

    /// Build a request from its parts, dispatch it and return the handle
    pub fn dispatch(&self, frame: UplinkFrame, radio: RadioMetadata) -> UplinkHandle {
        let (request, handle) = UplinkRequest::new(frame, radio);
        self.dispatch_request(request);
        handle
    }

    /// Number of live per-device pipelines
    pub fn pipeline_count(&self) -> usize {
        self.inner.pipelines.len()
    }

    fn enqueue(pipeline: &Pipeline, request: UplinkRequest) {
        if let Err(mpsc::error::SendError(request)) = pipeline.sender.send(request) {
            request.complete(UplinkOutcome::Failed("pipeline unavailable".to_string()));
        }
    }

    fn spawn_pipeline(&self, dev_addr: DevAddr) -> Pipeline {
        let id = self.inner.next_pipeline.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run_pipeline(dev_addr, id, receiver).await;
        });
        debug!(dev_addr = %dev_addr, pipeline = id, "Pipeline started");
        Pipeline { id, sender }
    }
}

impl DispatcherInner {
    async fn run_pipeline(
        &self,
        dev_addr: DevAddr,
        id: u64,
        mut receiver: mpsc::UnboundedReceiver<UplinkRequest>,
    ) {
        loop {
            match tokio::time::timeout(self.pipeline_idle, receiver.recv()).await {
                Ok(Some(request)) => self.process(request).await,
                Ok(None) => break,
                Err(_) => {
                    let mut pending = None;
                    let retired = self
                        .pipelines
                        .remove_if(&dev_addr, |_, pipeline| {
                            pipeline.id == id
                                && match receiver.try_recv() {
                                    Ok(request) => {
                                        pending = Some(request);
                                        false
                                    }
                                    Err(_) => true,
                                }
                        })
                        .is_some();

                    match pending {
                        Some(request) => self.process(request).await,
                        None => {
                            if retired {
                                debug!(dev_addr = %dev_addr, pipeline = id, "Idle pipeline retired");
                            }
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn process(&self, request: UplinkRequest) {
        let outcome = self.process_uplink(&request.frame, &request.radio).await;
        match &outcome {
            UplinkOutcome::Processed(_) => {
                counter!("uplinks_processed", 1);
            }
            UplinkOutcome::DuplicateDropped => {
                counter!("uplinks_duplicate_dropped", 1);
            }
            UplinkOutcome::NotFound => {
                counter!("uplinks_not_found", 1);
            }
            UplinkOutcome::TransientFailure(_) => {
                counter!("uplinks_transient_failure", 1);
            }
            UplinkOutcome::Failed(_) => {
                counter!("uplinks_failed", 1);
            }
        }
        debug!(dev_addr = %request.frame.dev_addr, outcome = outcome.label(), "Uplink completed");
        request.complete(outcome);
    }

    #[instrument(skip_all, fields(dev_addr = %frame.dev_addr, fcnt_up = frame.fcnt_up, gateway = %radio.gateway_id))]
    async fn process_uplink(&self, frame: &UplinkFrame, radio: &RadioMetadata) -> UplinkOutcome {
        let session = match self.registry.get_or_create(frame.dev_addr).await {
            Ok(session) => session,
            Err(LnsError::NotFound(_)) => {
                debug!("Unknown device address");
                return UplinkOutcome::NotFound;
            }
            Err(e) => return UplinkOutcome::Failed(e.to_string()),
        };

        // held until the uplink is fully applied: one coordination in flight per device
        let mut state = session.begin_coordination().await;

        let abp_reset = session.is_abp()
            && session.abp_relaxed_fcnt()
            && frame.fcnt_up <= 1
            && state.fcnt_up > frame.fcnt_up;
        let gateway_count = match state.adr_history.back() {
            Some(last) if last.fcnt_up == frame.fcnt_up => last.gateway_count + 1,
            _ => 1,
        };

        let descriptor = UplinkDescriptor {
            fcnt_up: frame.fcnt_up,
            gateway_id: radio.gateway_id.clone(),
            gateway_count,
            adr_enabled: state.adr_enabled && frame.adr_requested,
            fcnt_down: if abp_reset { 0 } else { state.fcnt_down },
            needs_fcnt_down: frame.confirmed,
            abp_fcnt_reset: abp_reset,
            data_rate: radio.data_rate,
            snr: radio.snr,
        };

        let result = match self.coordination.coordinate(session.identity(), descriptor).await {
            Ok(result) => result,
            Err(e @ CoordinationError::Transient { .. }) => {
                return UplinkOutcome::TransientFailure(e.to_string())
            }
            Err(e) => return UplinkOutcome::Failed(e.to_string()),
        };

        let action = DeduplicationStrategy::evaluate(session.dedup_mode(), &result.dedup);
        if !action.continues() {
            debug!(winner = ?result.dedup.winning_gateway, "Duplicate uplink dropped");
            return UplinkOutcome::DuplicateDropped;
        }
        let marked_duplicate = action.is_marked_duplicate();

        if result.counters_reset || abp_reset {
            debug!("Frame counters reset after ABP restart");
            state.reset_counters();
        }
        state.fcnt_up = state.fcnt_up.max(frame.fcnt_up);
        if let Some(fcnt_down) = result.next_fcnt_down {
            state.fcnt_down = state.fcnt_down.max(fcnt_down);
        }
        state.record_adr(AdrHistoryEntry {
            fcnt_up: frame.fcnt_up,
            max_snr: radio.snr,
            gateway_count,
        });
        let gateway = result
            .dedup
            .winning_gateway
            .clone()
            .unwrap_or_else(|| radio.gateway_id.clone());
        state.gateway_hint = Some(gateway.clone());
        session.touch();

        let persisted = if result.counters_reset {
            self.registry.persist_reset(&session, &state).await
        } else {
            self.registry.persist(&session, &state).await
        };
        if let Err(e) = persisted {
            warn!(error = %e, "Failed to persist device session");
        }

        let confirm_adr = result.adr.as_ref().map_or(false, |adr| adr.confirm_to_device);
        let mut downlink_routed = false;
        let send_downlink = !marked_duplicate && (frame.confirmed || confirm_adr);
        if let Some(fcnt_down) = result.next_fcnt_down.filter(|_| send_downlink) {
            let downlink = DownlinkMessage {
                dev_eui: session.dev_eui(),
                dev_addr: session.dev_addr(),
                gateway_id: gateway,
                fcnt_down,
                ack: frame.confirmed,
                adr: result.adr.clone(),
                payload: Vec::new(),
            };
            match self.router.route(downlink).await {
                Ok(RouteOutcome::Local) | Ok(RouteOutcome::Remote(_)) => downlink_routed = true,
                Ok(RouteOutcome::Dropped) => {}
                Err(e) => warn!(error = %e, "Failed to route downlink"),
            }
        }
        drop(state);

        if !marked_duplicate {
            self.telemetry.emit(UplinkTelemetry {
                instance_id: self.instance_id.clone(),
                dev_eui: session.dev_eui(),
                dev_addr: session.dev_addr(),
                fcnt_up: frame.fcnt_up,
                gateway_id: radio.gateway_id.clone(),
                rssi: radio.rssi,
                snr: radio.snr,
                data_rate: radio.data_rate,
                payload_len: frame.payload.len(),
                marked_primary: action == DeduplicationAction::MarkPrimary,
                timestamp: radio.arrival,
            });
        }

        UplinkOutcome::Processed(ProcessedUplink {
            dev_eui: session.dev_eui(),
            fcnt_up: frame.fcnt_up,
            fcnt_down: result.next_fcnt_down,
            marked_duplicate,
            adr: result.adr,
            downlink_routed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, InMemoryCacheStore};
    use crate::channel::InProcessChannelHub;
    use crate::config::{DevAddrCacheConfig, LockConfig, RegistryConfig};
    use crate::coordination::{
        BundledCoordinationResult, CoordinationEndpoint, CoordinationRequest,
        LocalCoordinationEndpoint, NoAdr, RetryPolicy,
    };
    use crate::devaddr_cache::DevAddrCache;
    use crate::device::{DevEui, DeviceIdentity, SessionSeed};
    use crate::downlink::{RecordingSink, StationOwnership};
    use crate::events::TracingTelemetry;
    use crate::lock::DistributedLockManager;
    use crate::provisioning::StaticProvisioning;
    use async_trait::async_trait;
    use chrono::Utc;
    use futures::future::join_all;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    /// Accepts every uplink after a short stall, recording call order and overlap
    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<(DevEui, u32)>>,
        in_flight: AtomicU32,
        peak: AtomicU32,
    }

    impl Recording {
        fn order(&self, dev_eui: DevEui) -> Vec<u32> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(eui, _)| *eui == dev_eui)
                .map(|(_, fcnt)| *fcnt)
                .collect()
        }
    }

    #[async_trait]
    impl CoordinationEndpoint for Recording {
        async fn call(
            &self,
            request: &CoordinationRequest,
        ) -> Result<BundledCoordinationResult, CoordinationError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls
                .lock()
                .unwrap()
                .push((request.dev_eui, request.uplink.fcnt_up));
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(BundledCoordinationResult::default())
        }
    }

    struct Harness {
        dispatcher: MessageDispatcher,
        registry: Arc<DeviceRegistry>,
        index: Arc<DevAddrCache>,
    }

    fn harness(
        store: Arc<InMemoryCacheStore>,
        endpoint: Arc<dyn CoordinationEndpoint>,
        seeds: Vec<SessionSeed>,
        pipeline_idle: Duration,
    ) -> Harness {
        let store: Arc<dyn CacheStore> = store;
        let locks = DistributedLockManager::new(store.clone(), "lns-test", LockConfig::default());
        let index = Arc::new(DevAddrCache::new(
            store.clone(),
            locks,
            DevAddrCacheConfig::default(),
        ));
        let registry = Arc::new(DeviceRegistry::new(
            index.clone(),
            Arc::new(StaticProvisioning::with_seeds(seeds)),
            RegistryConfig::default(),
        ));
        let router = DownlinkRouter::new(
            "lns-test",
            StationOwnership::new(store, "lns-test", Duration::from_secs(60)),
            Arc::new(InProcessChannelHub::new()),
            Arc::new(RecordingSink::new()),
        );
        let coordination =
            CoordinationClient::new(endpoint, RetryPolicy::immediate(2), Duration::from_secs(1));
        let dispatcher = MessageDispatcher::new(
            "lns-test",
            registry.clone(),
            coordination,
            router,
            Arc::new(TracingTelemetry),
            pipeline_idle,
        );
        Harness {
            dispatcher,
            registry,
            index,
        }
    }

    fn seed(eui: u64, addr: u32) -> SessionSeed {
        SessionSeed::new(DeviceIdentity::new(DevEui(eui), DevAddr(addr)))
    }

    fn frame(addr: u32, fcnt_up: u32, confirmed: bool) -> UplinkFrame {
        UplinkFrame {
            dev_addr: DevAddr(addr),
            fcnt_up,
            confirmed,
            adr_requested: false,
            payload: vec![0x01],
        }
    }

    fn radio() -> RadioMetadata {
        RadioMetadata {
            arrival: Utc::now(),
            frequency_mhz: 868.1,
            data_rate: 5,
            rssi: -80.0,
            snr: 5.0,
            gateway_id: "gw-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_one_device_in_order_one_at_a_time() {
        let endpoint = Arc::new(Recording::default());
        let h = harness(
            Arc::new(InMemoryCacheStore::new()),
            endpoint.clone(),
            vec![seed(1, 0x10)],
            Duration::from_secs(60),
        );

        let handles: Vec<UplinkHandle> = (1..=5)
            .map(|fcnt| h.dispatcher.dispatch(frame(0x10, fcnt, false), radio()))
            .collect();
        let outcomes = join_all(handles.into_iter().map(|handle| handle.wait())).await;

        assert!(outcomes.iter().all(UplinkOutcome::is_processed));
        assert_eq!(endpoint.order(DevEui(1)), vec![1, 2, 3, 4, 5]);
        assert_eq!(endpoint.peak.load(Ordering::SeqCst), 1);
        assert_eq!(h.dispatcher.pipeline_count(), 1);
    }

    #[tokio::test]
    async fn test_devices_run_concurrently() {
        let endpoint = Arc::new(Recording::default());
        let h = harness(
            Arc::new(InMemoryCacheStore::new()),
            endpoint.clone(),
            vec![seed(1, 0x10), seed(2, 0x20)],
            Duration::from_secs(60),
        );

        let first = h.dispatcher.dispatch(frame(0x10, 1, false), radio());
        let second = h.dispatcher.dispatch(frame(0x20, 1, false), radio());
        assert!(first.wait().await.is_processed());
        assert!(second.wait().await.is_processed());

        assert_eq!(endpoint.peak.load(Ordering::SeqCst), 2);
        assert_eq!(h.dispatcher.pipeline_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_pipeline_retired_and_recreated() {
        let h = harness(
            Arc::new(InMemoryCacheStore::new()),
            Arc::new(Recording::default()),
            vec![seed(1, 0x10)],
            Duration::from_secs(1),
        );

        assert!(h.dispatcher.dispatch(frame(0x10, 1, false), radio()).wait().await.is_processed());
        assert_eq!(h.dispatcher.pipeline_count(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.dispatcher.pipeline_count(), 0);

        assert!(h.dispatcher.dispatch(frame(0x10, 2, false), radio()).wait().await.is_processed());
        assert_eq!(h.dispatcher.pipeline_count(), 1);

        let session = h.registry.get_or_create(DevAddr(0x10)).await.unwrap();
        assert_eq!(session.begin_coordination().await.fcnt_up, 2);
    }

    #[tokio::test]
    async fn test_dropped_handle_still_applies_uplink() {
        let h = harness(
            Arc::new(InMemoryCacheStore::new()),
            Arc::new(Recording::default()),
            vec![seed(1, 0x10)],
            Duration::from_secs(60),
        );

        drop(h.dispatcher.dispatch(frame(0x10, 7, false), radio()));
        // queued behind the dropped one on the same pipeline
        assert!(h.dispatcher.dispatch(frame(0x10, 8, false), radio()).wait().await.is_processed());

        let session = h.registry.get_or_create(DevAddr(0x10)).await.unwrap();
        let state = session.begin_coordination().await;
        let applied: Vec<u32> = state.adr_history.iter().map(|entry| entry.fcnt_up).collect();
        assert_eq!(applied, vec![7, 8]);
        assert_eq!(state.fcnt_up, 8);
    }

    #[tokio::test]
    async fn test_abp_relaxed_restart_resets_counters() {
        let store = Arc::new(InMemoryCacheStore::new());
        let endpoint = Arc::new(LocalCoordinationEndpoint::new(
            store.clone(),
            Arc::new(NoAdr),
            Duration::from_secs(60),
        ));
        let mut device = seed(1, 0x10);
        device.is_abp = true;
        device.abp_relaxed_fcnt = true;
        device.fcnt_up = 50;
        device.fcnt_down = 20;
        let h = harness(store, endpoint, vec![device], Duration::from_secs(60));

        match h.dispatcher.dispatch(frame(0x10, 1, true), radio()).wait().await {
            UplinkOutcome::Processed(processed) => assert_eq!(processed.fcnt_down, Some(1)),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let session = h.registry.get_or_create(DevAddr(0x10)).await.unwrap();
        {
            let state = session.begin_coordination().await;
            assert_eq!(state.fcnt_up, 1);
            assert_eq!(state.fcnt_down, 1);
        }
        let stored = h.index.load_seed(DevEui(1)).await.unwrap().unwrap();
        assert_eq!(stored.fcnt_up, 1);
        assert_eq!(stored.fcnt_down, 1);
    }
}
