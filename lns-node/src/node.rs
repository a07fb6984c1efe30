//! Wiring of one server instance.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::{self, CacheStore, InMemoryCacheStore};
use crate::channel::{CrossInstanceChannel, InProcessChannelHub, SubscriptionId};
use crate::config::LnsConfig;
use crate::coordination::{
    AdrEngine, CoordinationClient, CoordinationEndpoint, HttpCoordinationEndpoint,
    LocalCoordinationEndpoint, NoAdr, RetryPolicy,
};
use crate::devaddr_cache::DevAddrCache;
use crate::dispatcher::MessageDispatcher;
use crate::downlink::{
    DownlinkRouter, DownlinkSink, RecordingSink, RemoteCallListener, StationOwnership,
};
use crate::error::Result;
use crate::events::{TelemetrySink, TracingTelemetry};
use crate::lock::DistributedLockManager;
use crate::provisioning::{ProvisioningBackend, StaticProvisioning};
use crate::registry::DeviceRegistry;

/// Collaborators of a node. Anything left unset gets a default derived
/// from the configuration.
pub struct LnsNodeBuilder {
    config: LnsConfig,
    store: Option<Arc<dyn CacheStore>>,
    provisioning: Option<Arc<dyn ProvisioningBackend>>,
    endpoint: Option<Arc<dyn CoordinationEndpoint>>,
    adr: Option<Arc<dyn AdrEngine>>,
    retry_policy: Option<RetryPolicy>,
    channel: Option<Arc<dyn CrossInstanceChannel>>,
    sink: Option<Arc<dyn DownlinkSink>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
}

impl LnsNodeBuilder {
    pub fn new(config: LnsConfig) -> Self {
        Self {
            config,
            store: None,
            provisioning: None,
            endpoint: None,
            adr: None,
            retry_policy: None,
            channel: None,
            sink: None,
            telemetry: None,
        }
    }

    /// Shared cache store. Instances of one fleet must share it.
    pub fn store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn provisioning(mut self, provisioning: Arc<dyn ProvisioningBackend>) -> Self {
        self.provisioning = Some(provisioning);
        self
    }

    pub fn coordination_endpoint(mut self, endpoint: Arc<dyn CoordinationEndpoint>) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// ADR engine of the cache-backed coordination endpoint
    pub fn adr_engine(mut self, adr: Arc<dyn AdrEngine>) -> Self {
        self.adr = Some(adr);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Cross-instance channel. Instances of one fleet must share the substrate.
    pub fn channel(mut self, channel: Arc<dyn CrossInstanceChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn downlink_sink(mut self, sink: Arc<dyn DownlinkSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn build(self) -> Result<LnsNode> {
        let config = self.config;
        config.validate()?;
        let instance_id = config.platform.instance_id.clone();

        let store: Arc<dyn CacheStore> = match self.store {
            Some(store) => store,
            None => Arc::new(InMemoryCacheStore::new()),
        };

        let provisioning: Arc<dyn ProvisioningBackend> = match self.provisioning {
            Some(provisioning) => provisioning,
            None => match &config.provisioning.seed_file {
                Some(path) => Arc::new(StaticProvisioning::from_file(
                    path,
                    config.dedup.default_mode,
                )?),
                None => Arc::new(StaticProvisioning::new()),
            },
        };

        let endpoint: Arc<dyn CoordinationEndpoint> = match self.endpoint {
            Some(endpoint) => endpoint,
            None => match &config.coordination.endpoint_url {
                Some(url) => Arc::new(HttpCoordinationEndpoint::new(
                    url,
                    config.coordination.auth_code.clone(),
                    config.coordination.attempt_timeout(),
                )?),
                None => {
                    let adr: Arc<dyn AdrEngine> = match self.adr {
                        Some(adr) => adr,
                        None => Arc::new(NoAdr),
                    };
                    Arc::new(LocalCoordinationEndpoint::new(
                        store.clone(),
                        adr,
                        config.dedup.window(),
                    ))
                }
            },
        };
        let policy = self
            .retry_policy
            .unwrap_or_else(|| RetryPolicy::from_config(&config.coordination.retry));
        let coordination =
            CoordinationClient::new(endpoint, policy, config.coordination.attempt_timeout());

        let channel: Arc<dyn CrossInstanceChannel> = match self.channel {
            Some(channel) => channel,
            None => Arc::new(InProcessChannelHub::new()),
        };
        let sink: Arc<dyn DownlinkSink> = match self.sink {
            Some(sink) => sink,
            None => Arc::new(RecordingSink::new()),
        };
        let telemetry: Arc<dyn TelemetrySink> = match self.telemetry {
            Some(telemetry) => telemetry,
            None => Arc::new(TracingTelemetry),
        };

        let locks = DistributedLockManager::new(store.clone(), &instance_id, config.locks.clone());
        let devaddr_cache = Arc::new(DevAddrCache::new(
            store.clone(),
            locks.clone(),
            config.devaddr_cache.clone(),
        ));
        let registry = Arc::new(DeviceRegistry::new(
            devaddr_cache.clone(),
            provisioning.clone(),
            config.registry.clone(),
        ));

        let ownership = StationOwnership::new(
            store.clone(),
            &instance_id,
            config.dispatcher.station_owner_ttl(),
        );
        let router = DownlinkRouter::new(&instance_id, ownership, channel.clone(), sink.clone());
        let dispatcher = MessageDispatcher::new(
            &instance_id,
            registry.clone(),
            coordination,
            router.clone(),
            telemetry,
            config.dispatcher.pipeline_idle(),
        );
        let listener = RemoteCallListener::new(&instance_id, channel.clone(), sink);

        Ok(LnsNode {
            config,
            store,
            provisioning,
            channel,
            locks,
            devaddr_cache,
            registry,
            router,
            dispatcher,
            listener,
            subscription: None,
            tasks: Vec::new(),
        })
    }
}

/// One network server instance
pub struct LnsNode {
    config: LnsConfig,
    store: Arc<dyn CacheStore>,
    provisioning: Arc<dyn ProvisioningBackend>,
    channel: Arc<dyn CrossInstanceChannel>,
    locks: DistributedLockManager,
    devaddr_cache: Arc<DevAddrCache>,
    registry: Arc<DeviceRegistry>,
    router: DownlinkRouter,
    dispatcher: MessageDispatcher,
    listener: RemoteCallListener,
    subscription: Option<SubscriptionId>,
    tasks: Vec<JoinHandle<()>>,
}

impl LnsNode {
    pub fn builder(config: LnsConfig) -> LnsNodeBuilder {
        LnsNodeBuilder::new(config)
    }

    /// Start background work: idle eviction, device address sync, cache
    /// purging and the remote-call listener on this instance's channel
    pub async fn start(&mut self) -> Result<()> {
        if self.subscription.is_some() {
            return Ok(());
        }
        self.subscription = Some(self.listener.start().await?);
        self.tasks
            .push(Arc::clone(&self.registry).start_eviction_task());
        self.tasks.push(
            Arc::clone(&self.devaddr_cache).start_sync_task(Arc::clone(&self.provisioning)),
        );
        self.tasks.push(cache::start_purge_task(
            Arc::clone(&self.store),
            self.config.cache.purge_interval(),
        ));

        info!(
            instance_id = %self.instance_id(),
            environment = %self.config.platform.environment,
            region = %self.config.platform.region,
            "Network server node started"
        );
        Ok(())
    }

    /// Stop background tasks and leave the instance channel
    pub async fn shutdown(&mut self) -> Result<()> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(id) = self.subscription.take() {
            self.channel.unsubscribe(id).await?;
        }
        info!(instance_id = %self.instance_id(), "Network server node stopped");
        Ok(())
    }

    pub fn instance_id(&self) -> &str {
        &self.config.platform.instance_id
    }

    pub fn config(&self) -> &LnsConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &DownlinkRouter {
        &self.router
    }

    pub fn locks(&self) -> &DistributedLockManager {
        &self.locks
    }

    pub fn devaddr_cache(&self) -> &Arc<DevAddrCache> {
        &self.devaddr_cache
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DevAddr, DevEui, DeviceIdentity, SessionSeed};
    use crate::uplink::{RadioMetadata, UplinkFrame, UplinkOutcome};
    use chrono::Utc;

    fn config(instance: &str) -> LnsConfig {
        let mut config = LnsConfig::default();
        config.platform.instance_id = instance.to_string();
        config
    }

    #[tokio::test]
    async fn test_single_node_processes_uplink() {
        let provisioning = Arc::new(StaticProvisioning::with_seeds(vec![SessionSeed::new(
            DeviceIdentity::new(DevEui(0x10), DevAddr(0x20)),
        )]));
        let mut node = LnsNode::builder(config("lns-solo"))
            .provisioning(provisioning)
            .build()
            .unwrap();
        node.start().await.unwrap();

        let handle = node.dispatcher().dispatch(
            UplinkFrame {
                dev_addr: DevAddr(0x20),
                fcnt_up: 1,
                confirmed: false,
                adr_requested: false,
                payload: vec![0xAB],
            },
            RadioMetadata {
                arrival: Utc::now(),
                frequency_mhz: 868.3,
                data_rate: 5,
                rssi: -70.0,
                snr: 9.0,
                gateway_id: "gw-1".to_string(),
            },
        );
        assert!(handle.wait().await.is_processed());
        assert_eq!(node.registry().len(), 1);

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_device_not_found() {
        let node = LnsNode::builder(config("lns-solo")).build().unwrap();
        let handle = node.dispatcher().dispatch(
            UplinkFrame {
                dev_addr: DevAddr(0x99),
                fcnt_up: 1,
                confirmed: false,
                adr_requested: false,
                payload: Vec::new(),
            },
            RadioMetadata {
                arrival: Utc::now(),
                frequency_mhz: 868.1,
                data_rate: 0,
                rssi: -120.0,
                snr: -10.0,
                gateway_id: "gw-1".to_string(),
            },
        );
        assert_eq!(handle.wait().await, UplinkOutcome::NotFound);
        assert!(node.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_node_purges_expired_entries() {
        let store = Arc::new(InMemoryCacheStore::new());
        let mut config = config("lns-solo");
        config.cache.purge_interval_seconds = 1;
        let mut node = LnsNode::builder(config)
            .store(store.clone())
            .build()
            .unwrap();
        store
            .set("transient", b"v".to_vec(), Some(std::time::Duration::from_millis(500)))
            .await
            .unwrap();

        node.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired().await.unwrap(), 0);

        node.shutdown().await.unwrap();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = config("lns-solo");
        config.coordination.attempt_timeout_ms = 0;
        assert!(LnsNode::builder(config).build().is_err());
    }
}
