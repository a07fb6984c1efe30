//! Downlink routing across instances.
//!
//! A gateway holds its connection on exactly one instance. That instance
//! records itself as the station owner in the shared cache; any other
//! instance that needs to reach the gateway publishes on the owner's channel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{keys, CacheStore, CacheStoreExt};
use crate::channel::{
    handler, CrossInstanceChannel, LnsRemoteCall, RemoteCallKind, SubscriptionId,
};
use crate::coordination::AdrOutcome;
use crate::device::{DevAddr, DevEui};
use crate::error::{LnsError, Result};

/// Downlink frame ready to be handed to a gateway connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownlinkMessage {
    pub dev_eui: DevEui,
    pub dev_addr: DevAddr,
    pub gateway_id: String,
    pub fcnt_down: u32,
    /// Acknowledges a confirmed uplink
    pub ack: bool,
    #[serde(default)]
    pub adr: Option<AdrOutcome>,
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// Local end of gateway connections
#[async_trait]
pub trait DownlinkSink: Send + Sync + 'static {
    async fn send(&self, downlink: DownlinkMessage) -> Result<()>;

    /// Drop the connection of a gateway that reconnected elsewhere
    async fn close_connection(&self, gateway_id: &str) -> Result<()>;

    async fn cloud_to_device(&self, json_data: &str) -> Result<()> {
        debug!(bytes = json_data.len(), "Cloud-to-device message ignored by sink");
        Ok(())
    }
}

/// Sink that logs and keeps everything it receives
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<DownlinkMessage>>,
    closed: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<DownlinkMessage> {
        self.sent.lock().await.clone()
    }

    pub async fn closed(&self) -> Vec<String> {
        self.closed.lock().await.clone()
    }
}

#[async_trait]
impl DownlinkSink for RecordingSink {
    async fn send(&self, downlink: DownlinkMessage) -> Result<()> {
        info!(
            dev_eui = %downlink.dev_eui,
            gateway = %downlink.gateway_id,
            fcnt_down = downlink.fcnt_down,
            ack = downlink.ack,
            "Downlink sent"
        );
        self.sent.lock().await.push(downlink);
        Ok(())
    }

    async fn close_connection(&self, gateway_id: &str) -> Result<()> {
        info!(gateway = %gateway_id, "Closing gateway connection");
        self.closed.lock().await.push(gateway_id.to_string());
        Ok(())
    }
}

/// Which instance holds each station connection
#[derive(Clone)]
pub struct StationOwnership {
    store: Arc<dyn CacheStore>,
    instance_id: String,
    ttl: Duration,
}

impl StationOwnership {
    pub fn new(store: Arc<dyn CacheStore>, instance_id: &str, ttl: Duration) -> Self {
        Self {
            store,
            instance_id: instance_id.to_string(),
            ttl,
        }
    }

    /// Record this instance as the owner. Returns the previous owner if it
    /// was another instance, which should then close its stale connection.
    pub async fn claim(&self, gateway_id: &str) -> Result<Option<String>> {
        let key = keys::station_owner(gateway_id);
        let previous: Option<String> = self.store.get_object(&key).await?;
        self.store
            .set_object(&key, &self.instance_id, Some(self.ttl))
            .await?;
        Ok(previous.filter(|owner| *owner != self.instance_id))
    }

    pub async fn owner(&self, gateway_id: &str) -> Result<Option<String>> {
        self.store.get_object(&keys::station_owner(gateway_id)).await
    }

    /// Forget the claim if this instance still holds it
    pub async fn release(&self, gateway_id: &str) -> Result<bool> {
        let key = keys::station_owner(gateway_id);
        let current: Option<String> = self.store.get_object(&key).await?;
        if current.as_deref() == Some(self.instance_id.as_str()) {
            return self.store.key_delete(&key).await;
        }
        Ok(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Local,
    /// Published to the owning instance's channel
    Remote(String),
    /// No instance holds the gateway connection
    Dropped,
}

/// Delivers a downlink locally or forwards it to the owning instance
#[derive(Clone)]
pub struct DownlinkRouter {
    instance_id: String,
    ownership: StationOwnership,
    channel: Arc<dyn CrossInstanceChannel>,
    sink: Arc<dyn DownlinkSink>,
}

impl DownlinkRouter {
    pub fn new(
        instance_id: &str,
        ownership: StationOwnership,
        channel: Arc<dyn CrossInstanceChannel>,
        sink: Arc<dyn DownlinkSink>,
    ) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            ownership,
            channel,
            sink,
        }
    }

    pub fn ownership(&self) -> &StationOwnership {
        &self.ownership
    }

    /// Claim a station connection and ask a previous owner to close its copy
    pub async fn station_connected(&self, gateway_id: &str) -> Result<()> {
        if let Some(previous) = self.ownership.claim(gateway_id).await? {
            info!(gateway = %gateway_id, previous_owner = %previous, "Station moved to this instance");
            let call = LnsRemoteCall::new(
                RemoteCallKind::CloseConnection,
                Some(gateway_id.to_string()),
            );
            self.channel.publish(&previous, &call).await?;
        }
        Ok(())
    }

    pub async fn route(&self, downlink: DownlinkMessage) -> Result<RouteOutcome> {
        match self.ownership.owner(&downlink.gateway_id).await? {
            Some(owner) if owner == self.instance_id => {
                self.sink.send(downlink).await?;
                Ok(RouteOutcome::Local)
            }
            Some(owner) => {
                let call = LnsRemoteCall::with_payload(RemoteCallKind::Downlink, &downlink)?;
                self.channel.publish(&owner, &call).await?;
                debug!(dev_eui = %downlink.dev_eui, owner = %owner, "Downlink forwarded to owning instance");
                Ok(RouteOutcome::Remote(owner))
            }
            None => {
                warn!(dev_eui = %downlink.dev_eui, gateway = %downlink.gateway_id, "No instance owns the gateway, downlink dropped");
                Ok(RouteOutcome::Dropped)
            }
        }
    }
}

/// Serves remote calls addressed to this instance
pub struct RemoteCallListener {
    instance_id: String,
    channel: Arc<dyn CrossInstanceChannel>,
    sink: Arc<dyn DownlinkSink>,
}

impl RemoteCallListener {
    pub fn new(
        instance_id: &str,
        channel: Arc<dyn CrossInstanceChannel>,
        sink: Arc<dyn DownlinkSink>,
    ) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            channel,
            sink,
        }
    }

    /// Subscribe the instance channel. Unsubscribe through the returned id.
    pub async fn start(&self) -> Result<SubscriptionId> {
        let sink = Arc::clone(&self.sink);
        let id = self
            .channel
            .subscribe(
                &self.instance_id,
                handler(move |call| {
                    let sink = Arc::clone(&sink);
                    async move {
                        if let Err(e) = handle_remote_call(sink.as_ref(), call).await {
                            warn!(error = %e, "Failed to handle remote call");
                        }
                    }
                }),
            )
            .await?;
        info!(channel = %self.instance_id, "Listening for remote calls");
        Ok(id)
    }
}

async fn handle_remote_call(sink: &dyn DownlinkSink, call: LnsRemoteCall) -> Result<()> {
    let data = call.json_data.as_deref().unwrap_or_default();
    match call.kind {
        RemoteCallKind::Downlink => {
            let downlink: DownlinkMessage = serde_json::from_str(data)?;
            sink.send(downlink).await
        }
        RemoteCallKind::CloseConnection => {
            if data.is_empty() {
                return Err(LnsError::Channel("close connection without gateway id".to_string()));
            }
            sink.close_connection(data).await
        }
        RemoteCallKind::CloudToDeviceMessage => sink.cloud_to_device(data).await,
    }
}
