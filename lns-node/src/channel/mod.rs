//! Cross-instance publish/subscribe.
//!
//! Channel names are server instance identities. Delivery is at most once
//! per subscriber and best effort: nothing is persisted, a publish with no
//! live subscriber is dropped, and there is no ordering across channels.
//! Handlers run on spawned tasks, never on the publisher's task.

pub mod local;
pub mod nats;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::error::Result;

pub use local::InProcessChannelHub;
pub use nats::NatsChannel;

/// Kind of call carried across instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteCallKind {
    CloudToDeviceMessage,
    CloseConnection,
    Downlink,
}

/// Message published on an instance channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LnsRemoteCall {
    pub kind: RemoteCallKind,
    #[serde(default)]
    pub json_data: Option<String>,
}

impl LnsRemoteCall {
    pub fn new(kind: RemoteCallKind, json_data: Option<String>) -> Self {
        Self { kind, json_data }
    }

    /// Build a call whose payload is `data` serialized as JSON
    pub fn with_payload<T: Serialize>(kind: RemoteCallKind, data: &T) -> Result<Self> {
        Ok(Self {
            kind,
            json_data: Some(serde_json::to_string(data)?),
        })
    }
}

pub type RemoteCallHandler = Arc<dyn Fn(LnsRemoteCall) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a handler
pub fn handler<F, Fut>(f: F) -> RemoteCallHandler
where
    F: Fn(LnsRemoteCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |call: LnsRemoteCall| -> BoxFuture<'static, ()> { Box::pin(f(call)) })
}

/// Identifies one subscription for `unsubscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[async_trait]
pub trait CrossInstanceChannel: Send + Sync + 'static {
    /// Register `handler` for every message later published on `channel`
    async fn subscribe(&self, channel: &str, handler: RemoteCallHandler) -> Result<SubscriptionId>;

    /// Stop delivering to a subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;

    /// Fire-and-forget delivery to the current subscribers of `channel`
    async fn publish(&self, channel: &str, message: &LnsRemoteCall) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_call_wire_format() {
        let call = LnsRemoteCall::with_payload(RemoteCallKind::Downlink, &vec![1u8, 2]).unwrap();
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["kind"], "Downlink");
        assert_eq!(json["jsonData"], "[1,2]");

        let bare: LnsRemoteCall = serde_json::from_str(r#"{"kind":"CloseConnection"}"#).unwrap();
        assert_eq!(bare, LnsRemoteCall::new(RemoteCallKind::CloseConnection, None));
    }
}
