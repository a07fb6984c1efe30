use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::{CrossInstanceChannel, LnsRemoteCall, RemoteCallHandler, SubscriptionId};
use crate::error::Result;

/// In-process pub/sub substrate.
///
/// One hub shared through an `Arc` stands in for the broker between
/// simulated instances living in the same process.
#[derive(Default)]
pub struct InProcessChannelHub {
    next_id: AtomicU64,
    channels: DashMap<String, Vec<(SubscriptionId, RemoteCallHandler)>>,
    owners: DashMap<SubscriptionId, String>,
}

impl InProcessChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscriptions on `channel`
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, |subs| subs.len())
    }
}

#[async_trait]
impl CrossInstanceChannel for InProcessChannelHub {
    async fn subscribe(&self, channel: &str, handler: RemoteCallHandler) -> Result<SubscriptionId> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.channels
            .entry(channel.to_string())
            .or_default()
            .push((id, handler));
        self.owners.insert(id, channel.to_string());
        debug!(channel = %channel, subscription = %id, "Subscribed");
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        if let Some((_, channel)) = self.owners.remove(&id) {
            if let Some(mut subs) = self.channels.get_mut(&channel) {
                subs.retain(|(sub, _)| *sub != id);
            }
            self.channels.remove_if(&channel, |_, subs| subs.is_empty());
            debug!(channel = %channel, subscription = %id, "Unsubscribed");
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &LnsRemoteCall) -> Result<()> {
        let handlers: Vec<RemoteCallHandler> = self
            .channels
            .get(channel)
            .map(|subs| subs.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        counter!("remote_calls_published", 1);
        if handlers.is_empty() {
            debug!(channel = %channel, kind = ?message.kind, "No subscribers, message dropped");
            return Ok(());
        }

        for handler in handlers {
            let message = message.clone();
            tokio::spawn(async move {
                counter!("remote_calls_received", 1);
                handler(message).await;
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{handler, RemoteCallKind};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn forwarding(tx: mpsc::UnboundedSender<LnsRemoteCall>) -> RemoteCallHandler {
        handler(move |call| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(call);
            }
        })
    }

    #[tokio::test]
    async fn test_multiple_local_subscribers() {
        let hub = InProcessChannelHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.subscribe("lns-a", forwarding(tx.clone())).await.unwrap();
        hub.subscribe("lns-a", forwarding(tx)).await.unwrap();
        assert_eq!(hub.subscriber_count("lns-a"), 2);

        let call = LnsRemoteCall::new(RemoteCallKind::CloseConnection, None);
        hub.publish("lns-a", &call).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), call);
        assert_eq!(rx.recv().await.unwrap(), call);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let hub = InProcessChannelHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = hub.subscribe("lns-a", forwarding(tx)).await.unwrap();
        hub.unsubscribe(id).await.unwrap();
        hub.unsubscribe(id).await.unwrap();
        assert_eq!(hub.subscriber_count("lns-a"), 0);

        hub.publish("lns-a", &LnsRemoteCall::new(RemoteCallKind::Downlink, None))
            .await
            .unwrap();
        let received = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        // sender dropped with the subscription
        assert!(matches!(received, Ok(None)));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let hub = InProcessChannelHub::new();
        hub.publish("nobody", &LnsRemoteCall::new(RemoteCallKind::Downlink, None))
            .await
            .unwrap();
    }
}
