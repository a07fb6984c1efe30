use async_nats::{Client, ConnectOptions};
use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::{CrossInstanceChannel, LnsRemoteCall, RemoteCallHandler, SubscriptionId};
use crate::error::{LnsError, Result};

/// Cross-instance channel over NATS core subjects `{prefix}.{channel}`
pub struct NatsChannel {
    client: Client,
    prefix: String,
    next_id: AtomicU64,
    listeners: DashMap<SubscriptionId, JoinHandle<()>>,
}

/// Connect with reconnect backoff capped at ten seconds
pub async fn connect(url: &str) -> Result<Client> {
    info!(nats_url = %url, "Connecting to NATS server");
    let options = ConnectOptions::new()
        .retry_on_initial_connect()
        .reconnect_delay_callback(|attempts| {
            if attempts < 10 {
                Duration::from_millis(200 * attempts as u64)
            } else {
                Duration::from_secs(10)
            }
        });

    let client = async_nats::connect_with_options(url, options)
        .await
        .map_err(|e| LnsError::Channel(format!("failed to connect to NATS: {}", e)))?;
    info!("Connected to NATS server");
    Ok(client)
}

fn subject(prefix: &str, channel: &str) -> String {
    format!("{}.{}", prefix, channel)
}

impl NatsChannel {
    pub fn new(client: Client, prefix: &str) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
            next_id: AtomicU64::new(0),
            listeners: DashMap::new(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl CrossInstanceChannel for NatsChannel {
    async fn subscribe(&self, channel: &str, handler: RemoteCallHandler) -> Result<SubscriptionId> {
        let subject = subject(&self.prefix, channel);
        let mut subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .map_err(|e| LnsError::Channel(format!("failed to subscribe to {}: {}", subject, e)))?;

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let listener = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                match serde_json::from_slice::<LnsRemoteCall>(&message.payload) {
                    Ok(call) => {
                        counter!("remote_calls_received", 1);
                        tokio::spawn(handler(call));
                    }
                    Err(e) => warn!(subject = %message.subject, error = %e, "Failed to parse remote call"),
                }
            }
            debug!("NATS subscription closed");
        });

        self.listeners.insert(id, listener);
        info!(subject = %subject, subscription = %id, "Subscribed to instance channel");
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        if let Some((_, listener)) = self.listeners.remove(&id) {
            // dropping the subscriber inside the task unsubscribes on the server
            listener.abort();
            debug!(subscription = %id, "Unsubscribed from instance channel");
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &LnsRemoteCall) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.client
            .publish(subject(&self.prefix, channel), payload.into())
            .await
            .map_err(|e| LnsError::Channel(format!("failed to publish to {}: {}", channel, e)))?;
        counter!("remote_calls_published", 1);
        debug!(channel = %channel, kind = ?message.kind, "Published remote call");
        Ok(())
    }
}

impl Drop for NatsChannel {
    fn drop(&mut self) {
        for listener in self.listeners.iter() {
            listener.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_layout() {
        assert_eq!(subject("lns", "lns-eu-1"), "lns.lns-eu-1");
    }
}
