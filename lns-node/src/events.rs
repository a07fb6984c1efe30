use async_nats::Client;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::device::{DevAddr, DevEui};

/// Customer-facing record of one processed uplink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UplinkTelemetry {
    /// Instance that processed the uplink
    pub instance_id: String,
    pub dev_eui: DevEui,
    pub dev_addr: DevAddr,
    pub fcnt_up: u32,
    pub gateway_id: String,
    pub rssi: f32,
    pub snr: f32,
    pub data_rate: u8,
    pub payload_len: usize,
    /// Mark mode primary copy
    #[serde(default)]
    pub marked_primary: bool,
    pub timestamp: DateTime<Utc>,
}

/// Telemetry collaborator. `emit` must not block the uplink path.
pub trait TelemetrySink: Send + Sync + 'static {
    fn emit(&self, event: UplinkTelemetry);
}

/// Logs events at debug level only
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn emit(&self, event: UplinkTelemetry) {
        debug!(
            dev_eui = %event.dev_eui,
            fcnt_up = event.fcnt_up,
            gateway = %event.gateway_id,
            "Uplink telemetry"
        );
    }
}

/// Forwards events into a channel, for embedding and tests
#[derive(Debug, Clone)]
pub struct ChannelTelemetry {
    sender: mpsc::UnboundedSender<UplinkTelemetry>,
}

impl ChannelTelemetry {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UplinkTelemetry>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl TelemetrySink for ChannelTelemetry {
    fn emit(&self, event: UplinkTelemetry) {
        let _ = self.sender.send(event);
    }
}

/// Publishes JSON events to `{prefix}.telemetry.{instance}`
#[derive(Clone)]
pub struct NatsTelemetry {
    client: Client,
    subject: String,
}

impl NatsTelemetry {
    pub fn new(client: Client, prefix: &str, instance_id: &str) -> Self {
        Self {
            client,
            subject: telemetry_subject(prefix, instance_id),
        }
    }
}

fn telemetry_subject(prefix: &str, instance_id: &str) -> String {
    format!("{}.telemetry.{}", prefix, instance_id)
}

impl TelemetrySink for NatsTelemetry {
    fn emit(&self, event: UplinkTelemetry) {
        let client = self.client.clone();
        let subject = self.subject.clone();

        tokio::spawn(async move {
            match serde_json::to_vec(&event) {
                Ok(payload) => {
                    if let Err(e) = client.publish(subject, payload.into()).await {
                        debug!(error = %e, "Failed to publish telemetry event");
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Failed to serialize telemetry event");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> UplinkTelemetry {
        UplinkTelemetry {
            instance_id: "lns-a".to_string(),
            dev_eui: DevEui(1),
            dev_addr: DevAddr(2),
            fcnt_up: 3,
            gateway_id: "gw-1".to_string(),
            rssi: -90.0,
            snr: 5.5,
            data_rate: 4,
            payload_len: 12,
            marked_primary: false,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_channel_telemetry_forwards() {
        let (sink, mut rx) = ChannelTelemetry::new();
        sink.emit(event());
        assert_eq!(rx.recv().await.unwrap().fcnt_up, 3);

        // a closed receiver never blocks or fails the emitter
        drop(rx);
        sink.emit(event());
    }

    #[test]
    fn test_subject_layout() {
        assert_eq!(telemetry_subject("lns", "lns-a"), "lns.telemetry.lns-a");
    }
}
