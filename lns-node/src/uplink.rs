//! Uplink requests and their completion handles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::coordination::AdrOutcome;
use crate::device::{DevAddr, DevEui};

/// Radio metadata captured by the gateway for one reception
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioMetadata {
    pub arrival: DateTime<Utc>,
    pub frequency_mhz: f64,
    pub data_rate: u8,
    pub rssi: f32,
    pub snr: f32,
    pub gateway_id: String,
}

/// Decoded uplink frame header plus the still-encrypted payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UplinkFrame {
    pub dev_addr: DevAddr,
    pub fcnt_up: u32,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub adr_requested: bool,
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// A processed uplink
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedUplink {
    pub dev_eui: DevEui,
    pub fcnt_up: u32,
    /// Downlink frame counter allocated for this uplink, if any
    pub fcnt_down: Option<u32>,
    /// Mark mode: this reception is a duplicate kept for its side effects
    pub marked_duplicate: bool,
    pub adr: Option<AdrOutcome>,
    /// A downlink was handed to the router
    pub downlink_routed: bool,
}

/// Final state of an uplink
#[derive(Debug, Clone, PartialEq)]
pub enum UplinkOutcome {
    Processed(ProcessedUplink),
    /// Drop mode duplicate; nothing was applied
    DuplicateDropped,
    /// The device address could not be resolved
    NotFound,
    /// Coordination kept failing transiently; nothing was applied
    TransientFailure(String),
    /// Non-transient coordination failure or internal error
    Failed(String),
}

impl UplinkOutcome {
    pub fn is_processed(&self) -> bool {
        matches!(self, UplinkOutcome::Processed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            UplinkOutcome::Processed(p) if p.marked_duplicate => "processed_duplicate",
            UplinkOutcome::Processed(_) => "processed",
            UplinkOutcome::DuplicateDropped => "duplicate_dropped",
            UplinkOutcome::NotFound => "not_found",
            UplinkOutcome::TransientFailure(_) => "transient_failure",
            UplinkOutcome::Failed(_) => "failed",
        }
    }
}

/// One received frame travelling through the dispatcher
#[derive(Debug)]
pub struct UplinkRequest {
    pub frame: UplinkFrame,
    pub radio: RadioMetadata,
    completion: oneshot::Sender<UplinkOutcome>,
}

impl UplinkRequest {
    pub fn new(frame: UplinkFrame, radio: RadioMetadata) -> (Self, UplinkHandle) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                frame,
                radio,
                completion: tx,
            },
            UplinkHandle { receiver: rx },
        )
    }

    pub fn dev_addr(&self) -> DevAddr {
        self.frame.dev_addr
    }

    /// Signal completion. A caller that stopped waiting is not an error.
    pub fn complete(self, outcome: UplinkOutcome) {
        let _ = self.completion.send(outcome);
    }
}

/// Caller side of an uplink. Dropping it cancels the wait, not the work.
#[derive(Debug)]
pub struct UplinkHandle {
    receiver: oneshot::Receiver<UplinkOutcome>,
}

impl UplinkHandle {
    pub async fn wait(self) -> UplinkOutcome {
        self.receiver.await.unwrap_or_else(|_| {
            UplinkOutcome::Failed("uplink dropped before completion".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    fn radio(gateway: &str) -> RadioMetadata {
        RadioMetadata {
            arrival: Utc::now(),
            frequency_mhz: 868.1,
            data_rate: 5,
            rssi: -80.0,
            snr: 7.0,
            gateway_id: gateway.to_string(),
        }
    }

    fn frame() -> UplinkFrame {
        UplinkFrame {
            dev_addr: DevAddr(0x01020304),
            fcnt_up: 1,
            confirmed: false,
            adr_requested: false,
            payload: vec![0x01],
        }
    }

    #[test]
    fn test_handle_pending_until_completed() {
        let (request, handle) = UplinkRequest::new(frame(), radio("gw-1"));
        let mut wait = task::spawn(handle.wait());
        assert_pending!(wait.poll());

        request.complete(UplinkOutcome::NotFound);
        assert!(wait.is_woken());
        assert_ready_eq!(wait.poll(), UplinkOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_dropped_request_fails_handle() {
        let (request, handle) = UplinkRequest::new(frame(), radio("gw-1"));
        drop(request);
        assert!(matches!(handle.wait().await, UplinkOutcome::Failed(_)));
    }

    #[test]
    fn test_completion_after_cancel_is_silent() {
        let (request, handle) = UplinkRequest::new(frame(), radio("gw-1"));
        drop(handle);
        request.complete(UplinkOutcome::DuplicateDropped);
    }
}
