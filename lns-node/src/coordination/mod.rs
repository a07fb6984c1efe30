//! Bundled remote coordination.
//!
//! One call per uplink resolves deduplication, downlink frame counter
//! allocation and ADR atomically on the remote side. The client retries
//! transient failures with bounded backoff and classifies every failure
//! before it reaches the dispatcher.

pub mod http;
pub mod local;
pub mod retry;

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::device::{DevAddr, DevEui, DeviceIdentity};
use crate::error::CoordinationError;

pub use http::HttpCoordinationEndpoint;
pub use local::{AdrEngine, LocalCoordinationEndpoint, NoAdr};
pub use retry::RetryPolicy;

/// Per-uplink facts the dispatcher sends along with the device identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UplinkDescriptor {
    pub fcnt_up: u32,
    /// Gateway that delivered this copy of the frame
    pub gateway_id: String,
    /// Gateways that heard the frame as seen by this instance
    pub gateway_count: u32,
    pub adr_enabled: bool,
    /// Last downlink counter known to this instance
    pub fcnt_down: u32,
    /// Ask the endpoint to allocate the next downlink counter
    pub needs_fcnt_down: bool,
    /// ABP device restarted its counters
    pub abp_fcnt_reset: bool,
    pub data_rate: u8,
    pub snr: f32,
}

/// Request body of one bundled call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinationRequest {
    pub dev_eui: DevEui,
    pub dev_addr: DevAddr,
    #[serde(flatten)]
    pub uplink: UplinkDescriptor,
}

impl CoordinationRequest {
    pub fn new(identity: DeviceIdentity, uplink: UplinkDescriptor) -> Self {
        Self {
            dev_eui: identity.dev_eui,
            dev_addr: identity.dev_addr,
            uplink,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupVerdict {
    pub is_duplicate: bool,
    /// Gateway whose copy won, when known
    #[serde(default)]
    pub winning_gateway: Option<String>,
}

/// ADR decision returned to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdrOutcome {
    /// A downlink must be sent to carry the ADR answer
    pub confirm_to_device: bool,
    #[serde(default)]
    pub data_rate: Option<u8>,
    #[serde(default)]
    pub tx_power: Option<u8>,
    #[serde(default)]
    pub nb_rep: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundledCoordinationResult {
    pub dedup: DedupVerdict,
    /// `None` means no downlink counter was allocated
    #[serde(default)]
    pub next_fcnt_down: Option<u32>,
    #[serde(default)]
    pub adr: Option<AdrOutcome>,
    /// Stored counters were reset after an ABP restart
    #[serde(default)]
    pub counters_reset: bool,
}

/// One attempt against the bundled endpoint. Retries live in `CoordinationClient`.
#[async_trait]
pub trait CoordinationEndpoint: Send + Sync + 'static {
    async fn call(
        &self,
        request: &CoordinationRequest,
    ) -> Result<BundledCoordinationResult, CoordinationError>;
}

/// Retrying client around a `CoordinationEndpoint`
#[derive(Clone)]
pub struct CoordinationClient {
    endpoint: Arc<dyn CoordinationEndpoint>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl CoordinationClient {
    pub fn new(
        endpoint: Arc<dyn CoordinationEndpoint>,
        policy: RetryPolicy,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            policy,
            attempt_timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run the bundled call for one uplink.
    ///
    /// Transient failures (network, 5xx, attempt timeout) are retried up to
    /// the policy's ceiling; the terminal error carries the number of
    /// attempts made. Non-transient failures return immediately.
    #[instrument(skip(self, uplink), fields(dev_eui = %identity.dev_eui, fcnt_up = uplink.fcnt_up))]
    pub async fn coordinate(
        &self,
        identity: DeviceIdentity,
        uplink: UplinkDescriptor,
    ) -> Result<BundledCoordinationResult, CoordinationError> {
        let request = CoordinationRequest::new(identity, uplink);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            counter!("coordination_attempts", 1);

            let outcome = match tokio::time::timeout(self.attempt_timeout, self.endpoint.call(&request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(CoordinationError::transient(format!(
                    "attempt timed out after {} ms",
                    self.attempt_timeout.as_millis()
                ))),
            };

            match outcome {
                Ok(result) => {
                    debug!(attempt = attempt, duplicate = result.dedup.is_duplicate, "Coordination succeeded");
                    return Ok(result);
                }
                Err(e) if e.is_transient() && attempt <= self.policy.max_retries() => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        attempt = attempt,
                        max_attempts = self.policy.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient coordination failure, retrying"
                    );
                    counter!("coordination_retries", 1);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(attempt = attempt, error = %e, "Coordination failed");
                    return Err(e.with_attempts(attempt));
                }
            }
        }
    }
}
