//! Device identity and the per-device session aggregate.
//!
//! A `DeviceSession` separates the read-mostly part (identity, keys,
//! deduplication mode) from the hot part (counters, ADR history, gateway
//! hint). The hot part sits behind an async mutex whose guard doubles as the
//! "one coordination in flight" token for the device.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::LnsError;

/// Number of uplinks kept in the ADR history
pub const ADR_HISTORY_LEN: usize = 20;

/// Globally unique device identifier (DevEUI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevEui(pub u64);

/// Reassignable network address (DevAddr)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevAddr(pub u32);

impl fmt::Display for DevEui {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl FromStr for DevEui {
    type Err = LnsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 {
            return Err(LnsError::Other(format!("invalid DevEUI length: {}", s)));
        }
        u64::from_str_radix(s, 16)
            .map(DevEui)
            .map_err(|e| LnsError::Other(format!("invalid DevEUI {}: {}", s, e)))
    }
}

impl FromStr for DevAddr {
    type Err = LnsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 8 {
            return Err(LnsError::Other(format!("invalid DevAddr length: {}", s)));
        }
        u32::from_str_radix(s, 16)
            .map(DevAddr)
            .map_err(|e| LnsError::Other(format!("invalid DevAddr {}: {}", s, e)))
    }
}

macro_rules! hex_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_serde!(DevEui);
hex_serde!(DevAddr);

/// Immutable (device identifier, current network address) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub dev_eui: DevEui,
    pub dev_addr: DevAddr,
}

impl DeviceIdentity {
    pub fn new(dev_eui: DevEui, dev_addr: DevAddr) -> Self {
        Self { dev_eui, dev_addr }
    }
}

/// How duplicate uplinks heard by several gateways are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeduplicationMode {
    #[default]
    None,
    Drop,
    Mark,
}

impl FromStr for DeduplicationMode {
    type Err = LnsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(DeduplicationMode::None),
            "drop" => Ok(DeduplicationMode::Drop),
            "mark" => Ok(DeduplicationMode::Mark),
            other => Err(LnsError::Config(format!(
                "unknown deduplication mode: {}",
                other
            ))),
        }
    }
}

/// Session keys. Opaque to the coordination layer.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKeys {
    pub nwk_s_key: Option<String>,
    pub app_s_key: Option<String>,
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("nwk_s_key", &self.nwk_s_key.as_ref().map(|_| "<redacted>"))
            .field("app_s_key", &self.app_s_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Bootstrap record stored in the shared cache and returned by provisioning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSeed {
    pub identity: DeviceIdentity,
    #[serde(default)]
    pub keys: SessionKeys,
    #[serde(default)]
    pub fcnt_up: u32,
    #[serde(default)]
    pub fcnt_down: u32,
    #[serde(default)]
    pub dedup_mode: DeduplicationMode,
    #[serde(default)]
    pub adr_enabled: bool,
    /// Activation by personalization
    #[serde(default)]
    pub is_abp: bool,
    /// ABP devices that may restart their counters after a reboot
    #[serde(default)]
    pub abp_relaxed_fcnt: bool,
    #[serde(default)]
    pub preferred_gateway: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SessionSeed {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            keys: SessionKeys::default(),
            fcnt_up: 0,
            fcnt_down: 0,
            dedup_mode: DeduplicationMode::None,
            adr_enabled: false,
            is_abp: false,
            abp_relaxed_fcnt: false,
            preferred_gateway: None,
            updated_at: None,
        }
    }
}

/// One row of ADR history
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdrHistoryEntry {
    pub fcnt_up: u32,
    pub max_snr: f32,
    pub gateway_count: u32,
}

/// Hot, frequently mutated part of a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub fcnt_up: u32,
    pub fcnt_down: u32,
    pub adr_enabled: bool,
    pub adr_history: VecDeque<AdrHistoryEntry>,
    pub gateway_hint: Option<String>,
}

impl SessionState {
    /// Record an uplink in the ADR history, keeping the newest entries only
    pub fn record_adr(&mut self, entry: AdrHistoryEntry) {
        if let Some(last) = self.adr_history.back_mut() {
            if last.fcnt_up == entry.fcnt_up {
                // same frame heard again: keep the best SNR
                last.max_snr = last.max_snr.max(entry.max_snr);
                last.gateway_count = last.gateway_count.max(entry.gateway_count);
                return;
            }
        }
        if self.adr_history.len() == ADR_HISTORY_LEN {
            self.adr_history.pop_front();
        }
        self.adr_history.push_back(entry);
    }

    /// Forget counters after an ABP device restarted them
    pub fn reset_counters(&mut self) {
        self.fcnt_up = 0;
        self.fcnt_down = 0;
        self.adr_history.clear();
    }
}

/// Live session for one device, owned by the local registry
#[derive(Debug)]
pub struct DeviceSession {
    identity: DeviceIdentity,
    keys: SessionKeys,
    dedup_mode: DeduplicationMode,
    is_abp: bool,
    abp_relaxed_fcnt: bool,
    state: Mutex<SessionState>,
    /// Unix milliseconds of the last uplink, readable without the state lock
    last_seen_ms: AtomicI64,
}

impl DeviceSession {
    pub fn from_seed(seed: SessionSeed) -> Self {
        Self {
            identity: seed.identity,
            keys: seed.keys,
            dedup_mode: seed.dedup_mode,
            is_abp: seed.is_abp,
            abp_relaxed_fcnt: seed.abp_relaxed_fcnt,
            state: Mutex::new(SessionState {
                fcnt_up: seed.fcnt_up,
                fcnt_down: seed.fcnt_down,
                adr_enabled: seed.adr_enabled,
                adr_history: VecDeque::with_capacity(ADR_HISTORY_LEN),
                gateway_hint: seed.preferred_gateway,
            }),
            last_seen_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    pub fn dev_eui(&self) -> DevEui {
        self.identity.dev_eui
    }

    pub fn dev_addr(&self) -> DevAddr {
        self.identity.dev_addr
    }

    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    pub fn dedup_mode(&self) -> DeduplicationMode {
        self.dedup_mode
    }

    pub fn is_abp(&self) -> bool {
        self.is_abp
    }

    pub fn abp_relaxed_fcnt(&self) -> bool {
        self.abp_relaxed_fcnt
    }

    /// Wait for exclusive access to the hot state.
    ///
    /// Holding the guard is what makes a coordination call "in flight":
    /// waiters are served in FIFO order.
    pub async fn begin_coordination(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    pub fn touch(&self) {
        self.last_seen_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        let ms = self.last_seen_ms.load(Ordering::Relaxed);
        DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
    }

    /// Idle time in milliseconds relative to `now_ms`
    pub fn idle_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.last_seen_ms.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn set_last_seen_ms(&self, ms: i64) {
        self.last_seen_ms.store(ms, Ordering::Relaxed);
    }

    /// Serialisable seed reflecting the given state
    pub fn snapshot(&self, state: &SessionState) -> SessionSeed {
        SessionSeed {
            identity: self.identity,
            keys: self.keys.clone(),
            fcnt_up: state.fcnt_up,
            fcnt_down: state.fcnt_down,
            dedup_mode: self.dedup_mode,
            adr_enabled: state.adr_enabled,
            is_abp: self.is_abp,
            abp_relaxed_fcnt: self.abp_relaxed_fcnt,
            preferred_gateway: state.gateway_hint.clone(),
            updated_at: Some(Utc::now()),
        }
    }
}
