//! LNS Node Library
//!
//! Coordination layer of a horizontally scaled LoRaWAN network server:
//! per-device uplink dispatch, the device session registry, bundled remote
//! coordination with retry, deduplication, distributed locks and the
//! cross-instance remote-call channel.

pub mod cache;
pub mod channel;
pub mod config;
pub mod coordination;
pub mod dedup;
pub mod devaddr_cache;
pub mod device;
pub mod dispatcher;
pub mod downlink;
pub mod error;
pub mod events;
pub mod feed;
pub mod lock;
pub mod node;
pub mod provisioning;
pub mod registry;
pub mod uplink;

// Re-export commonly used types
pub use cache::{CacheStore, InMemoryCacheStore};
pub use channel::{CrossInstanceChannel, InProcessChannelHub, LnsRemoteCall, RemoteCallKind};
pub use config::LnsConfig;
pub use coordination::{
    BundledCoordinationResult, CoordinationClient, CoordinationEndpoint, RetryPolicy,
};
pub use dedup::{DeduplicationAction, DeduplicationStrategy};
pub use device::{DeduplicationMode, DevAddr, DevEui, DeviceIdentity, DeviceSession, SessionSeed};
pub use dispatcher::MessageDispatcher;
pub use error::{CoordinationError, LnsError, Result};
pub use lock::DistributedLockManager;
pub use node::{LnsNode, LnsNodeBuilder};
pub use registry::DeviceRegistry;
pub use uplink::{RadioMetadata, UplinkFrame, UplinkOutcome};
