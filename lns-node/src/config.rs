use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

use crate::device::DeduplicationMode;
use crate::error::{LnsError, Result};

/// Upper bound accepted for `coordination.retry.max_retries`
pub const MAX_RETRY_CEILING: u32 = 16;

/// Main configuration for a network server node
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LnsConfig {
    /// Instance identity and deployment metadata
    pub platform: PlatformConfig,
    /// Local device registry
    pub registry: RegistryConfig,
    /// Uplink dispatcher
    pub dispatcher: DispatcherConfig,
    /// Remote coordination client
    pub coordination: CoordinationConfig,
    /// Deduplication defaults
    pub dedup: DedupConfig,
    /// Shared cache housekeeping
    pub cache: CacheConfig,
    /// Distributed locks
    pub locks: LockConfig,
    /// Shared device-address index
    pub devaddr_cache: DevAddrCacheConfig,
    /// NATS messaging configuration
    pub nats: NatsConfig,
    /// Provisioning backend
    pub provisioning: ProvisioningConfig,
    /// Metrics and monitoring
    pub metrics: MetricsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Instance identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Server instance identity, also the name of its cross-instance channel
    pub instance_id: String,
    /// Deployment environment (development, staging, production)
    pub environment: String,
    /// Regional identifier
    pub region: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("lns-{}", uuid::Uuid::new_v4().simple()),
            environment: "development".to_string(),
            region: "local".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Sessions idle for longer than this are evicted
    pub idle_eviction_seconds: u64,
    /// How often the eviction sweep runs
    pub eviction_interval_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_eviction_seconds: 3600,
            eviction_interval_seconds: 60,
        }
    }
}

impl RegistryConfig {
    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_seconds)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// A per-device pipeline with no traffic for this long is retired
    pub pipeline_idle_seconds: u64,
    /// Lifetime of a station ownership record unless refreshed by a reconnect
    pub station_owner_ttl_seconds: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pipeline_idle_seconds: 300,
            station_owner_ttl_seconds: 24 * 3600,
        }
    }
}

impl DispatcherConfig {
    pub fn pipeline_idle(&self) -> Duration {
        Duration::from_secs(self.pipeline_idle_seconds)
    }

    pub fn station_owner_ttl(&self) -> Duration {
        Duration::from_secs(self.station_owner_ttl_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Base URL of the bundled coordination endpoint. Unset means the
    /// node coordinates directly against the shared cache.
    pub endpoint_url: Option<String>,
    /// Function key sent as the `code` query parameter
    pub auth_code: Option<String>,
    /// Timeout of a single attempt, counted against the retry budget
    pub attempt_timeout_ms: u64,
    pub retry: RetryConfig,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            auth_code: None,
            attempt_timeout_ms: 3000,
            retry: RetryConfig::default(),
        }
    }
}

impl CoordinationConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Bounded exponential backoff with jitter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of each delay added as random jitter (0.0 - 1.0)
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 8,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            jitter_ratio: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// How long a (device, fcnt) pair is remembered for deduplication
    pub window_seconds: u64,
    /// Mode used for provisioned devices that do not specify one
    pub default_mode: DeduplicationMode,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            default_mode: DeduplicationMode::Drop,
        }
    }
}

impl DedupConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How often expired keys and leases are dropped from the store
    pub purge_interval_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            purge_interval_seconds: 60,
        }
    }
}

impl CacheConfig {
    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease of the full index rebuild lock
    pub full_update_lease_seconds: u64,
    /// Lease of the incremental index update lock
    pub delta_update_lease_seconds: u64,
    /// Renewal period of held leases
    pub renew_interval_seconds: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            full_update_lease_seconds: 300,
            delta_update_lease_seconds: 60,
            renew_interval_seconds: 20,
        }
    }
}

impl LockConfig {
    pub fn full_update_lease(&self) -> Duration {
        Duration::from_secs(self.full_update_lease_seconds)
    }

    pub fn delta_update_lease(&self) -> Duration {
        Duration::from_secs(self.delta_update_lease_seconds)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.renew_interval_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevAddrCacheConfig {
    /// Minimum time between two full rebuilds of the index
    pub full_reload_interval_seconds: u64,
    /// How often the sync task wakes up
    pub sync_interval_seconds: u64,
    /// TTL of index entries and device seeds
    pub entry_ttl_seconds: u64,
}

impl Default for DevAddrCacheConfig {
    fn default() -> Self {
        Self {
            full_reload_interval_seconds: 24 * 3600,
            sync_interval_seconds: 300,
            entry_ttl_seconds: 2 * 24 * 3600,
        }
    }
}

impl DevAddrCacheConfig {
    pub fn full_reload_interval(&self) -> Duration {
        Duration::from_secs(self.full_reload_interval_seconds)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds)
    }

    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_seconds)
    }
}

/// NATS messaging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// Use NATS for the cross-instance channel and telemetry
    pub enabled: bool,
    /// NATS server URL
    pub url: String,
    /// Prefix of every subject this node publishes or subscribes to
    pub subject_prefix: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "nats://localhost:4222".to_string(),
            subject_prefix: "lns".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// JSON file with the device seeds known to this deployment
    pub seed_file: Option<String>,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter
    pub enabled: bool,
    /// Metrics server address
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

impl MetricsConfig {
    pub fn listen_addr(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        self.listen_addr.parse()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl LnsConfig {
    /// Load configuration from file, overridden by `LNS__SECTION__KEY` variables
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("LNS").separator("__"))
            .build()?;

        let config: LnsConfig = settings.try_deserialize()?;
        info!(path = %path, instance_id = %config.platform.instance_id, "Configuration loaded");
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let toml_string =
            toml::to_string_pretty(self).map_err(|e| LnsError::Serialization(e.to_string()))?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.platform.instance_id.trim().is_empty() {
            return Err(LnsError::Config("Instance id cannot be empty".to_string()));
        }

        if self.coordination.attempt_timeout_ms == 0 {
            return Err(LnsError::Config(
                "Coordination attempt timeout cannot be 0".to_string(),
            ));
        }

        let retry = &self.coordination.retry;
        if retry.max_retries > MAX_RETRY_CEILING {
            return Err(LnsError::Config(format!(
                "Coordination retries cannot exceed {}",
                MAX_RETRY_CEILING
            )));
        }
        if retry.max_delay_ms < retry.initial_delay_ms {
            return Err(LnsError::Config(
                "Retry max delay cannot be below the initial delay".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&retry.jitter_ratio) {
            return Err(LnsError::Config(
                "Retry jitter ratio must be within 0.0 and 1.0".to_string(),
            ));
        }

        if self.registry.idle_eviction_seconds == 0 || self.registry.eviction_interval_seconds == 0 {
            return Err(LnsError::Config(
                "Registry eviction timings cannot be 0".to_string(),
            ));
        }

        if self.dispatcher.pipeline_idle_seconds == 0 {
            return Err(LnsError::Config(
                "Dispatcher pipeline idle timeout cannot be 0".to_string(),
            ));
        }

        if self.dedup.window_seconds == 0 {
            return Err(LnsError::Config(
                "Deduplication window cannot be 0".to_string(),
            ));
        }

        if self.cache.purge_interval_seconds == 0 {
            return Err(LnsError::Config(
                "Cache purge interval cannot be 0".to_string(),
            ));
        }

        if self.locks.renew_interval_seconds == 0
            || self.locks.full_update_lease_seconds == 0
            || self.locks.delta_update_lease_seconds == 0
        {
            return Err(LnsError::Config("Lock timings cannot be 0".to_string()));
        }

        if self.devaddr_cache.sync_interval_seconds == 0 {
            return Err(LnsError::Config(
                "Device address sync interval cannot be 0".to_string(),
            ));
        }

        if self.metrics.enabled && self.metrics.listen_addr().is_err() {
            return Err(LnsError::Config(format!(
                "Invalid metrics listen address: {}",
                self.metrics.listen_addr
            )));
        }

        Ok(())
    }
}
