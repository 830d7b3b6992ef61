//! Router configuration: command line arguments, the TOML config file and the
//! shared, reloadable snapshot the background tasks read from.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

pub const DEFAULT_INBOUND_KBPS: u64 = 1000;
pub const DEFAULT_OUTBOUND_KBPS: u64 = 60;
/// Burst pools default to this many seconds of burst rate.
pub const DEFAULT_BURST_SECONDS: u64 = 60;
pub const DEFAULT_SHARE_PERCENTAGE: u8 = 80;
pub const DEFAULT_BID_TIMEOUT_MS: u64 = 250;
/// Largest rate accepted from configuration, in KB/s.
pub const MAX_RATE_KBPS: u64 = 1 << 30;
pub const DEFAULT_IP_CACHE_SIZE: usize = 1024;
pub const MIN_IP_CACHE_SIZE: usize = 512;
pub const MAX_IP_CACHE_SIZE: usize = 8192;

#[derive(clap::Parser, Debug, Clone, Default)]
#[command(name = "tunnelgate", version, about)]
pub struct ConfigArgs {
    /// Path of a TOML configuration file.
    #[arg(long, env = "TUNNELGATE_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<LevelFilter>,

    /// Steady inbound rate in KB/s, 0 for unlimited.
    #[arg(long, env = "TUNNELGATE_INBOUND_KBPS")]
    pub inbound_kbps: Option<u64>,

    /// Steady outbound rate in KB/s, 0 for unlimited.
    #[arg(long, env = "TUNNELGATE_OUTBOUND_KBPS")]
    pub outbound_kbps: Option<u64>,

    /// Percentage of bandwidth offered to participating traffic.
    #[arg(long, env = "TUNNELGATE_SHARE_PERCENTAGE")]
    pub share_percentage: Option<u8>,

    /// Relaxed mode for local test networks: short reachability windows.
    #[arg(long)]
    pub allow_local: bool,
}

impl ConfigArgs {
    /// Read and parse a configuration file.
    pub fn read_config(path: &Path) -> anyhow::Result<Config> {
        tracing::debug!(path = ?path, "Reading configuration file");
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        let config = toml::from_str::<Config>(&content)
            .with_context(|| format!("invalid configuration file {}", path.display()))?;
        Ok(config)
    }

    /// Load the configuration file, if any, and apply command line overrides on top.
    pub fn build(self) -> anyhow::Result<Config> {
        let mut config = match self.config.as_deref() {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("configuration file not found: {}", path.display());
                }
                Self::read_config(path)?
            }
            None => Config::default(),
        };

        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(kbps) = self.inbound_kbps {
            config.bandwidth.inbound_kbps = kbps;
        }
        if let Some(kbps) = self.outbound_kbps {
            config.bandwidth.outbound_kbps = kbps;
        }
        if let Some(share) = self.share_percentage {
            config.bandwidth.share_percentage = share;
        }
        if self.allow_local {
            config.reachability.allow_local = true;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(with = "serde_log_level_filter")]
    pub log_level: LevelFilter,
    pub bandwidth: BandwidthSettings,
    pub reachability: ReachabilitySettings,
    pub dispatch: DispatchSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LevelFilter::INFO,
            bandwidth: BandwidthSettings::default(),
            reachability: ReachabilitySettings::default(),
            dispatch: DispatchSettings::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bandwidth.share_percentage > 100 {
            anyhow::bail!(
                "share_percentage must be at most 100, got {}",
                self.bandwidth.share_percentage
            );
        }
        if self.dispatch.bid_timeout_ms == 0 {
            anyhow::bail!("bid_timeout_ms must be positive");
        }
        let bw = &self.bandwidth;
        let rates = [
            ("inbound_kbps", Some(bw.inbound_kbps)),
            ("outbound_kbps", Some(bw.outbound_kbps)),
            ("inbound_burst_kbps", bw.inbound_burst_kbps),
            ("outbound_burst_kbps", bw.outbound_burst_kbps),
        ];
        for (name, rate) in rates {
            if let Some(rate) = rate.filter(|rate| *rate > MAX_RATE_KBPS) {
                anyhow::bail!("{name} must be at most {MAX_RATE_KBPS}, got {rate}");
            }
        }
        let max_pool = MAX_RATE_KBPS * DEFAULT_BURST_SECONDS;
        for (name, pool) in [
            ("inbound_burst_kbytes", bw.inbound_burst_kbytes),
            ("outbound_burst_kbytes", bw.outbound_burst_kbytes),
        ] {
            if let Some(pool) = pool.filter(|pool| *pool > max_pool) {
                anyhow::bail!("{name} must be at most {max_pool}, got {pool}");
            }
        }
        Ok(())
    }
}

/// Configured rates, in KB/s and KB. Clamping happens where they are consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthSettings {
    pub inbound_kbps: u64,
    pub outbound_kbps: u64,
    /// Defaults to the steady inbound rate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inbound_burst_kbps: Option<u64>,
    /// Defaults to the steady outbound rate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbound_burst_kbps: Option<u64>,
    /// Defaults to [`DEFAULT_BURST_SECONDS`] of inbound burst rate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inbound_burst_kbytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbound_burst_kbytes: Option<u64>,
    pub share_percentage: u8,
}

impl Default for BandwidthSettings {
    fn default() -> Self {
        Self {
            inbound_kbps: DEFAULT_INBOUND_KBPS,
            outbound_kbps: DEFAULT_OUTBOUND_KBPS,
            inbound_burst_kbps: None,
            outbound_burst_kbps: None,
            inbound_burst_kbytes: None,
            outbound_burst_kbytes: None,
            share_percentage: DEFAULT_SHARE_PERCENTAGE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReachabilitySettings {
    pub allow_local: bool,
    /// Lift a permanent ban when the peer turns out to be reachable.
    pub forgive_banned_on_reachable: bool,
    /// Peers whose last seen address is remembered.
    pub ip_cache_size: usize,
}

impl Default for ReachabilitySettings {
    fn default() -> Self {
        Self {
            allow_local: false,
            forgive_banned_on_reachable: true,
            ip_cache_size: DEFAULT_IP_CACHE_SIZE,
        }
    }
}

impl ReachabilitySettings {
    pub fn ip_cache_capacity(&self) -> usize {
        self.ip_cache_size.clamp(MIN_IP_CACHE_SIZE, MAX_IP_CACHE_SIZE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// How long a single transport may take to bid.
    pub bid_timeout_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            bid_timeout_ms: DEFAULT_BID_TIMEOUT_MS,
        }
    }
}

impl DispatchSettings {
    pub fn bid_timeout(&self) -> Duration {
        Duration::from_millis(self.bid_timeout_ms)
    }
}

/// Where the allowance scheduler reads its rates from on every config check.
pub trait ConfigSource: Send + Sync + 'static {
    fn bandwidth(&self) -> BandwidthSettings;
}

/// Cloneable handle to the live configuration.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<Config>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn snapshot(&self) -> Config {
        self.inner.read().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut Config)) {
        f(&mut self.inner.write());
    }

    /// Replace the configuration with the file's contents. Command line overrides
    /// are not reapplied. On error the current configuration is kept.
    pub fn reload(&self, path: &Path) -> anyhow::Result<()> {
        let config = ConfigArgs::read_config(path)?;
        config.validate()?;
        *self.inner.write() = config;
        tracing::info!(path = ?path, "Configuration reloaded");
        Ok(())
    }
}

impl ConfigSource for SharedConfig {
    fn bandwidth(&self) -> BandwidthSettings {
        self.inner.read().bandwidth
    }
}

mod serde_log_level_filter {
    use serde::{Deserialize, Deserializer, Serializer};
    use tracing::level_filters::LevelFilter;

    pub fn serialize<S>(level: &LevelFilter, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&level.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level = String::deserialize(deserializer)?;
        level
            .trim()
            .parse::<LevelFilter>()
            .map_err(|_| serde::de::Error::custom(format!("unknown log level: {level}")))
    }
}
