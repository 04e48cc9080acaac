use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::MetadataError;
use crate::settings::RefreshSettings;

/// Default reconnect base delay in milliseconds
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
/// Default reconnect delay cap in milliseconds
pub const DEFAULT_RECONNECT_CAP_MS: u64 = 30_000;
/// Default number of reconnect attempts before giving up
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default symbols TTL (5 minutes)
pub const DEFAULT_SYMBOLS_TTL_MS: u64 = 300_000;
/// Default wait for the initial snapshot before the HTTP fallback
pub const DEFAULT_INITIAL_TIMEOUT_MS: u64 = 3_000;
/// Default frame interval (~60 frames per second)
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 16;
/// Default volume spike threshold (20%)
pub const DEFAULT_SPIKE_THRESHOLD: f64 = 0.20;
/// Default highlight duration
pub const DEFAULT_HIGHLIGHT_MS: u64 = 1_000;
/// Default number of rows kept per book side
pub const DEFAULT_BOOK_DEPTH: usize = 20;
/// Default dispatcher ticker freshness
pub const DEFAULT_TICKER_FRESHNESS_MS: u64 = 5_000;
/// Default metrics tick
pub const DEFAULT_METRICS_TICK_MS: u64 = 250;
/// Default EMA smoothing factor
pub const DEFAULT_SMOOTHING: f64 = 0.1;
/// Default SLA target in milliseconds
pub const DEFAULT_SLA_TARGET_MS: f64 = 5.0;
/// Default "optimal" threshold in milliseconds
pub const DEFAULT_OPTIMAL_BELOW_MS: f64 = 3.0;
/// Default number of snapshots kept
pub const DEFAULT_HISTORY_LEN: usize = 60;
/// Default HTTP fallback timeout
pub const DEFAULT_FALLBACK_TIMEOUT_SECS: u64 = 10;

fn default_scheme() -> String {
    "wss".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointConfig {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub host: String,
}

/// A per-symbol trade/candle/order-book stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketStream {
    pub source: String,
    pub symbol: String,
    pub market: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectConfig {
    #[serde(default = "ReconnectConfig::default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "ReconnectConfig::default_cap_ms")]
    pub cap_ms: u64,
    #[serde(default = "ReconnectConfig::default_max_attempts")]
    pub max_attempts: u32,
}

impl ReconnectConfig {
    fn default_base_ms() -> u64 {
        DEFAULT_RECONNECT_BASE_MS
    }

    fn default_cap_ms() -> u64 {
        DEFAULT_RECONNECT_CAP_MS
    }

    fn default_max_attempts() -> u32 {
        DEFAULT_MAX_ATTEMPTS
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_ms: DEFAULT_RECONNECT_BASE_MS,
            cap_ms: DEFAULT_RECONNECT_CAP_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "CacheConfig::default_ttl")]
    pub symbols_ttl_ms: u64,
    #[serde(default = "CacheConfig::default_initial_timeout")]
    pub initial_timeout_ms: u64,
}

impl CacheConfig {
    fn default_ttl() -> u64 {
        DEFAULT_SYMBOLS_TTL_MS
    }

    fn default_initial_timeout() -> u64 {
        DEFAULT_INITIAL_TIMEOUT_MS
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            symbols_ttl_ms: DEFAULT_SYMBOLS_TTL_MS,
            initial_timeout_ms: DEFAULT_INITIAL_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherConfig {
    #[serde(default = "DispatcherConfig::default_frame_interval")]
    pub frame_interval_ms: u64,
    #[serde(default = "DispatcherConfig::default_spike_threshold")]
    pub spike_threshold: f64,
    #[serde(default = "DispatcherConfig::default_highlight")]
    pub highlight_ms: u64,
    #[serde(default = "DispatcherConfig::default_book_depth")]
    pub book_depth: usize,
    /// Independent of the cache TTL
    #[serde(default = "DispatcherConfig::default_ticker_freshness")]
    pub ticker_freshness_ms: u64,
}

impl DispatcherConfig {
    fn default_frame_interval() -> u64 {
        DEFAULT_FRAME_INTERVAL_MS
    }

    fn default_spike_threshold() -> f64 {
        DEFAULT_SPIKE_THRESHOLD
    }

    fn default_highlight() -> u64 {
        DEFAULT_HIGHLIGHT_MS
    }

    fn default_book_depth() -> usize {
        DEFAULT_BOOK_DEPTH
    }

    fn default_ticker_freshness() -> u64 {
        DEFAULT_TICKER_FRESHNESS_MS
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: DEFAULT_FRAME_INTERVAL_MS,
            spike_threshold: DEFAULT_SPIKE_THRESHOLD,
            highlight_ms: DEFAULT_HIGHLIGHT_MS,
            book_depth: DEFAULT_BOOK_DEPTH,
            ticker_freshness_ms: DEFAULT_TICKER_FRESHNESS_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    #[serde(default = "MetricsConfig::default_tick")]
    pub tick_ms: u64,
    #[serde(default = "MetricsConfig::default_smoothing")]
    pub smoothing: f64,
    #[serde(default = "MetricsConfig::default_sla_target")]
    pub sla_target_ms: f64,
    #[serde(default = "MetricsConfig::default_optimal_below")]
    pub optimal_below_ms: f64,
    #[serde(default = "MetricsConfig::default_history_len")]
    pub history_len: usize,
}

impl MetricsConfig {
    fn default_tick() -> u64 {
        DEFAULT_METRICS_TICK_MS
    }

    fn default_smoothing() -> f64 {
        DEFAULT_SMOOTHING
    }

    fn default_sla_target() -> f64 {
        DEFAULT_SLA_TARGET_MS
    }

    fn default_optimal_below() -> f64 {
        DEFAULT_OPTIMAL_BELOW_MS
    }

    fn default_history_len() -> usize {
        DEFAULT_HISTORY_LEN
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            tick_ms: DEFAULT_METRICS_TICK_MS,
            smoothing: DEFAULT_SMOOTHING,
            sla_target_ms: DEFAULT_SLA_TARGET_MS,
            optimal_below_ms: DEFAULT_OPTIMAL_BELOW_MS,
            history_len: DEFAULT_HISTORY_LEN,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FallbackConfig {
    pub base_url: String,
    #[serde(default = "FallbackConfig::default_timeout")]
    pub timeout_secs: u64,
}

impl FallbackConfig {
    fn default_timeout() -> u64 {
        DEFAULT_FALLBACK_TIMEOUT_SECS
    }
}

/// Top-level client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub name: String,
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub markets: Vec<MarketStream>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub fallback: Option<FallbackConfig>,
    #[serde(default)]
    pub settings: RefreshSettings,
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, MetadataError> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MetadataError> {
        if self.endpoint.host.trim().is_empty() {
            return Err(MetadataError::Validation("endpoint.host is empty".into()));
        }
        if !matches!(self.endpoint.scheme.as_str(), "ws" | "wss") {
            return Err(MetadataError::Validation(format!(
                "endpoint.scheme must be ws or wss, got {}",
                self.endpoint.scheme
            )));
        }
        if self.sources.iter().any(|s| s.trim().is_empty()) {
            return Err(MetadataError::Validation("empty source key".into()));
        }
        let r = &self.reconnect;
        if r.base_ms == 0 || r.cap_ms < r.base_ms || r.max_attempts == 0 {
            return Err(MetadataError::Validation(format!(
                "invalid reconnect policy: base_ms={} cap_ms={} max_attempts={}",
                r.base_ms, r.cap_ms, r.max_attempts
            )));
        }
        let m = &self.metrics;
        if !(m.smoothing > 0.0 && m.smoothing <= 1.0) {
            return Err(MetadataError::Validation(format!(
                "metrics.smoothing must be in (0, 1], got {}",
                m.smoothing
            )));
        }
        if m.sla_target_ms <= 0.0 || m.history_len == 0 || m.tick_ms == 0 {
            return Err(MetadataError::Validation("invalid metrics config".into()));
        }
        if self.dispatcher.frame_interval_ms == 0 {
            return Err(MetadataError::Validation(
                "dispatcher.frame_interval_ms must be positive".into(),
            ));
        }
        self.settings.validate()
    }
}
