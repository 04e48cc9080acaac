//! Consumer-settable refresh settings.
//!
//! Settings are persisted as flat key/value pairs so any string store can hold
//! them. Pushing new settings to live connections is done by the connector.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::MetadataError;

pub const KEY_SYMBOLS_REFRESH: &str = "symbolsRefreshInterval";
pub const KEY_TICKER_REFRESH: &str = "tickerRefreshInterval";
pub const KEY_OHLC_REFRESH: &str = "ohlcRefreshInterval";
pub const KEY_ORDERBOOK_REFRESH: &str = "orderbookRefreshInterval";
pub const KEY_BACKGROUND_UPDATES: &str = "backgroundUpdates";

/// Symbols list refresh: 5 minutes to 24 hours
pub const SYMBOLS_REFRESH_RANGE_MS: (u64, u64) = (5 * 60 * 1000, 24 * 60 * 60 * 1000);
/// Ticker refresh: 1 to 30 seconds
pub const TICKER_REFRESH_RANGE_MS: (u64, u64) = (1_000, 30_000);
/// Candle refresh: 50ms to 5 seconds
pub const OHLC_REFRESH_RANGE_MS: (u64, u64) = (50, 5_000);
/// Order book refresh: 50ms to 1 second
pub const ORDERBOOK_REFRESH_RANGE_MS: (u64, u64) = (50, 1_000);

pub const DEFAULT_SYMBOLS_REFRESH_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_TICKER_REFRESH_MS: u64 = 5_000;
pub const DEFAULT_OHLC_REFRESH_MS: u64 = 1_000;
pub const DEFAULT_ORDERBOOK_REFRESH_MS: u64 = 200;

fn default_symbols_refresh() -> u64 {
    DEFAULT_SYMBOLS_REFRESH_MS
}

fn default_ticker_refresh() -> u64 {
    DEFAULT_TICKER_REFRESH_MS
}

fn default_ohlc_refresh() -> u64 {
    DEFAULT_OHLC_REFRESH_MS
}

fn default_orderbook_refresh() -> u64 {
    DEFAULT_ORDERBOOK_REFRESH_MS
}

fn default_background_updates() -> bool {
    true
}

/// Refresh cadence the consumer asks the upstream to honour.
///
/// Serialized field names match the key/value names so the same document works
/// both as a YAML config section and as a persisted pair set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSettings {
    #[serde(rename = "symbolsRefreshInterval", default = "default_symbols_refresh")]
    pub symbols_refresh_interval_ms: u64,
    #[serde(rename = "tickerRefreshInterval", default = "default_ticker_refresh")]
    pub ticker_refresh_interval_ms: u64,
    #[serde(rename = "ohlcRefreshInterval", default = "default_ohlc_refresh")]
    pub ohlc_refresh_interval_ms: u64,
    #[serde(rename = "orderbookRefreshInterval", default = "default_orderbook_refresh")]
    pub orderbook_refresh_interval_ms: u64,
    #[serde(default = "default_background_updates")]
    pub background_updates: bool,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            symbols_refresh_interval_ms: default_symbols_refresh(),
            ticker_refresh_interval_ms: default_ticker_refresh(),
            ohlc_refresh_interval_ms: default_ohlc_refresh(),
            orderbook_refresh_interval_ms: default_orderbook_refresh(),
            background_updates: default_background_updates(),
        }
    }
}

fn check_range(name: &str, value: u64, (min, max): (u64, u64)) -> Result<(), MetadataError> {
    if value < min || value > max {
        return Err(MetadataError::Validation(format!(
            "{} = {}ms is outside {}..={}ms",
            name, value, min, max
        )));
    }
    Ok(())
}

fn clamp_range(value: u64, (min, max): (u64, u64), clamped: &mut bool) -> u64 {
    let v = value.clamp(min, max);
    if v != value {
        *clamped = true;
    }
    v
}

impl RefreshSettings {
    /// Reject any interval outside its allowed range
    pub fn validate(&self) -> Result<(), MetadataError> {
        check_range(KEY_SYMBOLS_REFRESH, self.symbols_refresh_interval_ms, SYMBOLS_REFRESH_RANGE_MS)?;
        check_range(KEY_TICKER_REFRESH, self.ticker_refresh_interval_ms, TICKER_REFRESH_RANGE_MS)?;
        check_range(KEY_OHLC_REFRESH, self.ohlc_refresh_interval_ms, OHLC_REFRESH_RANGE_MS)?;
        check_range(
            KEY_ORDERBOOK_REFRESH,
            self.orderbook_refresh_interval_ms,
            ORDERBOOK_REFRESH_RANGE_MS,
        )?;
        Ok(())
    }

    /// Force every interval into its allowed range.
    /// Returns a tuple of (clamped_settings, was_clamped).
    pub fn clamped(mut self) -> (Self, bool) {
        let mut clamped = false;
        self.symbols_refresh_interval_ms = clamp_range(
            self.symbols_refresh_interval_ms,
            SYMBOLS_REFRESH_RANGE_MS,
            &mut clamped,
        );
        self.ticker_refresh_interval_ms = clamp_range(
            self.ticker_refresh_interval_ms,
            TICKER_REFRESH_RANGE_MS,
            &mut clamped,
        );
        self.ohlc_refresh_interval_ms =
            clamp_range(self.ohlc_refresh_interval_ms, OHLC_REFRESH_RANGE_MS, &mut clamped);
        self.orderbook_refresh_interval_ms = clamp_range(
            self.orderbook_refresh_interval_ms,
            ORDERBOOK_REFRESH_RANGE_MS,
            &mut clamped,
        );
        (self, clamped)
    }

    /// Flatten into persisted key/value pairs
    pub fn to_pairs(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (KEY_SYMBOLS_REFRESH.to_string(), self.symbols_refresh_interval_ms.to_string()),
            (KEY_TICKER_REFRESH.to_string(), self.ticker_refresh_interval_ms.to_string()),
            (KEY_OHLC_REFRESH.to_string(), self.ohlc_refresh_interval_ms.to_string()),
            (KEY_ORDERBOOK_REFRESH.to_string(), self.orderbook_refresh_interval_ms.to_string()),
            (KEY_BACKGROUND_UPDATES.to_string(), self.background_updates.to_string()),
        ])
    }

    /// Rebuild from persisted pairs.
    ///
    /// Unknown keys are ignored, missing keys keep their defaults and
    /// out-of-range intervals are clamped. Unparseable values are an error.
    pub fn from_pairs(pairs: &BTreeMap<String, String>) -> Result<Self, MetadataError> {
        fn parse_ms(key: &str, raw: &str) -> Result<u64, MetadataError> {
            raw.trim()
                .parse::<u64>()
                .map_err(|e| MetadataError::Validation(format!("{}: {}", key, e)))
        }

        let mut settings = Self::default();
        for (key, value) in pairs {
            match key.as_str() {
                KEY_SYMBOLS_REFRESH => settings.symbols_refresh_interval_ms = parse_ms(key, value)?,
                KEY_TICKER_REFRESH => settings.ticker_refresh_interval_ms = parse_ms(key, value)?,
                KEY_OHLC_REFRESH => settings.ohlc_refresh_interval_ms = parse_ms(key, value)?,
                KEY_ORDERBOOK_REFRESH => {
                    settings.orderbook_refresh_interval_ms = parse_ms(key, value)?
                }
                KEY_BACKGROUND_UPDATES => {
                    settings.background_updates = value.trim().parse::<bool>().map_err(|e| {
                        MetadataError::Validation(format!("{}: {}", key, e))
                    })?
                }
                _ => {}
            }
        }
        Ok(settings.clamped().0)
    }
}

const KNOWN_KEYS: [&str; 5] = [
    KEY_SYMBOLS_REFRESH,
    KEY_TICKER_REFRESH,
    KEY_OHLC_REFRESH,
    KEY_ORDERBOOK_REFRESH,
    KEY_BACKGROUND_UPDATES,
];

/// Flatten a hand-editable settings file to string pairs.
///
/// Quoted and bare scalars are both accepted. Nulls and nested values under
/// unknown keys are skipped.
fn scalar_pairs(
    raw: BTreeMap<String, serde_yaml::Value>,
) -> Result<BTreeMap<String, String>, MetadataError> {
    use serde_yaml::Value;

    let mut pairs = BTreeMap::new();
    for (key, value) in raw {
        let text = match value {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => continue,
            _ if !KNOWN_KEYS.contains(&key.as_str()) => continue,
            _ => {
                return Err(MetadataError::Validation(format!(
                    "{}: expected a scalar value",
                    key
                )))
            }
        };
        pairs.insert(key, text);
    }
    Ok(pairs)
}

/// File-backed key/value store for [`RefreshSettings`]
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load persisted settings; a missing file yields defaults
    pub fn load(&self) -> Result<RefreshSettings, MetadataError> {
        if !self.path.exists() {
            return Ok(RefreshSettings::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(RefreshSettings::default());
        }
        let raw: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(&content)?;
        RefreshSettings::from_pairs(&scalar_pairs(raw)?)
    }

    pub fn save(&self, settings: &RefreshSettings) -> Result<(), MetadataError> {
        let content = serde_yaml::to_string(&settings.to_pairs())?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}
