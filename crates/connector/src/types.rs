//! Decoded market-data records and per-source state

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Identifies one logical upstream (e.g. an exchange name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceKey(Arc<str>);

impl SourceKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SourceKey {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

/// Normalized display form of a symbol. Replaced, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub market: String,
    pub last_price: f64,
    pub change: f64,
    pub change_percent: f64,
}

/// Source-native ticker fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickerInfo {
    pub last_price: f64,
    pub high_24h: Option<f64>,
    pub low_24h: Option<f64>,
    pub change_rate: Option<f64>,
    pub volume_24h: Option<f64>,
    pub quote_volume_24h: Option<f64>,
}

/// Cached per-source state. Symbol order is preserved as received.
///
/// Cloning shares the symbol list; only the ticker map is copied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedState {
    pub source: SourceKey,
    pub symbols: Arc<[SymbolInfo]>,
    pub tickers: HashMap<String, TickerInfo>,
    /// Capture time, epoch milliseconds
    pub timestamp: u64,
}

impl CachedState {
    pub fn empty(source: SourceKey, timestamp: u64) -> Self {
        Self {
            source,
            symbols: Arc::from(Vec::new()),
            tickers: HashMap::new(),
            timestamp,
        }
    }

    pub fn is_fresh_at(&self, now_ms: u64, ttl_ms: u64) -> bool {
        is_fresh(self.timestamp, now_ms, ttl_ms)
    }
}

/// `now - timestamp < ttl`; a timestamp in the future counts as fresh
#[inline]
pub fn is_fresh(timestamp_ms: u64, now_ms: u64, ttl_ms: u64) -> bool {
    now_ms.saturating_sub(timestamp_ms) < ttl_ms
}

/// Kind of a flat trading message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickKind {
    Trade,
    Price,
}

impl TickKind {
    pub fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "trade" => Some(Self::Trade),
            "price" | "tick" => Some(Self::Price),
            _ => None,
        }
    }
}

/// A price print carrying the fields used by the low-latency path
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeTick {
    pub kind: TickKind,
    pub symbol: String,
    pub price: f64,
    pub change: Option<f64>,
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatKind {
    Ping,
    Pong,
}

/// One price level: (price, quantity)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BookLevel {
    pub price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderBookUpdate {
    pub symbol: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

/// Typed result of decoding one inbound frame
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecodedMessage {
    SymbolsInitial {
        source: SourceKey,
        server_timestamp: u64,
        symbols: Vec<SymbolInfo>,
        tickers: HashMap<String, TickerInfo>,
    },
    TickerUpdate {
        source: SourceKey,
        server_timestamp: u64,
        symbol: String,
        ticker: TickerInfo,
    },
    Trade {
        source: SourceKey,
        server_timestamp: u64,
        tick: TradeTick,
    },
    Heartbeat {
        source: SourceKey,
        server_timestamp: u64,
        kind: HeartbeatKind,
    },
    OrderBook {
        source: SourceKey,
        server_timestamp: u64,
        book: OrderBookUpdate,
    },
}

impl DecodedMessage {
    pub fn source(&self) -> &SourceKey {
        match self {
            Self::SymbolsInitial { source, .. }
            | Self::TickerUpdate { source, .. }
            | Self::Trade { source, .. }
            | Self::Heartbeat { source, .. }
            | Self::OrderBook { source, .. } => source,
        }
    }

    pub fn server_timestamp(&self) -> u64 {
        match self {
            Self::SymbolsInitial { server_timestamp, .. }
            | Self::TickerUpdate { server_timestamp, .. }
            | Self::Trade { server_timestamp, .. }
            | Self::Heartbeat { server_timestamp, .. }
            | Self::OrderBook { server_timestamp, .. } => *server_timestamp,
        }
    }

    /// Label used for metrics and logs
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::SymbolsInitial { .. } => "symbols_initial",
            Self::TickerUpdate { .. } => "ticker_update",
            Self::Trade { .. } => "trade",
            Self::Heartbeat { .. } => "heartbeat",
            Self::OrderBook { .. } => "orderbook",
        }
    }
}

/// Connection lifecycle status. `Failed` is terminal until a caller retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub reconnect_attempt: u32,
    /// Epoch milliseconds of the last frame or state change, 0 if never
    pub last_activity_at: u64,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempt: 0,
            last_activity_at: 0,
        }
    }
}

/// Pipeline stage a latency sample belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LatencyStage {
    Decode,
    CacheWrite,
    Dispatch,
    RoundTrip,
}

impl LatencyStage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::CacheWrite => "cache_write",
            Self::Dispatch => "dispatch",
            Self::RoundTrip => "round_trip",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySample {
    pub stage: LatencyStage,
    pub duration_ms: f64,
    /// Epoch milliseconds
    pub captured_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemStatus {
    Optimal,
    Stable,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub average_latency: f64,
    pub last_latency: f64,
    pub sla_compliance_percent: f64,
    pub messages_per_second: f64,
    pub system_status: SystemStatus,
    /// Latest server-to-client round trip, if any was observed
    pub round_trip_ms: Option<f64>,
    /// Epoch milliseconds
    pub captured_at: u64,
}
