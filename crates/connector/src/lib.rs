//! tickstream-connector-lib: low-latency market-data stream client
//!
//! Connects to per-source push streams, decodes frames, keeps a TTL-bound
//! symbol/ticker cache with subscriber fan-out, and drives direct per-symbol
//! update sinks on a fixed frame tick while tracking processing latency.

pub mod backoff;
pub mod cache;
pub mod client;
pub mod clock;
pub mod connection;
pub mod decoder;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod fallback;
pub mod latency;
pub mod metrics;
pub mod pipeline;
pub mod server;
pub mod traits;
pub mod types;
pub mod websocket;

pub use backoff::ReconnectPolicy;
pub use cache::{CacheUpdate, Subscription, SymbolCache, UpdateCallback};
pub use client::MarketDataClient;
pub use connection::{ConnectionEvent, ConnectionHandle, ConnectionManager};
pub use decoder::{DecodeStrategy, Decoder, RawFrame};
pub use dispatcher::{BookRows, Direction, Dispatcher, PriceView, UpdateSink, VolumeView};
pub use endpoint::StreamTarget;
pub use error::{CacheError, ClientError, ConnectorError, FetchError};
pub use fallback::HttpSymbolFetcher;
pub use latency::{LatencyAggregator, SnapshotSubscription, Trend};
pub use pipeline::FeedPipeline;
pub use server::{create_router, run_server, ServerState};
pub use traits::{FrameAction, FrameHandler, StreamSession, StreamTransport, SymbolFetcher};
pub use types::{
    CachedState, ConnectionState, ConnectionStatus, DecodedMessage, LatencySample, LatencyStage,
    MetricsSnapshot, SourceKey, SymbolInfo, SystemStatus, TickerInfo,
};
pub use websocket::WsTransport;
