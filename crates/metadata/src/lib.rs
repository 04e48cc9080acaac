//! tickstream-metadata: client configuration and consumer-settable refresh settings

pub mod config;
pub mod error;
pub mod settings;

pub use config::{
    CacheConfig, ClientConfig, DispatcherConfig, EndpointConfig, FallbackConfig, MarketStream,
    MetricsConfig, ReconnectConfig,
};
pub use error::MetadataError;
pub use settings::{RefreshSettings, SettingsStore};
