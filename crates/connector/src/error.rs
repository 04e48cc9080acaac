use thiserror::Error;

/// Connection-level failures.
///
/// Cloneable so one pending connect attempt can hand the same outcome to every
/// caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectorError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("disconnected: {0}")]
    Disconnected(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("reconnect attempts exhausted after {0} tries")]
    Exhausted(u32),
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("fallback returned error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("unreadable symbol list: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("no fallback configured")]
    NotConfigured,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("wait for initial snapshot cancelled: {0}")]
    Cancelled(String),
}

/// Failures while building or reconfiguring a [`crate::client::MarketDataClient`]
#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Settings(#[from] tickstream_metadata::MetadataError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),
}
