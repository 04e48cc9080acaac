//! Stream endpoint addressing

use std::fmt;

use tickstream_metadata::{EndpointConfig, MarketStream};
use url::Url;

use crate::error::ConnectorError;
use crate::types::SourceKey;

/// What a connection streams. One live connection per target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamTarget {
    /// Symbol list and tickers for a source
    Symbols(SourceKey),
    /// Per-symbol trade, candle and order-book stream
    Market {
        source: SourceKey,
        symbol: String,
        market: String,
    },
}

impl StreamTarget {
    pub fn symbols(source: impl Into<SourceKey>) -> Self {
        Self::Symbols(source.into())
    }

    pub fn market(
        source: impl Into<SourceKey>,
        symbol: impl Into<String>,
        market: impl Into<String>,
    ) -> Self {
        Self::Market {
            source: source.into(),
            symbol: symbol.into(),
            market: market.into(),
        }
    }

    pub fn source(&self) -> &SourceKey {
        match self {
            Self::Symbols(source) | Self::Market { source, .. } => source,
        }
    }

    fn segments(&self) -> Vec<&str> {
        match self {
            Self::Symbols(source) => vec!["ws", "symbols", source.as_str()],
            Self::Market {
                source,
                symbol,
                market,
            } => vec!["ws", source.as_str(), symbol.as_str(), market.as_str()],
        }
    }

    /// Full endpoint URL for this target.
    ///
    /// Each path segment is percent-encoded, so `XBT/USD` stays one segment.
    pub fn url(&self, endpoint: &EndpointConfig) -> Result<String, ConnectorError> {
        let base = format!("{}://{}", endpoint.scheme, endpoint.host);
        let mut url = Url::parse(&base)
            .map_err(|e| ConnectorError::ConnectionFailed(format!("{}: {}", base, e)))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(ConnectorError::ConnectionFailed(format!(
                    "unsupported scheme: {}",
                    other
                )))
            }
        }

        let segments = self.segments();
        // empty and dot segments would collapse the path
        if let Some(bad) = segments.iter().find(|s| matches!(**s, "" | "." | "..")) {
            return Err(ConnectorError::ConnectionFailed(format!(
                "invalid path segment {:?} for {}",
                bad, self
            )));
        }
        let mut path = url
            .path_segments_mut()
            .map_err(|_| ConnectorError::ConnectionFailed(format!("{}: cannot be a base", base)))?;
        path.clear().extend(segments);
        drop(path);
        Ok(url.to_string())
    }
}

impl From<&MarketStream> for StreamTarget {
    fn from(stream: &MarketStream) -> Self {
        Self::market(
            stream.source.as_str(),
            stream.symbol.clone(),
            stream.market.clone(),
        )
    }
}

impl fmt::Display for StreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Symbols(source) => write!(f, "symbols:{}", source),
            Self::Market {
                source,
                symbol,
                market,
            } => write!(f, "{}:{}:{}", source, symbol, market),
        }
    }
}
