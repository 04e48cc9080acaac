//! HTTP symbol list fetch used when a stream is slow to deliver its snapshot

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tickstream_metadata::FallbackConfig;
use tracing::{debug, info};

use crate::decoder::envelope::parse_symbol_list;
use crate::error::FetchError;
use crate::traits::SymbolFetcher;
use crate::types::{SourceKey, SymbolInfo};

pub struct HttpSymbolFetcher {
    client: Client,
    base_url: String,
}

impl HttpSymbolFetcher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &FallbackConfig) -> Result<Self, FetchError> {
        Self::new(&config.base_url, Duration::from_secs(config.timeout_secs))
    }

    fn symbols_url(&self, source: &SourceKey) -> String {
        format!("{}/api/symbols/{}", self.base_url, source)
    }
}

#[async_trait]
impl SymbolFetcher for HttpSymbolFetcher {
    async fn fetch_symbols(&self, source: &SourceKey) -> Result<Vec<SymbolInfo>, FetchError> {
        let url = self.symbols_url(source);
        debug!(url = %url, source = %source, "Fetching symbols over HTTP");

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(FetchError::Api { status, message });
        }

        let body = response.text().await?;
        let symbols = parse_symbol_list(&body)?;

        info!(source = %source, symbol_count = symbols.len(), "Fetched symbols over HTTP");
        Ok(symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(server: &MockServer) -> HttpSymbolFetcher {
        HttpSymbolFetcher::new(&server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_strips_trailing_slash() {
        let fetcher = HttpSymbolFetcher::new("http://localhost:3000/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            fetcher.symbols_url(&SourceKey::new("bitget")),
            "http://localhost:3000/api/symbols/bitget"
        );
    }

    #[tokio::test]
    async fn test_fetch_bare_list() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/symbols/bitget"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"symbol": "BTCUSDT", "lastPrice": "65000.5", "changePercent": 1.2},
                "ETHUSDT"
            ])))
            .mount(&server)
            .await;

        let symbols = fetcher(&server)
            .fetch_symbols(&SourceKey::new("bitget"))
            .await
            .unwrap();
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0].last_price, 65000.5);
        assert_eq!(symbols[0].change_percent, 1.2);
        assert_eq!(symbols[1].symbol, "ETHUSDT");
        assert_eq!(symbols[1].market, "spot");
    }

    #[tokio::test]
    async fn test_fetch_wrapped_list_uses_tickers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/symbols/upbit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "symbols": ["KRW-BTC"],
                "tickers": {"KRW-BTC": {"trade_price": 90000000, "signed_change_rate": 0.01}}
            })))
            .mount(&server)
            .await;

        let symbols = fetcher(&server)
            .fetch_symbols(&SourceKey::new("upbit"))
            .await
            .unwrap();
        assert_eq!(symbols[0].last_price, 90_000_000.0);
        assert_eq!(symbols[0].change_percent, 0.01);
    }

    #[tokio::test]
    async fn test_fetch_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/symbols/bitget"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = fetcher(&server)
            .fetch_symbols(&SourceKey::new("bitget"))
            .await
            .unwrap_err();
        match err {
            FetchError::Api { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "maintenance");
            }
            other => panic!("expected api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_unreadable_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/symbols/bitget"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = fetcher(&server)
            .fetch_symbols(&SourceKey::new("bitget"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
    }
}
