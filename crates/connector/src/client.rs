//! Client facade: owns the connection registry, cache, dispatcher and
//! latency aggregator, and wires them together through the frame pipeline.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tickstream_metadata::{ClientConfig, RefreshSettings, SettingsStore};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::ReconnectPolicy;
use crate::cache::SymbolCache;
use crate::connection::{ConnectionHandle, ConnectionManager};
use crate::decoder::Decoder;
use crate::dispatcher::Dispatcher;
use crate::endpoint::StreamTarget;
use crate::error::{CacheError, ClientError, ConnectorError};
use crate::fallback::HttpSymbolFetcher;
use crate::latency::LatencyAggregator;
use crate::pipeline::FeedPipeline;
use crate::server::ServerState;
use crate::traits::{StreamTransport, SymbolFetcher};
use crate::types::{CachedState, ConnectionStatus, SourceKey};
use crate::websocket::WsTransport;

const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct MarketDataClient {
    config: ClientConfig,
    settings: RwLock<RefreshSettings>,
    settings_store: Option<SettingsStore>,
    cache: SymbolCache,
    dispatcher: Arc<Dispatcher>,
    latency: LatencyAggregator,
    manager: ConnectionManager,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MarketDataClient {
    /// Production client: WebSocket transport plus the configured HTTP fallback
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let fetcher: Option<Arc<dyn SymbolFetcher>> = match &config.fallback {
            Some(fallback) => Some(Arc::new(HttpSymbolFetcher::from_config(fallback)?)),
            None => None,
        };
        Ok(Self::with_parts(config, Arc::new(WsTransport::new()), fetcher))
    }

    pub fn with_parts(
        config: ClientConfig,
        transport: Arc<dyn StreamTransport>,
        fetcher: Option<Arc<dyn SymbolFetcher>>,
    ) -> Self {
        let cache = SymbolCache::new(Duration::from_millis(config.cache.symbols_ttl_ms), fetcher);
        let dispatcher = Arc::new(Dispatcher::new(config.dispatcher.clone()));
        let latency = LatencyAggregator::new(config.metrics.clone());
        let pipeline = Arc::new(FeedPipeline::new(
            Decoder::new(),
            cache.clone(),
            Arc::clone(&dispatcher),
            latency.clone(),
        ));
        let manager = ConnectionManager::new(
            config.endpoint.clone(),
            ReconnectPolicy::from(&config.reconnect),
            transport,
            pipeline,
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            settings: RwLock::new(config.settings.clone()),
            config,
            settings_store: None,
            cache,
            dispatcher,
            latency,
            manager,
            shutdown,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Persist settings changes to `store`. Settings found in the store
    /// replace the configured ones.
    pub fn with_settings_store(mut self, store: SettingsStore) -> Result<Self, ClientError> {
        if store.path().exists() {
            let (settings, adjusted) = store.load()?.clamped();
            if adjusted {
                warn!(path = %store.path().display(), "Stored settings were out of range and have been clamped");
            }
            *self.settings.write() = settings;
        }
        self.settings_store = Some(store);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn cache(&self) -> &SymbolCache {
        &self.cache
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn latency(&self) -> &LatencyAggregator {
        &self.latency
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Start the frame tick, the metrics tick and the refresh loop. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(
            Arc::clone(&self.dispatcher).run_frames(self.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(self.latency.clone().run(self.shutdown.subscribe())));
        if let Some(requests) = self.cache.take_refresh_requests() {
            tasks.push(tokio::spawn(refresh_loop(
                self.cache.clone(),
                requests,
                self.shutdown.subscribe(),
            )));
        }
        info!(name = %self.config.name, "Client started");
    }

    pub async fn connect_source(&self, source: &str) -> Result<ConnectionHandle, ConnectorError> {
        self.manager.connect(StreamTarget::symbols(source)).await
    }

    pub async fn connect_market(
        &self,
        source: &str,
        symbol: &str,
        market: &str,
    ) -> Result<ConnectionHandle, ConnectorError> {
        self.manager
            .connect(StreamTarget::market(source, symbol, market))
            .await
    }

    /// Connect every configured source and market stream.
    ///
    /// Failures are logged; the manager keeps retrying them in the background.
    pub async fn connect_configured(&self) -> usize {
        let targets: Vec<StreamTarget> = self
            .config
            .sources
            .iter()
            .map(|s| StreamTarget::symbols(s.as_str()))
            .chain(self.config.markets.iter().map(StreamTarget::from))
            .collect();

        let results = futures_util::future::join_all(
            targets.iter().map(|t| self.manager.connect(t.clone())),
        )
        .await;

        let mut connected = 0;
        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(_) => connected += 1,
                Err(e) => warn!(target = %target, error = %e, "Initial connect failed"),
            }
        }
        info!(connected, total = targets.len(), "Connected configured streams");
        connected
    }

    /// Tear down `target`. For a symbols stream this also cancels waiters
    /// blocked on its initial snapshot.
    pub fn disconnect(&self, target: &StreamTarget) {
        self.manager.disconnect(target);
        if let StreamTarget::Symbols(source) = target {
            self.cache.cancel_waiters(source);
        }
    }

    /// Current state for `source`, waiting up to the configured initial timeout
    pub async fn symbols(&self, source: &str) -> Result<Arc<CachedState>, CacheError> {
        let timeout = Duration::from_millis(self.config.cache.initial_timeout_ms);
        self.cache.await_initial(&SourceKey::new(source), timeout).await
    }

    pub fn settings(&self) -> RefreshSettings {
        self.settings.read().clone()
    }

    /// Clamp, persist and push new refresh settings to every live connection.
    ///
    /// Returns the settings actually applied.
    pub fn update_settings(&self, settings: RefreshSettings) -> Result<RefreshSettings, ClientError> {
        let (settings, adjusted) = settings.clamped();
        if adjusted {
            debug!("Refresh settings clamped into range");
        }
        if let Some(store) = &self.settings_store {
            store.save(&settings)?;
        }
        *self.settings.write() = settings.clone();

        let message = config_update_message(&settings);
        let reached = self.manager.broadcast(&message);
        info!(connections = reached, "Pushed config update");
        Ok(settings)
    }

    /// Every configured symbols stream is connected
    pub fn is_ready(&self) -> bool {
        required_ready(&self.manager, &self.required_targets())
    }

    fn required_targets(&self) -> Vec<StreamTarget> {
        self.config
            .sources
            .iter()
            .map(|s| StreamTarget::symbols(s.as_str()))
            .collect()
    }

    /// State for the health server
    pub fn server_state(&self) -> ServerState {
        ServerState::new(
            self.config.name.clone(),
            self.manager.clone(),
            self.latency.clone(),
            self.required_targets(),
        )
    }

    /// Stop every task and connection and release all cached state
    pub async fn shutdown(&self) {
        info!(name = %self.config.name, "Shutting down client");
        let _ = self.shutdown.send(true);

        for source in self.cache.sources() {
            self.cache.cancel_waiters(&source);
        }
        self.manager.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, &mut task).await.is_err() {
                warn!("Background task did not stop in time, aborting");
                task.abort();
            }
        }

        self.cache.clear();
        self.dispatcher.clear();
        self.latency.clear();
    }
}

pub(crate) fn required_ready(manager: &ConnectionManager, required: &[StreamTarget]) -> bool {
    !required.is_empty()
        && required
            .iter()
            .all(|t| manager.state(t).status == ConnectionStatus::Connected)
}

/// Control frame announcing new refresh settings
pub fn config_update_message(settings: &RefreshSettings) -> String {
    serde_json::json!({
        "type": "config_update",
        "config": settings,
    })
    .to_string()
}

async fn refresh_loop(
    cache: SymbolCache,
    mut requests: mpsc::UnboundedReceiver<SourceKey>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("Refresh loop stopping");
                    break;
                }
            }
            request = requests.recv() => {
                let Some(source) = request else {
                    break;
                };
                let refreshed = tokio::select! {
                    refreshed = cache.refresh(&source) => refreshed,
                    _ = shutdown.changed() => {
                        debug!(source = %source, "Refresh loop stopping mid-fetch");
                        break;
                    }
                };
                match refreshed {
                    Ok(state) => debug!(source = %source, symbols = state.symbols.len(), "Refreshed stale entry"),
                    Err(e) => warn!(source = %source, error = %e, "Background refresh failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{MockTransport, Script};
    use crate::decoder::RawFrame;
    use crate::error::FetchError;
    use crate::types::SymbolInfo;
    use tickstream_metadata::EndpointConfig;

    fn config() -> ClientConfig {
        ClientConfig {
            name: "desk".to_string(),
            endpoint: EndpointConfig {
                scheme: "wss".to_string(),
                host: "stream.test".to_string(),
            },
            sources: vec!["bitget".to_string()],
            markets: vec![],
            reconnect: Default::default(),
            cache: Default::default(),
            dispatcher: Default::default(),
            metrics: Default::default(),
            fallback: None,
            settings: RefreshSettings::default(),
        }
    }

    fn text(s: &str) -> RawFrame {
        RawFrame::Text(s.to_string())
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    const INITIAL: &str = r#"{"type":"symbols_initial","symbols":["BTCUSDT","ETHUSDT"],"tickers":{}}"#;

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_over_stream_reaches_cache() {
        let transport = Arc::new(MockTransport::with_scripts(vec![Script::Frames(vec![text(INITIAL)])]));
        let client = MarketDataClient::with_parts(config(), transport, None);

        client.connect_source("bitget").await.unwrap();
        let state = client.symbols("bitget").await.unwrap();
        assert_eq!(state.symbols.len(), 2);
        assert!(client.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_answered_with_pong() {
        let transport = Arc::new(MockTransport::with_scripts(vec![Script::Frames(vec![text(
            r#"{"type":"ping"}"#,
        )])]));
        let client = MarketDataClient::with_parts(config(), transport.clone(), None);
        client.connect_source("bitget").await.unwrap();
        settle().await;
        assert_eq!(*transport.sent.lock(), vec![r#"{"type":"pong"}"#.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_settings_clamps_persists_and_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.yaml"));
        let transport = Arc::new(MockTransport::with_scripts(vec![Script::Frames(vec![])]));
        let client = MarketDataClient::with_parts(config(), transport.clone(), None)
            .with_settings_store(store.clone())
            .unwrap();
        client.connect_source("bitget").await.unwrap();

        let applied = client
            .update_settings(RefreshSettings {
                ticker_refresh_interval_ms: 10,
                ..RefreshSettings::default()
            })
            .unwrap();
        assert_eq!(applied.ticker_refresh_interval_ms, 1_000);
        assert_eq!(client.settings(), applied);
        assert_eq!(store.load().unwrap(), applied);

        settle().await;
        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(value["type"], "config_update");
        assert_eq!(value["config"]["tickerRefreshInterval"], 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_initial_waiters() {
        let transport = Arc::new(MockTransport::with_scripts(vec![Script::Frames(vec![])]));
        let client = Arc::new(MarketDataClient::with_parts(config(), transport, None));
        client.connect_source("bitget").await.unwrap();

        let waiter = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.symbols("bitget").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.disconnect(&StreamTarget::symbols("bitget"));

        assert!(matches!(waiter.await.unwrap(), Err(CacheError::Cancelled(_))));
        assert!(!client.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_tasks_and_clears_state() {
        let transport = Arc::new(MockTransport::with_scripts(vec![Script::Frames(vec![text(INITIAL)])]));
        let client = MarketDataClient::with_parts(config(), transport, None);
        client.start();
        client.start();
        assert_eq!(client.tasks.lock().len(), 3);

        client.connect_configured().await;
        client.symbols("bitget").await.unwrap();

        client.shutdown().await;
        assert!(client.tasks.lock().is_empty());
        assert!(client.cache().sources().is_empty());
        assert!(client.manager().states().is_empty());
    }

    struct SlowFetcher;

    #[async_trait::async_trait]
    impl SymbolFetcher for SlowFetcher {
        async fn fetch_symbols(&self, _source: &SourceKey) -> Result<Vec<SymbolInfo>, FetchError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![SymbolInfo {
                symbol: "BTCUSDT".to_string(),
                market: "spot".to_string(),
                last_price: 1.0,
                change: 0.0,
                change_percent: 0.0,
            }])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_in_flight_refresh() {
        let transport = Arc::new(MockTransport::default());
        let client = MarketDataClient::with_parts(config(), transport, Some(Arc::new(SlowFetcher)));
        client.start();

        let source = SourceKey::new("bitget");
        client.cache().request_refresh(&source);
        tokio::time::sleep(Duration::from_secs(1)).await;

        client.shutdown().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert!(client.cache().get(&source).is_none());
    }

    #[test]
    fn test_config_update_message_shape() {
        let message = config_update_message(&RefreshSettings::default());
        let value: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(value["type"], "config_update");
        assert!(value["config"]["backgroundUpdates"].as_bool().unwrap());
    }
}
