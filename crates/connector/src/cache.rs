//! Per-source symbol and ticker cache.
//!
//! One [`CachedState`] per source, replaced wholesale by an initial snapshot and
//! patched in place by ticker updates. Entries are never expired: a stale read
//! returns the last-known state and asks for a refresh. Only the frame pipeline
//! and the refresh loop write; everyone else reads or subscribes.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::clock::epoch_millis;
use crate::error::{CacheError, FetchError};
use crate::metrics;
use crate::traits::SymbolFetcher;
use crate::types::{CachedState, SourceKey, SymbolInfo, TickerInfo};

/// What changed, as delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum CacheUpdate {
    /// The whole state for a source was replaced
    Snapshot(Arc<CachedState>),
    /// One ticker was patched
    Ticker {
        source: SourceKey,
        symbol: String,
        ticker: TickerInfo,
        timestamp: u64,
    },
}

impl CacheUpdate {
    pub fn source(&self) -> &SourceKey {
        match self {
            Self::Snapshot(state) => &state.source,
            Self::Ticker { source, .. } => source,
        }
    }
}

pub type UpdateCallback = Arc<dyn Fn(&CacheUpdate) + Send + Sync>;

type Waiter = oneshot::Sender<Result<Arc<CachedState>, CacheError>>;

struct Subscriber {
    id: u64,
    callback: UpdateCallback,
}

struct CacheInner {
    ttl_ms: u64,
    entries: DashMap<SourceKey, Arc<CachedState>>,
    subscribers: RwLock<HashMap<SourceKey, Vec<Subscriber>>>,
    waiters: Mutex<HashMap<SourceKey, Vec<Waiter>>>,
    refresh_pending: Mutex<HashSet<SourceKey>>,
    refresh_tx: mpsc::UnboundedSender<SourceKey>,
    refresh_rx: Mutex<Option<mpsc::UnboundedReceiver<SourceKey>>>,
    fetcher: Option<Arc<dyn SymbolFetcher>>,
    next_subscriber: AtomicU64,
}

/// Handle returned by [`SymbolCache::on_update`].
///
/// Dropping it keeps the subscription; call [`Subscription::unsubscribe`].
pub struct Subscription {
    cache: Weak<CacheInner>,
    source: SourceKey,
    id: u64,
    done: AtomicBool,
}

impl Subscription {
    /// Remove the callback. Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(cache) = self.cache.upgrade() else {
            return;
        };
        let mut subscribers = cache.subscribers.write();
        if let Some(list) = subscribers.get_mut(&self.source) {
            list.retain(|s| s.id != self.id);
            if list.is_empty() {
                subscribers.remove(&self.source);
            }
        }
    }

    pub fn is_active(&self) -> bool {
        !self.done.load(Ordering::Acquire) && self.cache.strong_count() > 0
    }
}

#[derive(Clone)]
pub struct SymbolCache {
    inner: Arc<CacheInner>,
}

impl SymbolCache {
    pub fn new(ttl: Duration, fetcher: Option<Arc<dyn SymbolFetcher>>) -> Self {
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(CacheInner {
                ttl_ms: ttl.as_millis() as u64,
                entries: DashMap::new(),
                subscribers: RwLock::new(HashMap::new()),
                waiters: Mutex::new(HashMap::new()),
                refresh_pending: Mutex::new(HashSet::new()),
                refresh_tx,
                refresh_rx: Mutex::new(Some(refresh_rx)),
                fetcher,
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.inner.ttl_ms)
    }

    pub fn has_fetcher(&self) -> bool {
        self.inner.fetcher.is_some()
    }

    /// Last-known state for `source`, fresh or not.
    ///
    /// A stale hit also requests a background refresh.
    pub fn get(&self, source: &SourceKey) -> Option<Arc<CachedState>> {
        let state = self.inner.entries.get(source).map(|e| Arc::clone(e.value()))?;
        if !state.is_fresh_at(epoch_millis(), self.inner.ttl_ms) {
            self.request_refresh(source);
        }
        Some(state)
    }

    /// State for `source` only if it is within the TTL
    pub fn get_fresh(&self, source: &SourceKey) -> Option<Arc<CachedState>> {
        let state = self.inner.entries.get(source).map(|e| Arc::clone(e.value()))?;
        state
            .is_fresh_at(epoch_millis(), self.inner.ttl_ms)
            .then_some(state)
    }

    pub fn is_fresh(&self, source: &SourceKey) -> bool {
        self.get_fresh(source).is_some()
    }

    pub fn sources(&self) -> Vec<SourceKey> {
        let mut sources: Vec<SourceKey> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        sources.sort();
        sources
    }

    /// Receiver of deduplicated refresh requests. Yields `None` after the first call.
    pub fn take_refresh_requests(&self) -> Option<mpsc::UnboundedReceiver<SourceKey>> {
        self.inner.refresh_rx.lock().take()
    }

    /// Ask for a refresh unless one is already outstanding for `source`
    pub fn request_refresh(&self, source: &SourceKey) {
        let newly = self.inner.refresh_pending.lock().insert(source.clone());
        if newly {
            debug!(source = %source, "Requesting cache refresh");
            let _ = self.inner.refresh_tx.send(source.clone());
        }
    }

    /// Mark an outstanding refresh as finished, successful or not
    pub fn refresh_finished(&self, source: &SourceKey) {
        self.inner.refresh_pending.lock().remove(source);
    }

    /// Register a callback for every mutation of `source`.
    ///
    /// Callbacks run synchronously on the writer, in registration order.
    pub fn on_update(&self, source: &SourceKey, callback: UpdateCallback) -> Subscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .write()
            .entry(source.clone())
            .or_default()
            .push(Subscriber { id, callback });
        Subscription {
            cache: Arc::downgrade(&self.inner),
            source: source.clone(),
            id,
            done: AtomicBool::new(false),
        }
    }

    pub fn subscriber_count(&self, source: &SourceKey) -> usize {
        self.inner
            .subscribers
            .read()
            .get(source)
            .map_or(0, Vec::len)
    }

    /// Resolve once an initial snapshot for `source` is cached.
    ///
    /// A fresh entry resolves immediately. After `timeout` the HTTP fallback
    /// is tried; if that fails too the last-known (or an empty) state is
    /// returned. Only cancellation yields an error.
    pub async fn await_initial(
        &self,
        source: &SourceKey,
        timeout: Duration,
    ) -> Result<Arc<CachedState>, CacheError> {
        if let Some(state) = self.get_fresh(source) {
            return Ok(state);
        }

        let (tx, rx) = oneshot::channel();
        self.inner
            .waiters
            .lock()
            .entry(source.clone())
            .or_default()
            .push(tx);

        // An initial snapshot may have landed between the check and registration
        if let Some(state) = self.get_fresh(source) {
            drop(rx);
            self.prune_waiters(source);
            return Ok(state);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CacheError::Cancelled(format!("{} cache cleared", source))),
            Err(_) => {
                self.prune_waiters(source);
                warn!(
                    source = %source,
                    timeout_ms = timeout.as_millis() as u64,
                    "No initial snapshot within timeout, falling back"
                );
                Ok(self.fallback(source).await)
            }
        }
    }

    /// Drop waiters whose receiver is gone
    fn prune_waiters(&self, source: &SourceKey) {
        let mut waiters = self.inner.waiters.lock();
        if let Some(list) = waiters.get_mut(source) {
            list.retain(|waiter| !waiter.is_closed());
            if list.is_empty() {
                waiters.remove(source);
            }
        }
    }

    async fn fallback(&self, source: &SourceKey) -> Arc<CachedState> {
        if let Some(fetcher) = &self.inner.fetcher {
            match fetcher.fetch_symbols(source).await {
                Ok(symbols) => {
                    metrics::inc_fallback(source.as_str(), "ok");
                    info!(source = %source, symbols = symbols.len(), "Fallback fetch succeeded");
                    return self.apply_fetched(source, symbols);
                }
                Err(e) => {
                    metrics::inc_fallback(source.as_str(), "error");
                    warn!(source = %source, error = %e, "Fallback fetch failed");
                }
            }
        }
        self.inner
            .entries
            .get(source)
            .map(|e| Arc::clone(e.value()))
            .unwrap_or_else(|| Arc::new(CachedState::empty(source.clone(), 0)))
    }

    /// Fetch `source` out of band and install the result.
    ///
    /// Clears the outstanding refresh mark whatever the outcome.
    pub async fn refresh(&self, source: &SourceKey) -> Result<Arc<CachedState>, FetchError> {
        let Some(fetcher) = &self.inner.fetcher else {
            self.refresh_finished(source);
            return Err(FetchError::NotConfigured);
        };
        match fetcher.fetch_symbols(source).await {
            Ok(symbols) => {
                metrics::inc_fallback(source.as_str(), "refresh_ok");
                Ok(self.apply_fetched(source, symbols))
            }
            Err(e) => {
                metrics::inc_fallback(source.as_str(), "refresh_error");
                self.refresh_finished(source);
                Err(e)
            }
        }
    }

    /// Fail every pending `await_initial` for `source`
    pub fn cancel_waiters(&self, source: &SourceKey) {
        let waiters = self.inner.waiters.lock().remove(source).unwrap_or_default();
        if !waiters.is_empty() {
            debug!(source = %source, count = waiters.len(), "Cancelling initial waiters");
        }
        for waiter in waiters {
            let _ = waiter.send(Err(CacheError::Cancelled(format!("{} disconnected", source))));
        }
    }

    /// Drop every entry, subscriber, waiter and outstanding refresh
    pub fn clear(&self) {
        let sources: Vec<SourceKey> = self.inner.waiters.lock().keys().cloned().collect();
        for source in &sources {
            self.cancel_waiters(source);
        }
        self.inner.entries.clear();
        self.inner.subscribers.write().clear();
        self.inner.refresh_pending.lock().clear();
    }

    /// Replace the state for a source with a new initial snapshot
    pub(crate) fn apply_initial(
        &self,
        source: &SourceKey,
        symbols: Vec<SymbolInfo>,
        tickers: HashMap<String, TickerInfo>,
    ) -> Arc<CachedState> {
        let state = Arc::new(CachedState {
            source: source.clone(),
            symbols: symbols.into(),
            tickers,
            timestamp: epoch_millis(),
        });
        self.install(state)
    }

    /// Symbols fetched out of band; keeps any tickers already cached
    pub(crate) fn apply_fetched(&self, source: &SourceKey, symbols: Vec<SymbolInfo>) -> Arc<CachedState> {
        let tickers = self
            .inner
            .entries
            .get(source)
            .map(|e| e.tickers.clone())
            .unwrap_or_default();
        self.apply_initial(source, symbols, tickers)
    }

    fn install(&self, state: Arc<CachedState>) -> Arc<CachedState> {
        let source = state.source.clone();
        self.inner.entries.insert(source.clone(), Arc::clone(&state));
        self.refresh_finished(&source);
        trace!(source = %source, symbols = state.symbols.len(), "Cached initial snapshot");

        let waiters = self.inner.waiters.lock().remove(&source).unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(Ok(Arc::clone(&state)));
        }

        self.fan_out(&source, &CacheUpdate::Snapshot(Arc::clone(&state)));
        state
    }

    /// Patch one ticker and refresh the timestamp.
    ///
    /// Copy-on-write: while a reader still holds the previous snapshot the
    /// ticker map is cloned (the symbol list stays shared), otherwise the
    /// entry is patched in place.
    ///
    /// Returns `false` when no initial snapshot exists yet for `source`.
    pub(crate) fn apply_ticker_update(&self, source: &SourceKey, symbol: &str, ticker: TickerInfo) -> bool {
        let timestamp = epoch_millis();
        {
            let Some(mut entry) = self.inner.entries.get_mut(source) else {
                trace!(source = %source, symbol = %symbol, "Ticker update before initial snapshot");
                return false;
            };
            let state = Arc::make_mut(entry.value_mut());
            state.tickers.insert(symbol.to_string(), ticker.clone());
            state.timestamp = timestamp;
        }

        self.fan_out(
            source,
            &CacheUpdate::Ticker {
                source: source.clone(),
                symbol: symbol.to_string(),
                ticker,
                timestamp,
            },
        );
        true
    }

    fn fan_out(&self, source: &SourceKey, update: &CacheUpdate) {
        let callbacks: Vec<UpdateCallback> = match self.inner.subscribers.read().get(source) {
            Some(list) => list.iter().map(|s| Arc::clone(&s.callback)).collect(),
            None => return,
        };
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(update))).is_err() {
                metrics::inc_callback_panic();
                error!(source = %source, "Cache subscriber panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn symbol(name: &str, price: f64) -> SymbolInfo {
        SymbolInfo {
            symbol: name.to_string(),
            market: "spot".to_string(),
            last_price: price,
            change: 0.0,
            change_percent: 0.0,
        }
    }

    fn ticker(price: f64) -> TickerInfo {
        TickerInfo {
            last_price: price,
            ..Default::default()
        }
    }

    fn cache() -> SymbolCache {
        SymbolCache::new(Duration::from_secs(300), None)
    }

    struct StaticFetcher {
        result: Option<Vec<SymbolInfo>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SymbolFetcher for StaticFetcher {
        async fn fetch_symbols(&self, _source: &SourceKey) -> Result<Vec<SymbolInfo>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone().ok_or(FetchError::Api {
                status: 503,
                message: "unavailable".to_string(),
            })
        }
    }

    #[test]
    fn test_initial_then_ticker_patch() {
        let cache = cache();
        let source = SourceKey::new("bitget");
        assert!(cache.get(&source).is_none());

        cache.apply_initial(&source, vec![symbol("BTCUSDT", 1.0), symbol("ETHUSDT", 2.0)], HashMap::new());
        let before = cache.get(&source).unwrap();

        assert!(cache.apply_ticker_update(&source, "BTCUSDT", ticker(65000.5)));
        let after = cache.get(&source).unwrap();

        // readers holding the old snapshot are unaffected
        assert!(before.tickers.is_empty());
        assert_eq!(after.tickers["BTCUSDT"].last_price, 65000.5);
        assert_eq!(after.symbols.len(), 2);
        assert_eq!(after.symbols[0].symbol, "BTCUSDT");
        assert!(after.timestamp >= before.timestamp);
        // the symbol list is shared, not copied
        assert!(Arc::ptr_eq(&before.symbols, &after.symbols));
    }

    #[test]
    fn test_unshared_entry_is_patched_in_place() {
        let cache = cache();
        let source = SourceKey::new("bitget");
        let installed = cache.apply_initial(&source, vec![symbol("BTCUSDT", 1.0)], HashMap::new());
        let address = Arc::as_ptr(&installed);
        drop(installed);

        assert!(cache.apply_ticker_update(&source, "BTCUSDT", ticker(2.0)));
        assert!(cache.apply_ticker_update(&source, "BTCUSDT", ticker(3.0)));
        let state = cache.get(&source).unwrap();
        assert_eq!(Arc::as_ptr(&state), address);
        assert_eq!(state.tickers["BTCUSDT"].last_price, 3.0);
    }

    #[test]
    fn test_ticker_update_without_initial_is_ignored() {
        let cache = cache();
        let source = SourceKey::new("bitget");
        assert!(!cache.apply_ticker_update(&source, "BTCUSDT", ticker(1.0)));
        assert!(cache.get(&source).is_none());
    }

    #[test]
    fn test_stale_read_returns_last_known_and_requests_refresh_once() {
        let cache = SymbolCache::new(Duration::ZERO, None);
        let source = SourceKey::new("bitget");
        let mut requests = cache.take_refresh_requests().unwrap();
        assert!(cache.take_refresh_requests().is_none());

        cache.apply_initial(&source, vec![symbol("BTCUSDT", 1.0)], HashMap::new());
        assert!(!cache.is_fresh(&source));
        assert_eq!(cache.get(&source).unwrap().symbols.len(), 1);
        assert_eq!(cache.get(&source).unwrap().symbols.len(), 1);

        assert_eq!(requests.try_recv().unwrap(), source);
        assert!(requests.try_recv().is_err());

        cache.refresh_finished(&source);
        cache.get(&source);
        assert_eq!(requests.try_recv().unwrap(), source);
    }

    #[test]
    fn test_fan_out_in_registration_order_survives_panics() {
        let cache = cache();
        let source = SourceKey::new("bitget");
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        cache.on_update(&source, Arc::new(move |_: &CacheUpdate| o.lock().push(1)));
        cache.on_update(&source, Arc::new(|_: &CacheUpdate| panic!("subscriber bug")));
        let o = Arc::clone(&order);
        cache.on_update(&source, Arc::new(move |_: &CacheUpdate| o.lock().push(3)));

        cache.apply_initial(&source, vec![], HashMap::new());
        assert_eq!(*order.lock(), vec![1, 3]);

        cache.apply_ticker_update(&source, "BTCUSDT", ticker(1.0));
        assert_eq!(*order.lock(), vec![1, 3, 1, 3]);
    }

    #[test]
    fn test_incremental_update_carries_changed_ticker_only() {
        let cache = cache();
        let source = SourceKey::new("bitget");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        cache.on_update(&source, Arc::new(move |u: &CacheUpdate| s.lock().push(u.clone())));

        cache.apply_initial(&source, vec![symbol("BTCUSDT", 1.0)], HashMap::new());
        cache.apply_ticker_update(&source, "BTCUSDT", ticker(2.0));

        let seen = seen.lock();
        assert!(matches!(seen[0], CacheUpdate::Snapshot(_)));
        match &seen[1] {
            CacheUpdate::Ticker { symbol, ticker, .. } => {
                assert_eq!(symbol, "BTCUSDT");
                assert_eq!(ticker.last_price, 2.0);
            }
            other => panic!("expected ticker update, got {:?}", other),
        }
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let cache = cache();
        let source = SourceKey::new("bitget");
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let sub = cache.on_update(&source, Arc::new(move |_: &CacheUpdate| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let other = cache.on_update(&source, Arc::new(|_: &CacheUpdate| {}));

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert!(other.is_active());
        assert_eq!(cache.subscriber_count(&source), 1);

        cache.apply_initial(&source, vec![], HashMap::new());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_await_initial_fresh_entry_resolves_immediately() {
        let cache = cache();
        let source = SourceKey::new("bitget");
        cache.apply_initial(&source, vec![symbol("BTCUSDT", 1.0)], HashMap::new());
        let state = cache.await_initial(&source, Duration::from_millis(1)).await.unwrap();
        assert_eq!(state.symbols.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_initial_resolves_on_snapshot() {
        let cache = cache();
        let source = SourceKey::new("bitget");

        let waiter = {
            let cache = cache.clone();
            let source = source.clone();
            tokio::spawn(async move { cache.await_initial(&source, Duration::from_secs(3)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cache.apply_initial(&source, vec![symbol("ETHUSDT", 2.0)], HashMap::new());

        let state = waiter.await.unwrap().unwrap();
        assert_eq!(state.symbols[0].symbol, "ETHUSDT");
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_initial_timeout_uses_fallback() {
        let fetcher = Arc::new(StaticFetcher {
            result: Some(vec![symbol("XRPUSDT", 0.5)]),
            calls: AtomicUsize::new(0),
        });
        let cache = SymbolCache::new(Duration::from_secs(300), Some(fetcher.clone()));
        let source = SourceKey::new("bitget");

        let state = cache.await_initial(&source, Duration::from_secs(3)).await.unwrap();
        assert_eq!(state.symbols[0].symbol, "XRPUSDT");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        // written back through the cache
        assert!(cache.is_fresh(&source));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_initial_failed_fallback_returns_empty() {
        let fetcher = Arc::new(StaticFetcher {
            result: None,
            calls: AtomicUsize::new(0),
        });
        let cache = SymbolCache::new(Duration::from_secs(300), Some(fetcher));
        let source = SourceKey::new("bitget");

        let state = cache.await_initial(&source, Duration::from_secs(3)).await.unwrap();
        assert!(state.symbols.is_empty());
        assert_eq!(state.source, source);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_initial_stale_entry_falls_back_to_last_known() {
        let cache = SymbolCache::new(Duration::ZERO, None);
        let source = SourceKey::new("bitget");
        cache.apply_initial(&source, vec![symbol("BTCUSDT", 1.0)], HashMap::new());

        let state = cache.await_initial(&source, Duration::from_secs(3)).await.unwrap();
        assert_eq!(state.symbols[0].symbol, "BTCUSDT");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_waiters_are_released() {
        let cache = cache();
        let source = SourceKey::new("bitget");

        for _ in 0..100 {
            let state = cache.await_initial(&source, Duration::from_millis(10)).await.unwrap();
            assert!(state.symbols.is_empty());
        }
        assert!(cache.inner.waiters.lock().get(&source).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_waiter_leaves_pending_ones() {
        let cache = cache();
        let source = SourceKey::new("bitget");
        let pending = {
            let cache = cache.clone();
            let source = source.clone();
            tokio::spawn(async move { cache.await_initial(&source, Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        cache.await_initial(&source, Duration::from_millis(10)).await.unwrap();
        assert_eq!(cache.inner.waiters.lock().get(&source).map_or(0, Vec::len), 1);

        cache.apply_initial(&source, vec![symbol("BTCUSDT", 1.0)], HashMap::new());
        let state = pending.await.unwrap().unwrap();
        assert_eq!(state.symbols[0].symbol, "BTCUSDT");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_waiters_rejects() {
        let cache = cache();
        let source = SourceKey::new("bitget");
        let waiter = {
            let cache = cache.clone();
            let source = source.clone();
            tokio::spawn(async move { cache.await_initial(&source, Duration::from_secs(3)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.cancel_waiters(&source);

        assert!(matches!(waiter.await.unwrap(), Err(CacheError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_refresh_writes_back_and_clears_pending() {
        let fetcher = Arc::new(StaticFetcher {
            result: Some(vec![symbol("BTCUSDT", 2.0)]),
            calls: AtomicUsize::new(0),
        });
        let cache = SymbolCache::new(Duration::from_secs(300), Some(fetcher.clone()));
        let source = SourceKey::new("bitget");
        cache.apply_initial(&source, vec![symbol("BTCUSDT", 1.0)], HashMap::new());
        cache.apply_ticker_update(&source, "BTCUSDT", ticker(1.5));

        cache.request_refresh(&source);
        let state = cache.refresh(&source).await.unwrap();
        assert_eq!(state.symbols[0].last_price, 2.0);
        assert_eq!(state.tickers["BTCUSDT"].last_price, 1.5);

        // a new request goes through once the previous one finished
        let mut rx = cache.take_refresh_requests().unwrap();
        assert_eq!(rx.try_recv().unwrap(), source);
        cache.request_refresh(&source);
        assert_eq!(rx.try_recv().unwrap(), source);
    }

    #[tokio::test]
    async fn test_refresh_without_fetcher() {
        let cache = cache();
        let err = cache.refresh(&SourceKey::new("bitget")).await.unwrap_err();
        assert!(matches!(err, FetchError::NotConfigured));
    }

    #[test]
    fn test_clear_drops_entries_and_subscribers() {
        let cache = cache();
        let source = SourceKey::new("bitget");
        let sub = cache.on_update(&source, Arc::new(|_: &CacheUpdate| {}));
        cache.apply_initial(&source, vec![], HashMap::new());

        cache.clear();
        assert!(cache.get(&source).is_none());
        assert_eq!(cache.subscriber_count(&source), 0);
        // unsubscribing after clear is harmless
        sub.unsubscribe();
    }
}
