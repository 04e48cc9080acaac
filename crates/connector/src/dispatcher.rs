//! Direct per-symbol updates that bypass the cache fan-out.
//!
//! Routed messages only stage a pending value per symbol (last value wins).
//! Sinks are written once per frame tick by [`Dispatcher::flush`], outside the
//! state lock. Order-book rows are built at route time and handed to sinks as a
//! single `Arc`, so a sink never observes a partially updated book.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tickstream_metadata::DispatcherConfig;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::metrics;
use crate::types::{BookLevel, DecodedMessage, OrderBookUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Flat,
}

impl Direction {
    pub fn from_change(change: Option<f64>) -> Self {
        match change {
            Some(c) if c > 0.0 => Self::Up,
            Some(c) if c < 0.0 => Self::Down,
            _ => Self::Flat,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceView {
    pub symbol: String,
    pub price: f64,
    pub change: Option<f64>,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookRow {
    pub price: f64,
    pub quantity: f64,
    /// Cumulative quantity from the top of this side
    pub cumulative: f64,
    /// `cumulative` over the side's total, for depth bars
    pub depth_ratio: f64,
}

/// Complete displayed book for one symbol
#[derive(Debug, Clone, PartialEq)]
pub struct BookRows {
    pub symbol: String,
    pub bids: Vec<BookRow>,
    pub asks: Vec<BookRow>,
}

impl BookRows {
    pub fn build(book: &OrderBookUpdate, depth: usize) -> Self {
        Self {
            symbol: book.symbol.clone(),
            bids: side_rows(&book.bids, depth),
            asks: side_rows(&book.asks, depth),
        }
    }
}

fn side_rows(levels: &[BookLevel], depth: usize) -> Vec<BookRow> {
    let levels = &levels[..levels.len().min(depth)];
    let total: f64 = levels.iter().map(|l| l.quantity).sum();
    let mut cumulative = 0.0;
    levels
        .iter()
        .map(|level| {
            cumulative += level.quantity;
            BookRow {
                price: level.price,
                quantity: level.quantity,
                cumulative,
                depth_ratio: if total > 0.0 { cumulative / total } else { 0.0 },
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeView {
    pub symbol: String,
    pub volume: f64,
    /// Magnitude with a K/M suffix
    pub text: String,
    pub spike: bool,
}

/// Human-readable volume: `1.23M`, `45.6K`, `999.00`
pub fn format_volume(volume: f64) -> String {
    let abs = volume.abs();
    if abs >= 1_000_000.0 {
        format!("{:.2}M", volume / 1_000_000.0)
    } else if abs >= 1_000.0 {
        format!("{:.1}K", volume / 1_000.0)
    } else {
        format!("{:.2}", volume)
    }
}

/// Direct write target for one symbol. Methods must be cheap and non-blocking.
pub trait UpdateSink: Send + Sync {
    fn price(&self, _view: &PriceView) {}
    fn book(&self, _rows: &Arc<BookRows>) {}
    fn volume(&self, _view: &VolumeView) {}
    fn highlight(&self, _symbol: &str, _on: bool) {}
}

#[derive(Default)]
struct Pending {
    price: Option<PriceView>,
    book: Option<Arc<BookRows>>,
    volume: Option<VolumeView>,
    highlight: Option<bool>,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.price.is_none() && self.book.is_none() && self.volume.is_none() && self.highlight.is_none()
    }
}

#[derive(Default)]
struct SymbolSlot {
    sinks: Vec<(u64, Arc<dyn UpdateSink>)>,
    pending: Pending,
    last_volume: Option<f64>,
    highlight_until: Option<Instant>,
    last_seen: Option<Instant>,
}

#[derive(Default)]
struct State {
    symbols: HashMap<String, SymbolSlot>,
    dirty: HashSet<String>,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    state: Mutex<State>,
    next_sink: AtomicU64,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            next_sink: AtomicU64::new(1),
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.config.frame_interval_ms)
    }

    /// Register a sink for `symbol`. Returns an id for [`Dispatcher::unregister`].
    pub fn register(&self, symbol: &str, sink: Arc<dyn UpdateSink>) -> u64 {
        let id = self.next_sink.fetch_add(1, Ordering::Relaxed);
        self.state
            .lock()
            .symbols
            .entry(symbol.to_string())
            .or_default()
            .sinks
            .push((id, sink));
        id
    }

    pub fn unregister(&self, symbol: &str, id: u64) -> bool {
        let mut state = self.state.lock();
        let Some(slot) = state.symbols.get_mut(symbol) else {
            return false;
        };
        let before = slot.sinks.len();
        slot.sinks.retain(|(sink_id, _)| *sink_id != id);
        before != slot.sinks.len()
    }

    pub fn sink_count(&self, symbol: &str) -> usize {
        self.state
            .lock()
            .symbols
            .get(symbol)
            .map_or(0, |slot| slot.sinks.len())
    }

    /// Stage the message for the next flush. Returns `false` for kinds the
    /// dispatcher does not own.
    pub fn route(&self, message: &DecodedMessage) -> bool {
        self.route_at(message, Instant::now())
    }

    pub fn route_at(&self, message: &DecodedMessage, now: Instant) -> bool {
        match message {
            DecodedMessage::Trade { tick, .. } => {
                let price = PriceView {
                    symbol: tick.symbol.clone(),
                    price: tick.price,
                    change: tick.change,
                    direction: Direction::from_change(tick.change),
                };
                self.stage(&tick.symbol, now, Some(price), None, tick.volume);
                true
            }
            DecodedMessage::TickerUpdate { symbol, ticker, .. } => {
                let price = PriceView {
                    symbol: symbol.clone(),
                    price: ticker.last_price,
                    change: ticker.change_rate,
                    direction: Direction::from_change(ticker.change_rate),
                };
                self.stage(symbol, now, Some(price), None, ticker.volume_24h);
                true
            }
            DecodedMessage::OrderBook { book, .. } => {
                let rows = Arc::new(BookRows::build(book, self.config.book_depth));
                self.stage(&book.symbol, now, None, Some(rows), None);
                true
            }
            DecodedMessage::SymbolsInitial { .. } | DecodedMessage::Heartbeat { .. } => false,
        }
    }

    fn stage(
        &self,
        symbol: &str,
        now: Instant,
        price: Option<PriceView>,
        book: Option<Arc<BookRows>>,
        volume: Option<f64>,
    ) {
        let mut state = self.state.lock();
        let state = &mut *state;
        if !state.symbols.contains_key(symbol) {
            state.symbols.insert(symbol.to_string(), SymbolSlot::default());
        }
        let Some(slot) = state.symbols.get_mut(symbol) else {
            return;
        };
        slot.last_seen = Some(now);

        let volume_view = volume.map(|volume| {
            let spike = match slot.last_volume {
                Some(prev) if prev > 0.0 => (volume - prev) / prev > self.config.spike_threshold,
                _ => false,
            };
            slot.last_volume = Some(volume);
            VolumeView {
                symbol: symbol.to_string(),
                volume,
                text: format_volume(volume),
                spike,
            }
        });

        let mut highlight_started = false;
        if let Some(view) = &volume_view {
            // A running highlight is not extended by further spikes
            if view.spike && slot.highlight_until.is_none() {
                trace!(symbol = %symbol, volume = view.volume, "Volume spike");
                slot.highlight_until = Some(now + Duration::from_millis(self.config.highlight_ms));
                highlight_started = true;
            }
        }

        if slot.sinks.is_empty() {
            return;
        }
        if highlight_started {
            slot.pending.highlight = Some(true);
        }
        if price.is_some() {
            slot.pending.price = price;
        }
        if book.is_some() {
            slot.pending.book = book;
        }
        if volume_view.is_some() {
            slot.pending.volume = volume_view;
        }
        if !state.dirty.contains(symbol) {
            state.dirty.insert(symbol.to_string());
        }
    }

    /// Write staged values to sinks and clear expired highlights.
    ///
    /// Returns the number of sink writes performed.
    pub fn flush(&self, now: Instant) -> usize {
        let batch: Vec<(String, Vec<Arc<dyn UpdateSink>>, Pending)> = {
            let mut state = self.state.lock();
            let state = &mut *state;

            for (symbol, slot) in state.symbols.iter_mut() {
                if matches!(slot.highlight_until, Some(until) if until <= now) {
                    slot.highlight_until = None;
                    if !slot.sinks.is_empty() {
                        slot.pending.highlight = Some(false);
                        state.dirty.insert(symbol.clone());
                    }
                }
            }

            let dirty = std::mem::take(&mut state.dirty);
            dirty
                .into_iter()
                .filter_map(|symbol| {
                    let slot = state.symbols.get_mut(&symbol)?;
                    let pending = std::mem::take(&mut slot.pending);
                    if pending.is_empty() || slot.sinks.is_empty() {
                        return None;
                    }
                    let sinks = slot.sinks.iter().map(|(_, s)| Arc::clone(s)).collect();
                    Some((symbol, sinks, pending))
                })
                .collect()
        };

        let mut writes = 0;
        for (symbol, sinks, pending) in &batch {
            for sink in sinks {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    let mut n = 0;
                    if let Some(view) = &pending.price {
                        sink.price(view);
                        n += 1;
                    }
                    if let Some(rows) = &pending.book {
                        sink.book(rows);
                        n += 1;
                    }
                    if let Some(view) = &pending.volume {
                        sink.volume(view);
                        n += 1;
                    }
                    if let Some(on) = pending.highlight {
                        sink.highlight(symbol, on);
                        n += 1;
                    }
                    n
                }));
                match result {
                    Ok(n) => writes += n,
                    Err(_) => {
                        metrics::inc_callback_panic();
                        error!(symbol = %symbol, "Update sink panicked");
                    }
                }
            }
        }
        if writes > 0 {
            metrics::inc_sink_writes(writes);
        }
        writes
    }

    /// Symbols with no update within the ticker freshness window
    pub fn stale_symbols(&self, now: Instant) -> Vec<String> {
        let window = Duration::from_millis(self.config.ticker_freshness_ms);
        let state = self.state.lock();
        let mut stale: Vec<String> = state
            .symbols
            .iter()
            .filter(|(_, slot)| match slot.last_seen {
                Some(seen) => now.saturating_duration_since(seen) >= window,
                None => true,
            })
            .map(|(symbol, _)| symbol.clone())
            .collect();
        stale.sort();
        stale
    }

    pub fn last_seen(&self, symbol: &str) -> Option<Instant> {
        self.state.lock().symbols.get(symbol).and_then(|s| s.last_seen)
    }

    /// Flush once per frame interval until shutdown
    pub async fn run_frames(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.frame_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Dispatcher frame loop stopping");
                        break;
                    }
                }
                tick = ticker.tick() => {
                    self.flush(tick);
                }
            }
        }
    }

    /// Drop all sinks and staged values
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.symbols.clear();
        state.dirty.clear();
    }
}
