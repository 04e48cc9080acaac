//! Frame handling on the reader task: decode, then cache write and dispatch.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::cache::SymbolCache;
use crate::clock::{elapsed_ms, epoch_millis, now_tsc};
use crate::decoder::{Decoder, RawFrame};
use crate::dispatcher::Dispatcher;
use crate::endpoint::StreamTarget;
use crate::latency::LatencyAggregator;
use crate::metrics::StreamMetrics;
use crate::traits::{FrameAction, FrameHandler};
use crate::types::{DecodedMessage, HeartbeatKind, LatencyStage};

/// Reply to an application-level ping
pub const PONG: &str = r#"{"type":"pong"}"#;

const PREVIEW_CHARS: usize = 120;

pub struct FeedPipeline {
    decoder: Decoder,
    cache: SymbolCache,
    dispatcher: Arc<Dispatcher>,
    latency: LatencyAggregator,
    stream_metrics: DashMap<StreamTarget, StreamMetrics>,
}

impl FeedPipeline {
    pub fn new(
        decoder: Decoder,
        cache: SymbolCache,
        dispatcher: Arc<Dispatcher>,
        latency: LatencyAggregator,
    ) -> Self {
        Self {
            decoder,
            cache,
            dispatcher,
            latency,
            stream_metrics: DashMap::new(),
        }
    }

    fn metrics_for(&self, target: &StreamTarget) -> StreamMetrics {
        if let Some(m) = self.stream_metrics.get(target) {
            return m.clone();
        }
        self.stream_metrics
            .entry(target.clone())
            .or_insert_with(|| StreamMetrics::new(target))
            .clone()
    }

    fn record_round_trip(&self, server_timestamp: u64) {
        if server_timestamp == 0 {
            return;
        }
        let now = epoch_millis();
        if now >= server_timestamp {
            self.latency
                .record_sample(LatencyStage::RoundTrip, (now - server_timestamp) as f64);
        }
    }

    fn dispatch(&self, message: &DecodedMessage) {
        let start = now_tsc();
        if self.dispatcher.route(message) {
            self.latency
                .record_sample(LatencyStage::Dispatch, elapsed_ms(start, now_tsc()));
        }
    }

    /// Apply a decoded message. Returns the reply to send, if any.
    pub fn apply(&self, message: DecodedMessage) -> FrameAction {
        match message {
            DecodedMessage::SymbolsInitial {
                source,
                symbols,
                tickers,
                ..
            } => {
                let start = now_tsc();
                self.cache.apply_initial(&source, symbols, tickers);
                self.latency
                    .record_sample(LatencyStage::CacheWrite, elapsed_ms(start, now_tsc()));
            }
            DecodedMessage::TickerUpdate { .. } => {
                self.dispatch(&message);
                if let DecodedMessage::TickerUpdate {
                    source,
                    symbol,
                    ticker,
                    ..
                } = message
                {
                    let start = now_tsc();
                    self.cache.apply_ticker_update(&source, &symbol, ticker);
                    self.latency
                        .record_sample(LatencyStage::CacheWrite, elapsed_ms(start, now_tsc()));
                }
            }
            DecodedMessage::Trade { .. } | DecodedMessage::OrderBook { .. } => {
                self.dispatch(&message);
            }
            DecodedMessage::Heartbeat {
                kind: HeartbeatKind::Ping,
                ..
            } => return FrameAction::Reply(PONG.to_string()),
            DecodedMessage::Heartbeat { .. } => {}
        }
        FrameAction::Continue
    }
}

impl FrameHandler for FeedPipeline {
    fn handle(&self, target: &StreamTarget, frame: RawFrame, received_tsc: u64) -> FrameAction {
        let metrics = self.metrics_for(target);
        let Some(message) = self.decoder.decode(target.source(), &frame) else {
            metrics.inc_decode_failure();
            debug!(
                stream = %target,
                len = frame.len(),
                preview = %frame.preview(PREVIEW_CHARS),
                "Dropping undecodable frame"
            );
            return FrameAction::Continue;
        };
        self.latency
            .record_sample(LatencyStage::Decode, elapsed_ms(received_tsc, now_tsc()));
        metrics.inc_frame(message.kind_label());
        trace!(stream = %target, kind = message.kind_label(), "Decoded frame");

        self.record_round_trip(message.server_timestamp());
        self.apply(message)
    }
}
