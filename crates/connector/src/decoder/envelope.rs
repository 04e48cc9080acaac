//! General-purpose decode of the JSON message envelope.
//!
//! Upstreams disagree on field names and on whether numbers are sent as JSON
//! numbers or strings, so the wire structs accept both and normalize on the
//! way out.

use serde::{Deserialize, Deserializer};
use std::collections::HashMap;

use super::{frame_text, DecodeStrategy, RawFrame};
use crate::types::{
    BookLevel, DecodedMessage, HeartbeatKind, OrderBookUpdate, SourceKey, SymbolInfo, TickKind,
    TickerInfo, TradeTick,
};

/// Market label when the upstream does not send one
pub const DEFAULT_MARKET: &str = "spot";

/// A number that may arrive as a JSON number or a numeric string
#[derive(Debug, Clone, Copy, PartialEq)]
struct Lenient(f64);

impl<'de> Deserialize<'de> for Lenient {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum NumOrStr {
            Num(f64),
            Str(String),
        }

        match NumOrStr::deserialize(deserializer)? {
            NumOrStr::Num(n) => Ok(Lenient(n)),
            NumOrStr::Str(s) => match s.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => Ok(Lenient(n)),
                Ok(_) => Err(serde::de::Error::custom(format!("non-finite number: {}", s))),
                Err(e) => Err(serde::de::Error::custom(e)),
            },
        }
    }
}

fn lenient(value: Option<Lenient>) -> Option<f64> {
    value.map(|v| v.0)
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "sourceKey", default)]
    source_key: Option<String>,
    #[serde(default)]
    symbols: Option<Vec<SymbolEntry>>,
    #[serde(default)]
    tickers: Option<HashMap<String, TickerWire>>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    ticker: Option<TickerWire>,
    #[serde(default)]
    price: Option<Lenient>,
    #[serde(default)]
    change: Option<Lenient>,
    #[serde(default)]
    volume: Option<Lenient>,
    #[serde(default)]
    timestamp: Option<u64>,
    #[serde(default)]
    server_time: Option<u64>,
    #[serde(default)]
    bids: Option<Vec<LevelWire>>,
    #[serde(default)]
    asks: Option<Vec<LevelWire>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SymbolEntry {
    Name(String),
    Detailed(SymbolWire),
}

#[derive(Debug, Deserialize)]
struct SymbolWire {
    symbol: String,
    #[serde(default, alias = "marketType")]
    market: Option<String>,
    #[serde(default, alias = "lastPrice", alias = "last")]
    price: Option<Lenient>,
    #[serde(default)]
    change: Option<Lenient>,
    #[serde(default, alias = "change_percent", alias = "changeRate")]
    #[serde(rename = "changePercent")]
    change_percent: Option<Lenient>,
}

#[derive(Debug, Default, Deserialize)]
struct TickerWire {
    #[serde(default, alias = "lastPrice", alias = "last", alias = "close", alias = "trade_price")]
    last_price: Option<Lenient>,
    #[serde(default, alias = "high", alias = "high24h", alias = "high_price")]
    high_24h: Option<Lenient>,
    #[serde(default, alias = "low", alias = "low24h", alias = "low_price")]
    low_24h: Option<Lenient>,
    #[serde(default, alias = "changeRate", alias = "change24h", alias = "signed_change_rate")]
    change_rate: Option<Lenient>,
    #[serde(default, alias = "volume", alias = "baseVolume", alias = "acc_trade_volume_24h")]
    volume_24h: Option<Lenient>,
    #[serde(default, alias = "quoteVolume", alias = "acc_trade_price_24h")]
    quote_volume_24h: Option<Lenient>,
}

impl TickerWire {
    /// `None` when the upstream sent no usable last price
    fn normalize(self) -> Option<TickerInfo> {
        Some(TickerInfo {
            last_price: lenient(self.last_price)?,
            high_24h: lenient(self.high_24h),
            low_24h: lenient(self.low_24h),
            change_rate: lenient(self.change_rate),
            volume_24h: lenient(self.volume_24h),
            quote_volume_24h: lenient(self.quote_volume_24h),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LevelWire {
    Pair(Lenient, Lenient),
    Object {
        price: Lenient,
        #[serde(alias = "size", alias = "qty", alias = "amount")]
        quantity: Lenient,
    },
}

impl From<LevelWire> for BookLevel {
    fn from(level: LevelWire) -> Self {
        match level {
            LevelWire::Pair(price, quantity) | LevelWire::Object { price, quantity } => BookLevel {
                price: price.0,
                quantity: quantity.0,
            },
        }
    }
}

fn normalize_symbols(
    entries: Vec<SymbolEntry>,
    tickers: &HashMap<String, TickerInfo>,
) -> Vec<SymbolInfo> {
    entries
        .into_iter()
        .filter_map(|entry| {
            let wire = match entry {
                SymbolEntry::Name(symbol) => SymbolWire {
                    symbol,
                    market: None,
                    price: None,
                    change: None,
                    change_percent: None,
                },
                SymbolEntry::Detailed(wire) => wire,
            };
            if wire.symbol.is_empty() {
                return None;
            }
            let ticker = tickers.get(&wire.symbol);
            let last_price = lenient(wire.price)
                .or_else(|| ticker.map(|t| t.last_price))
                .unwrap_or(0.0);
            let change_percent = lenient(wire.change_percent)
                .or_else(|| ticker.and_then(|t| t.change_rate))
                .unwrap_or(0.0);
            Some(SymbolInfo {
                market: wire.market.unwrap_or_else(|| DEFAULT_MARKET.to_string()),
                last_price,
                change: lenient(wire.change).unwrap_or(0.0),
                change_percent,
                symbol: wire.symbol,
            })
        })
        .collect()
}

fn into_message(connection_source: &SourceKey, env: Envelope) -> Option<DecodedMessage> {
    let source = match env.source_key.as_deref() {
        Some(key) if !key.is_empty() => SourceKey::new(key),
        _ => connection_source.clone(),
    };
    let server_timestamp = env.server_time.or(env.timestamp).unwrap_or(0);

    match env.kind.as_str() {
        "symbols_initial" => {
            let tickers: HashMap<String, TickerInfo> = env
                .tickers
                .unwrap_or_default()
                .into_iter()
                .filter_map(|(symbol, wire)| wire.normalize().map(|t| (symbol, t)))
                .collect();
            let symbols = normalize_symbols(env.symbols.unwrap_or_default(), &tickers);
            Some(DecodedMessage::SymbolsInitial {
                source,
                server_timestamp,
                symbols,
                tickers,
            })
        }
        "ticker_update" => {
            let symbol = env.symbol.filter(|s| !s.is_empty())?;
            let ticker = env.ticker?.normalize()?;
            Some(DecodedMessage::TickerUpdate {
                source,
                server_timestamp,
                symbol,
                ticker,
            })
        }
        "ping" | "pong" => Some(DecodedMessage::Heartbeat {
            source,
            server_timestamp,
            kind: if env.kind == "ping" {
                HeartbeatKind::Ping
            } else {
                HeartbeatKind::Pong
            },
        }),
        "orderbook" | "depth" | "book" => {
            let symbol = env.symbol.filter(|s| !s.is_empty())?;
            let levels = |side: Option<Vec<LevelWire>>| -> Vec<BookLevel> {
                side.unwrap_or_default().into_iter().map(BookLevel::from).collect()
            };
            Some(DecodedMessage::OrderBook {
                source,
                server_timestamp,
                book: OrderBookUpdate {
                    symbol,
                    bids: levels(env.bids),
                    asks: levels(env.asks),
                },
            })
        }
        other => {
            let kind = TickKind::from_wire(other)?;
            let symbol = env.symbol.filter(|s| !s.is_empty())?;
            Some(DecodedMessage::Trade {
                source,
                server_timestamp,
                tick: TradeTick {
                    kind,
                    symbol,
                    price: lenient(env.price)?,
                    change: lenient(env.change),
                    volume: lenient(env.volume),
                },
            })
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SymbolListWire {
    Bare(Vec<SymbolEntry>),
    Wrapped {
        symbols: Vec<SymbolEntry>,
        #[serde(default)]
        tickers: HashMap<String, TickerWire>,
    },
}

/// Parse a symbol list body, either a bare array or `{"symbols": [...], "tickers": {...}}`
pub(crate) fn parse_symbol_list(body: &str) -> Result<Vec<SymbolInfo>, serde_json::Error> {
    let (entries, tickers) = match serde_json::from_str::<SymbolListWire>(body)? {
        SymbolListWire::Bare(entries) => (entries, HashMap::new()),
        SymbolListWire::Wrapped { symbols, tickers } => (symbols, tickers),
    };
    let tickers: HashMap<String, TickerInfo> = tickers
        .into_iter()
        .filter_map(|(symbol, wire)| wire.normalize().map(|t| (symbol, t)))
        .collect();
    Ok(normalize_symbols(entries, &tickers))
}

/// Decode a text payload through the full parser
pub fn decode_text(source: &SourceKey, text: &str) -> Option<DecodedMessage> {
    let env: Envelope = serde_json::from_str(text).ok()?;
    into_message(source, env)
}

/// Full structural parse of the JSON envelope
pub struct EnvelopeStrategy;

impl DecodeStrategy for EnvelopeStrategy {
    fn name(&self) -> &'static str {
        "envelope"
    }

    fn decode(&self, source: &SourceKey, frame: &RawFrame) -> Option<DecodedMessage> {
        decode_text(source, frame_text(frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SourceKey {
        SourceKey::new("bitget")
    }

    #[test]
    fn test_symbols_initial_normalized() {
        let text = r#"{
            "type": "symbols_initial",
            "sourceKey": "bitget",
            "server_time": 1700000000123,
            "symbols": [
                "BTCUSDT",
                {"symbol": "ETHUSDT", "marketType": "futures", "lastPrice": "3200.5", "change": 12, "changePercent": 0.4}
            ],
            "tickers": {
                "BTCUSDT": {"lastPr": "1", "last": "65000.5", "high24h": "66000", "changeRate": "-0.012"},
                "XRPUSDT": {"high": 1}
            }
        }"#;
        match decode_text(&source(), text) {
            Some(DecodedMessage::SymbolsInitial {
                symbols,
                tickers,
                server_timestamp,
                ..
            }) => {
                assert_eq!(server_timestamp, 1_700_000_000_123);
                assert_eq!(symbols.len(), 2);
                assert_eq!(symbols[0].symbol, "BTCUSDT");
                assert_eq!(symbols[0].market, DEFAULT_MARKET);
                assert_eq!(symbols[0].last_price, 65000.5);
                assert_eq!(symbols[0].change_percent, -0.012);
                assert_eq!(symbols[1].market, "futures");
                assert_eq!(symbols[1].last_price, 3200.5);
                assert_eq!(symbols[1].change, 12.0);
                // ticker without a last price is dropped
                assert_eq!(tickers.len(), 1);
                assert_eq!(tickers["BTCUSDT"].high_24h, Some(66000.0));
            }
            other => panic!("expected symbols_initial, got {:?}", other),
        }
    }

    #[test]
    fn test_ticker_update_requires_last_price() {
        let ok = r#"{"type":"ticker_update","symbol":"ETHUSDT","ticker":{"close":3200.5,"volume":"12.5"},"timestamp":7}"#;
        match decode_text(&source(), ok) {
            Some(DecodedMessage::TickerUpdate { symbol, ticker, server_timestamp, .. }) => {
                assert_eq!(symbol, "ETHUSDT");
                assert_eq!(ticker.last_price, 3200.5);
                assert_eq!(ticker.volume_24h, Some(12.5));
                assert_eq!(server_timestamp, 7);
            }
            other => panic!("expected ticker update, got {:?}", other),
        }

        let missing = r#"{"type":"ticker_update","symbol":"ETHUSDT","ticker":{"high":1}}"#;
        assert!(decode_text(&source(), missing).is_none());
    }

    #[test]
    fn test_trade_accepts_string_numbers() {
        let text = r#"{"type":"trade","symbol":"BTCUSDT","price":"65000.5","volume":"0.25"}"#;
        match decode_text(&source(), text) {
            Some(DecodedMessage::Trade { tick, .. }) => {
                assert_eq!(tick.price, 65000.5);
                assert_eq!(tick.volume, Some(0.25));
                assert_eq!(tick.change, None);
            }
            other => panic!("expected trade, got {:?}", other),
        }
    }

    #[test]
    fn test_non_finite_string_numbers_rejected() {
        for price in ["1e400", "-1e400", "NaN", "inf"] {
            let text = format!(r#"{{"type":"trade","symbol":"BTCUSDT","price":"{}"}}"#, price);
            assert!(decode_text(&source(), &text).is_none(), "{}", price);
        }
    }

    #[test]
    fn test_orderbook_levels_pairs_and_objects() {
        let text = r#"{"type":"depth","symbol":"BTCUSDT",
            "bids":[["65000.5","1.5"],[64999,2]],
            "asks":[{"price":65001,"size":"0.5"}]}"#;
        match decode_text(&source(), text) {
            Some(DecodedMessage::OrderBook { book, .. }) => {
                assert_eq!(book.bids.len(), 2);
                assert_eq!(book.bids[0], BookLevel { price: 65000.5, quantity: 1.5 });
                assert_eq!(book.asks[0], BookLevel { price: 65001.0, quantity: 0.5 });
            }
            other => panic!("expected orderbook, got {:?}", other),
        }
    }

    #[test]
    fn test_heartbeats() {
        assert!(matches!(
            decode_text(&source(), r#"{"type":"pong"}"#),
            Some(DecodedMessage::Heartbeat { kind: HeartbeatKind::Pong, .. })
        ));
    }

    #[test]
    fn test_empty_source_key_uses_connection_source() {
        let text = r#"{"type":"ping","sourceKey":""}"#;
        assert_eq!(decode_text(&source(), text).unwrap().source(), &source());
    }

    #[test]
    fn test_unknown_or_malformed() {
        for text in [
            r#"{"type":"candle","symbol":"X","price":1}"#,
            r#"{"symbol":"X","price":1}"#,
            r#"{"type":"trade","symbol":"X"}"#,
            r#"{"type":"trade","symbol":"X","price":"abc"}"#,
            r#"{"type":"ticker_update","ticker":{"last":1}}"#,
            "[]",
        ] {
            assert!(decode_text(&source(), text).is_none(), "{} should not decode", text);
        }
    }
}
