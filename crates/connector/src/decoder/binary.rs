//! Fixed-layout binary frames.
//!
//! ```text
//! u8 type | u8 symbol_len | symbol[symbol_len] | f64 price | f32 change | u64 timestamp
//! ```
//! All numeric fields are little-endian. Trailing bytes after the timestamp are
//! ignored; a buffer shorter than the layout is rejected.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{DecodeStrategy, RawFrame};
use crate::types::{DecodedMessage, HeartbeatKind, SourceKey, TickKind, TickerInfo, TradeTick};

pub const TAG_TRADE: u8 = 1;
pub const TAG_TICKER: u8 = 2;
pub const TAG_PING: u8 = 3;

/// Bytes of the layout excluding the symbol
pub const FIXED_LEN: usize = 1 + 1 + 8 + 4 + 8;

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryTick {
    pub tag: u8,
    pub symbol: String,
    pub price: f64,
    pub change: f32,
    pub timestamp: u64,
}

impl BinaryTick {
    /// Encode into the fixed layout. `None` if the symbol exceeds 255 bytes.
    pub fn encode(&self) -> Option<Bytes> {
        let symbol_len = u8::try_from(self.symbol.len()).ok()?;
        let mut buf = BytesMut::with_capacity(FIXED_LEN + self.symbol.len());
        buf.put_u8(self.tag);
        buf.put_u8(symbol_len);
        buf.put_slice(self.symbol.as_bytes());
        buf.put_f64_le(self.price);
        buf.put_f32_le(self.change);
        buf.put_u64_le(self.timestamp);
        Some(buf.freeze())
    }

    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < FIXED_LEN {
            return None;
        }
        let tag = buf.get_u8();
        let symbol_len = buf.get_u8() as usize;
        if symbol_len == 0 || buf.remaining() < symbol_len + 8 + 4 + 8 {
            return None;
        }
        let symbol = std::str::from_utf8(&buf[..symbol_len]).ok()?.to_string();
        buf.advance(symbol_len);
        let price = buf.get_f64_le();
        let change = buf.get_f32_le();
        let timestamp = buf.get_u64_le();
        if !price.is_finite() || !change.is_finite() {
            return None;
        }
        Some(Self {
            tag,
            symbol,
            price,
            change,
            timestamp,
        })
    }

    /// Map onto the shared message shape. Unknown tags yield `None`.
    pub fn into_message(self, source: &SourceKey) -> Option<DecodedMessage> {
        let source = source.clone();
        let server_timestamp = self.timestamp;
        match self.tag {
            TAG_TRADE => Some(DecodedMessage::Trade {
                source,
                server_timestamp,
                tick: TradeTick {
                    kind: TickKind::Trade,
                    symbol: self.symbol,
                    price: self.price,
                    change: Some(f64::from(self.change)),
                    volume: None,
                },
            }),
            TAG_TICKER => Some(DecodedMessage::TickerUpdate {
                source,
                server_timestamp,
                symbol: self.symbol,
                ticker: TickerInfo {
                    last_price: self.price,
                    change_rate: Some(f64::from(self.change)),
                    ..Default::default()
                },
            }),
            TAG_PING => Some(DecodedMessage::Heartbeat {
                source,
                server_timestamp,
                kind: HeartbeatKind::Ping,
            }),
            _ => None,
        }
    }
}

pub struct BinaryFrameStrategy;

impl DecodeStrategy for BinaryFrameStrategy {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn decode(&self, source: &SourceKey, frame: &RawFrame) -> Option<DecodedMessage> {
        match frame {
            RawFrame::Binary(bytes) => BinaryTick::decode(bytes)?.into_message(source),
            RawFrame::Text(_) => None,
        }
    }
}
