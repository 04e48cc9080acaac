//! Inbound frame decoding.
//!
//! A [`Decoder`] holds an ordered chain of [`DecodeStrategy`] implementations.
//! The first strategy that recognises a frame wins; a strategy that cannot
//! handle a frame returns `None` and the next one is tried. The default chain
//! is binary layout, flat-message fast path, then the full envelope parse.
//!
//! Decoding is pure and synchronous. Malformed frames yield `None` and the
//! caller drops them.

pub mod binary;
pub mod envelope;
pub mod fast;

use bytes::Bytes;

use crate::types::{DecodedMessage, SourceKey};

pub use binary::{BinaryFrameStrategy, BinaryTick};
pub use envelope::EnvelopeStrategy;
pub use fast::FastPathStrategy;

/// One frame as received from the transport
#[derive(Debug, Clone, PartialEq)]
pub enum RawFrame {
    Text(String),
    Binary(Bytes),
}

impl RawFrame {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(t) => t.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            Self::Binary(_) => None,
        }
    }

    /// Short lossy preview for logs
    pub fn preview(&self, max_chars: usize) -> String {
        match self {
            Self::Text(t) => t.chars().take(max_chars).collect(),
            Self::Binary(b) => format!("<{} binary bytes>", b.len()),
        }
    }
}

/// Text payload of a frame. JSON sent in binary frames is accepted when it is
/// valid UTF-8 and starts with an opening brace.
pub(crate) fn frame_text(frame: &RawFrame) -> Option<&str> {
    match frame {
        RawFrame::Text(t) => Some(t.as_str()),
        RawFrame::Binary(b) if b.first() == Some(&b'{') => std::str::from_utf8(b).ok(),
        RawFrame::Binary(_) => None,
    }
}

/// A candidate decoder in the chain
pub trait DecodeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Decode the frame, or `None` to let the next strategy try
    fn decode(&self, source: &SourceKey, frame: &RawFrame) -> Option<DecodedMessage>;
}

pub struct Decoder {
    strategies: Vec<Box<dyn DecodeStrategy>>,
}

impl Decoder {
    /// Default chain: binary, fast path, envelope
    pub fn new() -> Self {
        Self::with_strategies(vec![
            Box::new(BinaryFrameStrategy),
            Box::new(FastPathStrategy),
            Box::new(EnvelopeStrategy),
        ])
    }

    pub fn with_strategies(strategies: Vec<Box<dyn DecodeStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    #[inline]
    pub fn decode(&self, source: &SourceKey, frame: &RawFrame) -> Option<DecodedMessage> {
        self.strategies
            .iter()
            .find_map(|strategy| strategy.decode(source, frame))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
