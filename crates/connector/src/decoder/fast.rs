//! Pattern-based extraction for flat trade/price messages.
//!
//! Only single-level objects are accepted: no nested objects or arrays, no
//! escape sequences, and every recognised key at most once. Anything else is
//! left for the envelope parser, so both paths agree on every frame this one
//! accepts.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{frame_text, DecodeStrategy, RawFrame};
use crate::types::{DecodedMessage, SourceKey, TickKind, TradeTick};

/// Shortest flat message worth trying: `{"type":"tick","symbol":"X","price":1}`
const MIN_LEN: usize = 24;

/// Keys whose presence means the message is not a flat tick
const NESTED_MARKERS: [&str; 5] = [
    "\"symbols\"",
    "\"tickers\"",
    "\"ticker\"",
    "\"bids\"",
    "\"asks\"",
];

fn field_pattern(key: &str) -> Regex {
    Regex::new(&format!(r#""{}"\s*:\s*("[^"\\]*"|[^,}}\s]+)"#, key))
        .expect("static field pattern")
}

static TYPE: Lazy<Regex> = Lazy::new(|| field_pattern("type"));
static SYMBOL: Lazy<Regex> = Lazy::new(|| field_pattern("symbol"));
static SOURCE_KEY: Lazy<Regex> = Lazy::new(|| field_pattern("sourceKey"));
static PRICE: Lazy<Regex> = Lazy::new(|| field_pattern("price"));
static CHANGE: Lazy<Regex> = Lazy::new(|| field_pattern("change"));
static VOLUME: Lazy<Regex> = Lazy::new(|| field_pattern("volume"));
static TIMESTAMP: Lazy<Regex> = Lazy::new(|| field_pattern("timestamp"));
static SERVER_TIME: Lazy<Regex> = Lazy::new(|| field_pattern("server_time"));

static NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^-?(0|[1-9][0-9]*)(\.[0-9]+)?([eE][+-]?[0-9]+)?$").expect("static number pattern")
});

/// Raw value token for a key.
///
/// `Ok(None)` when the key is absent, `Err(())` when it repeats.
fn token<'a>(re: &Regex, text: &'a str) -> Result<Option<&'a str>, ()> {
    let mut matches = re.captures_iter(text);
    let first = match matches.next() {
        Some(caps) => caps.get(1).map(|m| m.as_str()),
        None => return Ok(None),
    };
    if matches.next().is_some() {
        return Err(());
    }
    Ok(first)
}

fn string_field<'a>(re: &Regex, text: &'a str) -> Result<Option<&'a str>, ()> {
    match token(re, text)? {
        None => Ok(None),
        Some(tok) if tok.len() >= 2 && tok.starts_with('"') && tok.ends_with('"') => {
            Ok(Some(&tok[1..tok.len() - 1]))
        }
        Some(_) => Err(()),
    }
}

fn number_field(re: &Regex, text: &str) -> Result<Option<f64>, ()> {
    match token(re, text)? {
        None | Some("null") => Ok(None),
        Some(tok) if NUMBER.is_match(tok) => match tok.parse::<f64>() {
            // serde_json rejects out-of-range numbers; leave those to it
            Ok(value) if value.is_finite() => Ok(Some(value)),
            _ => Err(()),
        },
        Some(_) => Err(()),
    }
}

fn integer_field(re: &Regex, text: &str) -> Result<Option<u64>, ()> {
    match token(re, text)? {
        None | Some("null") => Ok(None),
        Some(tok) => tok.parse::<u64>().map(Some).map_err(|_| ()),
    }
}

fn looks_flat(text: &str) -> bool {
    if text.len() < MIN_LEN || !text.starts_with('{') || !text.ends_with('}') {
        return false;
    }
    let body = &text[1..];
    if body.contains(['{', '[', '\\']) {
        return false;
    }
    if !text.contains("\"price\"") {
        return false;
    }
    !NESTED_MARKERS.iter().any(|marker| text.contains(marker))
}

fn extract(source: &SourceKey, text: &str) -> Result<Option<DecodedMessage>, ()> {
    let kind = match string_field(&TYPE, text)?.and_then(TickKind::from_wire) {
        Some(kind) => kind,
        None => return Ok(None),
    };
    let symbol = match string_field(&SYMBOL, text)? {
        Some(symbol) if !symbol.is_empty() => symbol.to_string(),
        _ => return Ok(None),
    };
    let price = match number_field(&PRICE, text)? {
        Some(price) => price,
        None => return Ok(None),
    };
    let change = number_field(&CHANGE, text)?;
    let volume = number_field(&VOLUME, text)?;

    let server_time = integer_field(&SERVER_TIME, text)?;
    let timestamp = integer_field(&TIMESTAMP, text)?;
    let server_timestamp = server_time.or(timestamp).unwrap_or(0);

    let source = match string_field(&SOURCE_KEY, text)? {
        Some(key) if !key.is_empty() => SourceKey::new(key),
        _ => source.clone(),
    };

    Ok(Some(DecodedMessage::Trade {
        source,
        server_timestamp,
        tick: TradeTick {
            kind,
            symbol,
            price,
            change,
            volume,
        },
    }))
}

/// Regex fast path for flat trade and price frames
pub struct FastPathStrategy;

impl DecodeStrategy for FastPathStrategy {
    fn name(&self) -> &'static str {
        "fast_path"
    }

    fn decode(&self, source: &SourceKey, frame: &RawFrame) -> Option<DecodedMessage> {
        let text = frame_text(frame)?.trim();
        if !looks_flat(text) {
            return None;
        }
        extract(source, text).ok().flatten()
    }
}
