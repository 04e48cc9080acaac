use async_trait::async_trait;

use crate::decoder::RawFrame;
use crate::endpoint::StreamTarget;
use crate::error::{ConnectorError, FetchError};
use crate::types::{SourceKey, SymbolInfo};

/// Opens streaming sessions (WebSocket in production, scripted in tests)
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Open a session to the given endpoint URL
    async fn open(&self, url: &str) -> Result<Box<dyn StreamSession>, ConnectorError>;
}

/// One open streaming session. Owned by a single reader task.
#[async_trait]
pub trait StreamSession: Send {
    /// Next data frame. `None` once the peer has closed the session.
    ///
    /// Transport-level keepalive (ping/pong control frames) is handled inside
    /// the session and never surfaces here.
    async fn recv(&mut self) -> Option<Result<RawFrame, ConnectorError>>;

    /// Send a text frame
    async fn send_text(&mut self, text: String) -> Result<(), ConnectorError>;

    /// Close the session gracefully
    async fn close(&mut self) -> Result<(), ConnectorError>;
}

/// What the reader task should do after a frame has been handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameAction {
    Continue,
    /// Send this text back on the same connection
    Reply(String),
}

/// Consumes frames on the reader task. Must not block.
pub trait FrameHandler: Send + Sync {
    fn handle(&self, target: &StreamTarget, frame: RawFrame, received_tsc: u64) -> FrameAction;
}

/// Out-of-band symbol list source used when the stream is slow to deliver
#[async_trait]
pub trait SymbolFetcher: Send + Sync {
    async fn fetch_symbols(&self, source: &SourceKey) -> Result<Vec<SymbolInfo>, FetchError>;
}
