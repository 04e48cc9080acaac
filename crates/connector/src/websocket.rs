//! WebSocket transport over tokio-tungstenite

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::decoder::RawFrame;
use crate::error::ConnectorError;
use crate::traits::{StreamSession, StreamTransport};

/// Sessions with no inbound traffic for this long are treated as dead
pub const READ_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct WsTransport {
    read_timeout: Duration,
}

impl WsTransport {
    pub fn new() -> Self {
        Self {
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
        }
    }

    pub fn with_read_timeout(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamTransport for WsTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn StreamSession>, ConnectorError> {
        info!(url = %url, "Connecting WebSocket");
        let (ws, response) = connect_async(url)
            .await
            .map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))?;
        info!(url = %url, status = ?response.status(), "WebSocket connected");
        Ok(Box::new(WsSession {
            ws,
            read_timeout: self.read_timeout,
        }))
    }
}

pub struct WsSession {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    read_timeout: Duration,
}

#[async_trait]
impl StreamSession for WsSession {
    async fn recv(&mut self) -> Option<Result<RawFrame, ConnectorError>> {
        loop {
            let next = match tokio::time::timeout(self.read_timeout, self.ws.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(
                        timeout_secs = self.read_timeout.as_secs(),
                        "WebSocket read timeout"
                    );
                    return Some(Err(ConnectorError::Disconnected(format!(
                        "read timeout after {} seconds",
                        self.read_timeout.as_secs()
                    ))));
                }
            };

            match next {
                Some(Ok(Message::Text(text))) => return Some(Ok(RawFrame::Text(text))),
                Some(Ok(Message::Binary(data))) => return Some(Ok(RawFrame::Binary(Bytes::from(data)))),
                Some(Ok(Message::Ping(data))) => {
                    trace!("Received WS ping, sending pong");
                    if let Err(e) = self.ws.send(Message::Pong(data)).await {
                        return Some(Err(ConnectorError::SendFailed(e.to_string())));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(frame = ?frame, "WebSocket closed by peer");
                    return None;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(Err(ConnectorError::Disconnected(e.to_string()))),
                None => return None,
            }
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), ConnectorError> {
        debug!(len = text.len(), "Sending text frame");
        self.ws
            .send(Message::Text(text))
            .await
            .map_err(|e| ConnectorError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), ConnectorError> {
        self.ws
            .close(None)
            .await
            .map_err(|e| ConnectorError::Disconnected(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_read_timeout() {
        let transport = WsTransport::default();
        assert_eq!(transport.read_timeout, Duration::from_secs(READ_TIMEOUT_SECS));
    }

    #[tokio::test]
    async fn test_open_unreachable_host_fails() {
        let transport = WsTransport::new();
        let result = transport.open("ws://127.0.0.1:1/ws/symbols/bitget").await;
        assert!(matches!(result, Err(ConnectorError::ConnectionFailed(_))));
    }
}
