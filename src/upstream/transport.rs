//! Message transport seam for upstream connections
//!
//! The client only needs "send a text frame" and "give me the next text
//! frame"; everything WebSocket specific lives in `WsTransport`.

use crate::error::{RelayError, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::trace;

/// An open, message-oriented connection
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next text frame. `None` once the peer closed the stream.
    ///
    /// `Err(ProtocolDecode)` is a bad frame on a live stream; any other error
    /// means the stream is dead.
    async fn next_text(&mut self) -> Option<Result<String>>;
}

/// Opens transports; one call per connect attempt
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Box<dyn Transport>>;
}

/// Connector for `ws://` and `wss://` URIs
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, uri: &str) -> Result<Box<dyn Transport>> {
        let (stream, response) = connect_async(uri).await?;
        trace!(status = %response.status(), "WebSocket handshake complete");
        Ok(Box::new(WsTransport { stream }))
    }
}

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn next_text(&mut self) -> Option<Result<String>> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(String::from_utf8(bytes).map_err(|e| {
                        RelayError::ProtocolDecode(format!("binary frame is not UTF-8: {}", e))
                    }))
                }
                Ok(Message::Close(frame)) => {
                    trace!(?frame, "Upstream sent close");
                    return None;
                }
                // Pongs are queued by tungstenite itself
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
        None
    }
}
