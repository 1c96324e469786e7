//! Socket seam between the session and the network.
//!
//! The session never touches `tokio-tungstenite` directly. It asks a
//! [`Connector`] for a [`Transport`] per channel, which lets tests replace
//! the network with scripted in-memory sockets.
//!
//! Close codes follow RFC 6455: `1000` is a deliberate close, anything else
//! is abnormal. A stream that ends without a close frame is reported as
//! [`CLOSE_ABNORMAL`]; a close frame without a code as [`CLOSE_NO_STATUS`].

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::CollabError;

/// Deliberate teardown.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close frame carried no status code.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// What a transport yields when read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    Closed(u16),
}

/// One open socket.
#[async_trait]
pub trait Transport: Send {
    /// Send one text frame.
    async fn send(&mut self, frame: String) -> Result<(), CollabError>;

    /// Next inbound event. `None` means the stream ended with no close frame.
    async fn recv(&mut self) -> Option<Result<TransportEvent, CollabError>>;

    /// Close with the given code.
    async fn close(&mut self, code: u16) -> Result<(), CollabError>;
}

/// Opens transports. One call per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, CollabError>;
}

// ───────────────────────────────────────────────────────────────────
// tokio-tungstenite implementation
// ───────────────────────────────────────────────────────────────────

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`Connector`] backed by `tokio_tungstenite::connect_async`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, CollabError> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| CollabError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        log::debug!("WebSocket open: {url}");
        let (writer, reader) = stream.split();
        Ok(Box::new(WsTransport { writer, reader }))
    }
}

/// A live WebSocket connection.
pub struct WsTransport {
    writer: SplitSink<WsStream, Message>,
    reader: SplitStream<WsStream>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: String) -> Result<(), CollabError> {
        self.writer
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| CollabError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<TransportEvent, CollabError>> {
        loop {
            let msg = match self.reader.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(CollabError::Transport(e.to_string()))),
            };
            match msg {
                Message::Text(text) => return Some(Ok(TransportEvent::Text(text.as_str().to_owned()))),
                Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Some(Ok(TransportEvent::Text(text))),
                    Err(_) => log::debug!("Dropping non-UTF-8 binary frame ({} bytes)", data.len()),
                },
                Message::Close(frame) => {
                    let code = frame.map_or(CLOSE_NO_STATUS, |f| u16::from(f.code));
                    return Some(Ok(TransportEvent::Closed(code)));
                }
                // Ping/pong are answered by tungstenite itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self, code: u16) -> Result<(), CollabError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        self.writer
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| CollabError::Transport(e.to_string()))
    }
}
