//! Transport abstraction for the realtime channel.
//!
//! The channel owns the reconnect state machine; the transport only knows
//! how to open one connection and move text frames. Production uses
//! WebSockets, tests inject a scripted in-memory transport.

use anyhow::Context;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// What a live connection can report
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A text frame arrived
    Text(String),
    /// The peer or the network closed the connection
    Closed { reason: String },
}

/// One live connection
#[async_trait]
pub trait TransportConnection: Send {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()>;
    /// Next event; `None` once the stream is exhausted.
    async fn recv(&mut self) -> Option<TransportEvent>;
    async fn close(&mut self);
}

/// Connection factory
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> anyhow::Result<Box<dyn TransportConnection>>;
}

/// WebSocket transport over tokio-tungstenite
pub struct WsTransport {
    auth_token: Option<String>,
}

impl WsTransport {
    pub fn new(auth_token: Option<String>) -> Self {
        Self { auth_token }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &str) -> anyhow::Result<Box<dyn TransportConnection>> {
        let mut request = url
            .into_client_request()
            .context("Failed to build websocket request")?;

        // Attach Authorization header (harmless if the server ignores it).
        if let Some(token) = &self.auth_token {
            if let Ok(hv) = format!("Bearer {}", token).parse() {
                request.headers_mut().insert("Authorization", hv);
            }
        }

        let ws_config = WebSocketConfig {
            max_message_size: Some(16 * 1024 * 1024),
            max_frame_size: Some(4 * 1024 * 1024),
            accept_unmasked_frames: false,
            ..Default::default()
        };

        let (ws_stream, response) = connect_async_with_config(request, Some(ws_config), false)
            .await
            .context("Failed to connect to WebSocket")?;

        debug!("websocket connected (status: {})", response.status());

        Ok(Box::new(WsConnection { ws: ws_stream }))
    }
}

struct WsConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TransportConnection for WsConnection {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
        self.ws
            .send(Message::Text(text))
            .await
            .context("websocket send failed")
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Some(TransportEvent::Text(text)),
                Some(Ok(Message::Binary(data))) => {
                    warn!("unexpected binary message: {} bytes", data.len());
                }
                // Frame-level ping/pong; tungstenite queues the pong reply
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "closed by server".into());
                    return Some(TransportEvent::Closed { reason });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Some(TransportEvent::Closed {
                        reason: e.to_string(),
                    })
                }
                None => return None,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}
