/// Tokio-based WebSocket transport implementation for voicelink
///
/// This crate provides a concrete implementation of the Transport trait
/// using tokio-tungstenite. Signaling frames are UTF-8 JSON text messages.
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// An event produced by the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport has successfully connected.
    Connected,
    /// A text frame has been received from the server.
    FrameReceived(String),
    /// The connection was lost. Carries the close code and reason when the
    /// server sent a close frame; `None` on abrupt loss.
    Disconnected {
        code: Option<u16>,
        reason: Option<String>,
    },
}

/// Represents an active network connection to the signaling server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a text frame to the server.
    async fn send_frame(&self, frame: &str) -> Result<(), anyhow::Error>;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
///
/// The URL carries per-session state (the auth token as a query parameter),
/// so it is an argument rather than a compile-time constant.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Creates a new transport and returns it, along with a stream of events.
    async fn create_transport(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

/// Tokio-based WebSocket transport
pub struct TokioWebSocketTransport {
    ws_sink: Arc<Mutex<Option<WsSink>>>,
}

impl TokioWebSocketTransport {
    fn new(sink: WsSink) -> Self {
        Self {
            ws_sink: Arc::new(Mutex::new(Some(sink))),
        }
    }
}

#[async_trait]
impl Transport for TokioWebSocketTransport {
    async fn send_frame(&self, frame: &str) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Socket is closed"))?;

        debug!("--> Sending frame: {} bytes", frame.len());
        sink.send(Message::Text(frame.to_string().into()))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {}", e))?;
        Ok(())
    }

    async fn disconnect(&self) {
        let mut sink_guard = self.ws_sink.lock().await;
        if let Some(mut sink) = sink_guard.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
    }
}

/// Factory for creating Tokio WebSocket transports
#[derive(Default)]
pub struct TokioWebSocketTransportFactory;

impl TokioWebSocketTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for TokioWebSocketTransportFactory {
    async fn create_transport(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        debug!("Dialing signaling endpoint");
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;

        let (sink, stream) = ws.split();

        let (event_tx, event_rx) = mpsc::channel(100);

        let transport = Arc::new(TokioWebSocketTransport::new(sink));

        let event_tx_clone = event_tx.clone();
        tokio::task::spawn(read_pump(stream, event_tx_clone));

        let _ = event_tx.send(TransportEvent::Connected).await;

        Ok((transport, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    let mut close_info: (Option<u16>, Option<String>) = (None, None);

    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                trace!("<-- Received text frame: {} bytes", text.len());
                if event_tx
                    .send(TransportEvent::FrameReceived(text.to_string()))
                    .await
                    .is_err()
                {
                    warn!("Event receiver dropped, closing read pump");
                    break;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                trace!("Received close frame: {:?}", frame);
                if let Some(frame) = frame {
                    close_info = (
                        Some(frame.code.into()),
                        Some(frame.reason.to_string()).filter(|r| !r.is_empty()),
                    );
                }
                break;
            }
            // Binary frames are not part of the signaling protocol; pings and
            // pongs are handled by tungstenite itself.
            Some(Ok(other)) => {
                trace!("Ignoring non-text frame: {:?}", other);
            }
            Some(Err(e)) => {
                error!("Error reading from websocket: {e}");
                break;
            }
            None => {
                trace!("Websocket stream ended");
                break;
            }
        }
    }

    let (code, reason) = close_info;
    let _ = event_tx
        .send(TransportEvent::Disconnected { code, reason })
        .await;
}
