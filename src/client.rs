//! Signaling channel management.
//!
//! [`SignalingClient`] owns the one logical connection to the signaling
//! server: it authenticates with the current bearer token, parses inbound
//! frames, buffers outbound messages while disconnected, and reconnects with
//! a flat delay after every unintended close until told to stop.

use crate::auth::CredentialSource;
use crate::config::ClientConfig;
use crate::message::SignalMessage;
use crate::transport::{TransportEvent, TransportFactory};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, mpsc};

/// Connection lifecycle of the signaling channel. Owned exclusively by the
/// client's supervisor task; never set by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
}

/// Result of a successful [`SignalingClient::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The message was serialized and transmitted immediately.
    Sent,
    /// The channel is not open; the message was appended to the outbound
    /// queue and will be flushed when the connection recovers.
    Queued,
}

/// Events published by the signaling channel.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Open,
    Close {
        code: Option<u16>,
        reason: Option<String>,
    },
    Message(SignalMessage),
    /// A non-fatal channel error: a malformed inbound frame or a failed
    /// connection attempt. The connection itself is governed by `Close`.
    Error(String),
}

#[derive(Debug, Error)]
pub enum SignalingError {
    /// The outbound queue is full. Unlike every other failure this one is
    /// surfaced synchronously so the call site can tell the user instead of
    /// silently dropping the message.
    #[error("outbound queue overflow (capacity {0})")]
    QueueFull(usize),

    #[error("failed to serialize signaling message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("transport send failed: {0}")]
    Transport(anyhow::Error),
}

pub struct SignalingClient {
    config: ClientConfig,
    credentials: Arc<dyn CredentialSource>,
    transport_factory: Arc<dyn TransportFactory>,

    state: Mutex<ConnectionState>,
    transport: Mutex<Option<Arc<dyn crate::transport::Transport>>>,
    outbound_queue: Mutex<VecDeque<SignalMessage>>,

    should_reconnect: AtomicBool,
    is_running: AtomicBool,
    /// Wakes the supervisor out of its reconnect sleep on `disconnect()`.
    shutdown_notify: Notify,

    event_tx: mpsc::Sender<SignalingEvent>,
}

impl SignalingClient {
    pub fn new(
        config: ClientConfig,
        credentials: Arc<dyn CredentialSource>,
        transport_factory: Arc<dyn TransportFactory>,
    ) -> (Arc<Self>, mpsc::Receiver<SignalingEvent>) {
        let (event_tx, event_rx) = mpsc::channel(100);
        let client = Arc::new(Self {
            config,
            credentials,
            transport_factory,
            state: Mutex::new(ConnectionState::Disconnected),
            transport: Mutex::new(None),
            outbound_queue: Mutex::new(VecDeque::new()),
            should_reconnect: AtomicBool::new(false),
            is_running: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            event_tx,
        });
        (client, event_rx)
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    pub async fn is_open(&self) -> bool {
        self.state().await == ConnectionState::Open
    }

    /// Starts the connection supervisor. Idempotent: a second call while the
    /// supervisor is alive is a no-op.
    pub fn connect(self: &Arc<Self>) {
        self.should_reconnect.store(true, Ordering::SeqCst);
        if self.is_running.swap(true, Ordering::SeqCst) {
            debug!("Signaling client already running, connect() is a no-op");
            return;
        }
        let client = self.clone();
        tokio::spawn(async move {
            client.run_loop().await;
        });
    }

    /// Stops the channel: no further reconnects, the active transport is
    /// closed, and all queued outbound messages are discarded (they are not
    /// meaningful after an intentional disconnect).
    pub async fn disconnect(&self) {
        self.should_reconnect.store(false, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();

        if let Some(transport) = self.transport.lock().await.take() {
            transport.disconnect().await;
        }
        self.outbound_queue.lock().await.clear();
        *self.state.lock().await = ConnectionState::Disconnected;
        info!("Signaling client disconnected");
    }

    /// Sends a message, or queues it while the channel is not open.
    ///
    /// A queued send while fully disconnected restarts the supervisor, so a
    /// message written during an outage comes back with the connection.
    pub async fn send(
        self: &Arc<Self>,
        message: SignalMessage,
    ) -> Result<SendOutcome, SignalingError> {
        let state = self.state().await;
        if state == ConnectionState::Open {
            let transport = self.transport.lock().await.clone();
            if let Some(transport) = transport {
                let frame = message.to_json()?;
                debug!("--> {} to {}", message.kind, message.to);
                return transport
                    .send_frame(&frame)
                    .await
                    .map(|_| SendOutcome::Sent)
                    .map_err(SignalingError::Transport);
            }
        }

        {
            let mut queue = self.outbound_queue.lock().await;
            if queue.len() >= self.config.outbound_queue_capacity {
                return Err(SignalingError::QueueFull(
                    self.config.outbound_queue_capacity,
                ));
            }
            debug!(
                "Signaling channel not open, queued {} ({} pending)",
                message.kind,
                queue.len() + 1
            );
            queue.push_back(message);
        }

        if self.should_reconnect.load(Ordering::SeqCst) {
            // Lazily restart the supervisor if it has stopped.
            self.connect();
        }
        Ok(SendOutcome::Queued)
    }

    async fn run_loop(self: Arc<Self>) {
        let _guard = scopeguard::guard((), |_| {
            self.is_running.store(false, Ordering::SeqCst);
        });

        while self.should_reconnect.load(Ordering::SeqCst) {
            *self.state.lock().await = ConnectionState::Connecting;

            let Some(token) = self.credentials.token() else {
                warn!("No auth token available, signaling channel stays closed");
                *self.state.lock().await = ConnectionState::Disconnected;
                self.emit(SignalingEvent::Close {
                    code: None,
                    reason: Some("not authenticated".to_string()),
                })
                .await;
                return;
            };

            let url = format!(
                "{}?token={}",
                self.config.signaling_url,
                urlencoding::encode(&token)
            );

            match self.transport_factory.create_transport(&url).await {
                Ok((transport, events)) => {
                    *self.transport.lock().await = Some(transport.clone());
                    // disconnect() may have raced the connection attempt; a
                    // transport that lands after the stop flag is closed on
                    // arrival.
                    if !self.should_reconnect.load(Ordering::SeqCst) {
                        transport.disconnect().await;
                    }
                    let close = self.pump_events(events).await;

                    *self.transport.lock().await = None;
                    *self.state.lock().await = ConnectionState::Disconnected;
                    let (code, reason) = close;
                    self.emit(SignalingEvent::Close { code, reason }).await;
                }
                Err(e) => {
                    warn!("Signaling connect failed: {e}");
                    *self.state.lock().await = ConnectionState::Disconnected;
                    self.emit(SignalingEvent::Error(format!("connect failed: {e}")))
                        .await;
                    self.emit(SignalingEvent::Close {
                        code: None,
                        reason: Some("connect failed".to_string()),
                    })
                    .await;
                }
            }

            if !self.should_reconnect.load(Ordering::SeqCst) {
                break;
            }

            debug!(
                "Reconnecting signaling channel in {:?}",
                self.config.reconnect_delay
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = self.shutdown_notify.notified() => {}
            }
        }

        info!("Signaling supervisor stopped");
    }

    /// Forwards transport events until the connection is lost. Returns the
    /// close code/reason to report.
    async fn pump_events(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<TransportEvent>,
    ) -> (Option<u16>, Option<String>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Connected => {
                    info!("Signaling channel open");
                    *self.state.lock().await = ConnectionState::Open;
                    self.emit(SignalingEvent::Open).await;
                    self.drain_outbound_queue().await;
                }
                TransportEvent::FrameReceived(frame) => match SignalMessage::from_json(&frame) {
                    Ok(message) => {
                        debug!(
                            "<-- {} (call_id: {})",
                            message.kind,
                            message.call_id.as_deref().unwrap_or("-")
                        );
                        self.emit(SignalingEvent::Message(message)).await;
                    }
                    Err(e) => {
                        warn!("Malformed signaling frame: {e}");
                        self.emit(SignalingEvent::Error(format!("malformed frame: {e}")))
                            .await;
                    }
                },
                TransportEvent::Disconnected { code, reason } => {
                    return (code, reason);
                }
            }
        }
        (None, None)
    }

    /// Flushes queued messages strictly in insertion order. If one fails to
    /// transmit it is put back at the front, the ones behind it never left
    /// the queue, and the transport is closed to trigger reconnection.
    async fn drain_outbound_queue(self: &Arc<Self>) {
        loop {
            let Some(message) = self.outbound_queue.lock().await.pop_front() else {
                return;
            };

            let frame = match message.to_json() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Dropping unserializable queued message: {e}");
                    continue;
                }
            };

            let transport = self.transport.lock().await.clone();
            let Some(transport) = transport else {
                self.outbound_queue.lock().await.push_front(message);
                return;
            };

            if let Err(e) = transport.send_frame(&frame).await {
                warn!("Failed to flush queued signaling message: {e}");
                self.outbound_queue.lock().await.push_front(message);
                transport.disconnect().await;
                return;
            }
            debug!("--> flushed queued {}", message.kind);
        }
    }

    async fn emit(&self, event: SignalingEvent) {
        if self.event_tx.send(event).await.is_err() {
            warn!("Signaling event receiver dropped");
        }
    }

    #[cfg(test)]
    pub(crate) async fn queued_messages(&self) -> Vec<SignalMessage> {
        self.outbound_queue.lock().await.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentials;
    use crate::message::SignalKind;
    use crate::transport::mock::MockTransportFactory;

    fn make_client() -> (Arc<SignalingClient>, mpsc::Receiver<SignalingEvent>) {
        SignalingClient::new(
            ClientConfig::default(),
            StaticCredentials::logged_in("a@x.com", "token"),
            Arc::new(MockTransportFactory::new()),
        )
    }

    #[tokio::test]
    async fn test_send_while_disconnected_queues_in_order() {
        let (client, _events) = make_client();

        for i in 0..5 {
            let outcome = client
                .send(SignalMessage::new(SignalKind::CallEnd, format!("{i}@x.com")))
                .await
                .unwrap();
            assert_eq!(outcome, SendOutcome::Queued);
        }

        let queued = client.queued_messages().await;
        assert_eq!(queued.len(), 5);
        for (i, message) in queued.iter().enumerate() {
            assert_eq!(message.to, format!("{i}@x.com"));
        }
    }

    #[tokio::test]
    async fn test_queue_overflow_is_a_distinct_error() {
        let (client, _events) = make_client();

        for _ in 0..50 {
            client
                .send(SignalMessage::new(SignalKind::CallEnd, "b@x.com"))
                .await
                .unwrap();
        }

        let err = client
            .send(SignalMessage::new(SignalKind::CallEnd, "b@x.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::QueueFull(50)));

        // The first 50 are still queued, in order and untouched.
        assert_eq!(client.queued_messages().await.len(), 50);
    }

    #[tokio::test]
    async fn test_disconnect_discards_queue() {
        let (client, _events) = make_client();

        client
            .send(SignalMessage::new(SignalKind::CallEnd, "b@x.com"))
            .await
            .unwrap();
        client.disconnect().await;

        assert!(client.queued_messages().await.is_empty());
        assert_eq!(client.state().await, ConnectionState::Disconnected);
    }
}
