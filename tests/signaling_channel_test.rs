//! Signaling channel behavior over a scripted transport: queueing while
//! disconnected, FIFO drain on open, requeue-and-reconnect on a mid-drain
//! failure, and the flat reconnect delay.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc;
use voicelink::transport::{Transport, TransportEvent, TransportFactory};
use voicelink::{
    ClientConfig, SendOutcome, SignalKind, SignalMessage, SignalingClient, StaticCredentials,
};

/// One scripted connection: records sent frames, optionally failing every
/// send to exercise the flush-failure path.
struct ScriptedTransport {
    sent: Arc<StdMutex<Vec<String>>>,
    failing: bool,
    events: mpsc::Sender<TransportEvent>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send_frame(&self, frame: &str) -> Result<(), anyhow::Error> {
        if self.failing || self.closed.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("send failed"));
        }
        self.sent.lock().unwrap().push(frame.to_string());
        Ok(())
    }

    async fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self
                .events
                .send(TransportEvent::Disconnected {
                    code: None,
                    reason: None,
                })
                .await;
        }
    }
}

/// Creates one transport per connection attempt. The first
/// `failing_connections` transports reject every send.
struct ScriptedFactory {
    connections: Arc<StdMutex<Vec<Arc<StdMutex<Vec<String>>>>>>,
    connect_count: Arc<AtomicUsize>,
    failing_connections: usize,
}

impl ScriptedFactory {
    fn new(failing_connections: usize) -> Self {
        Self {
            connections: Arc::new(StdMutex::new(Vec::new())),
            connect_count: Arc::new(AtomicUsize::new(0)),
            failing_connections,
        }
    }

    fn frames_of(&self, connection: usize) -> Vec<SignalMessage> {
        self.connections.lock().unwrap()[connection]
            .lock()
            .unwrap()
            .iter()
            .map(|frame| SignalMessage::from_json(frame).unwrap())
            .collect()
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    async fn create_transport(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        assert!(url.contains("token="), "bearer token missing from URL");

        let attempt = self.connect_count.fetch_add(1, Ordering::SeqCst);
        let sent = Arc::new(StdMutex::new(Vec::new()));
        self.connections.lock().unwrap().push(sent.clone());

        let (tx, rx) = mpsc::channel(64);
        let transport = Arc::new(ScriptedTransport {
            sent,
            failing: attempt < self.failing_connections,
            events: tx.clone(),
            closed: AtomicBool::new(false),
        });
        let _ = tx.send(TransportEvent::Connected).await;
        Ok((transport, rx))
    }
}

fn test_config() -> ClientConfig {
    ClientConfig {
        reconnect_delay: Duration::from_millis(50),
        ..Default::default()
    }
}

fn message(n: usize) -> SignalMessage {
    SignalMessage::new(SignalKind::CallEnd, format!("peer-{n}@x.com")).with_call_id(format!("c{n}"))
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_messages_queued_offline_drain_in_order_on_open() {
    let factory = ScriptedFactory::new(0);
    let connections = factory.connections.clone();
    let (client, mut events) = SignalingClient::new(
        test_config(),
        StaticCredentials::logged_in("a@x.com", "token-a"),
        Arc::new(factory),
    );

    for n in 0..5 {
        let outcome = client.send(message(n)).await.unwrap();
        assert_eq!(outcome, SendOutcome::Queued);
    }

    client.connect();
    wait_until(|| {
        connections
            .lock()
            .unwrap()
            .first()
            .is_some_and(|sent| sent.lock().unwrap().len() == 5)
    })
    .await;

    let frames: Vec<SignalMessage> = connections.lock().unwrap()[0]
        .lock()
        .unwrap()
        .iter()
        .map(|f| SignalMessage::from_json(f).unwrap())
        .collect();
    for (n, frame) in frames.iter().enumerate() {
        assert_eq!(frame.to, format!("peer-{n}@x.com"));
    }

    // The channel reported Open before flushing.
    let mut saw_open = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, voicelink::SignalingEvent::Open) {
            saw_open = true;
        }
    }
    assert!(saw_open);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_51st_send_fails_and_first_50_survive_in_order() {
    let factory = ScriptedFactory::new(0);
    let connect_count = factory.connect_count.clone();
    let factory = Arc::new(factory);
    let (client, _events) = SignalingClient::new(
        test_config(),
        StaticCredentials::logged_in("a@x.com", "token-a"),
        factory.clone(),
    );

    for n in 0..50 {
        client.send(message(n)).await.unwrap();
    }
    let err = client.send(message(50)).await.unwrap_err();
    assert!(err.to_string().contains("overflow"));

    client.connect();
    wait_until(|| connect_count.load(Ordering::SeqCst) >= 1).await;
    wait_until(|| factory.frames_of(0).len() == 50).await;

    let frames = factory.frames_of(0);
    for (n, frame) in frames.iter().enumerate() {
        assert_eq!(frame.call_id.as_deref(), Some(format!("c{n}").as_str()));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_flush_failure_requeues_and_recovers_on_reconnect() {
    // First connection rejects every send; the drain must requeue and force
    // a reconnect, after which everything goes out in the original order.
    let factory = Arc::new(ScriptedFactory::new(1));
    let connect_count = factory.connect_count.clone();
    let (client, _events) = SignalingClient::new(
        test_config(),
        StaticCredentials::logged_in("a@x.com", "token-a"),
        factory.clone(),
    );

    for n in 0..3 {
        client.send(message(n)).await.unwrap();
    }

    client.connect();
    wait_until(|| connect_count.load(Ordering::SeqCst) >= 2).await;
    wait_until(|| factory.frames_of(1).len() == 3).await;

    assert!(factory.frames_of(0).is_empty());
    let frames = factory.frames_of(1);
    for (n, frame) in frames.iter().enumerate() {
        assert_eq!(frame.to, format!("peer-{n}@x.com"));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_stops_reconnecting() {
    let factory = Arc::new(ScriptedFactory::new(0));
    let connect_count = factory.connect_count.clone();
    let (client, _events) = SignalingClient::new(
        test_config(),
        StaticCredentials::logged_in("a@x.com", "token-a"),
        factory.clone(),
    );

    client.connect();
    wait_until(|| connect_count.load(Ordering::SeqCst) == 1).await;

    client.disconnect().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // No further connection attempts after an intentional disconnect.
    assert_eq!(connect_count.load(Ordering::SeqCst), 1);
}
