use std::time::Duration;

/// Public STUN servers used for NAT traversal. No TURN by default.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Flat delay between reconnect attempts after an unintended close.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(3000);

/// Maximum number of outbound messages buffered while disconnected.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 50;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// WebSocket endpoint of the signaling server. The bearer token is
    /// appended as a `token` query parameter at connect time.
    pub signaling_url: String,
    pub stun_servers: Vec<String>,
    pub reconnect_delay: Duration,
    pub outbound_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: "wss://api.voicelink.app/api/v1/ws".to_string(),
            stun_servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            reconnect_delay: RECONNECT_DELAY,
            outbound_queue_capacity: OUTBOUND_QUEUE_CAPACITY,
        }
    }
}
