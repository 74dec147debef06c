pub mod auth;
pub mod calls;
pub mod client;
pub mod config;
pub mod message;
pub mod transport;

pub use auth::{CredentialSource, StaticCredentials};
pub use calls::{CallError, CallEvent, CallManager, CallSession, CallStatus};
pub use client::{ConnectionState, SendOutcome, SignalingClient, SignalingError, SignalingEvent};
pub use config::ClientConfig;
pub use message::{SignalKind, SignalMessage};
