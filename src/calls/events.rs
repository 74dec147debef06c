//! User-facing call events.
//!
//! The engine publishes on typed broadcast channels; the UI layer subscribes
//! and renders. Lagged or absent subscribers never block the engine.

use super::state::CallStatus;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use webrtc::track::track_remote::TrackRemote;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

#[derive(Clone)]
pub enum CallEvent {
    /// The observable status changed.
    StatusChanged(CallStatus),
    /// A remote invite is ringing; `peer` is the caller's email.
    IncomingCall { peer: String },
    /// The peer's audio stream is available for playback.
    RemoteAudio(Arc<TrackRemote>),
    /// The peer declined the call.
    Rejected { peer: String },
    /// The call ended (remote hangup, transport failure, or signaling loss).
    Ended { peer: Option<String> },
    /// A call attempt or an in-progress call failed; `reason` is
    /// user-presentable.
    Failed { reason: String },
    /// The peer or server sent something out of contract.
    ProtocolError { reason: String },
    /// Microphone permission was denied.
    PermissionDenied,
    /// A signaling message could not be sent or queued.
    SignalingUnavailable,
}

impl fmt::Debug for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StatusChanged(status) => f.debug_tuple("StatusChanged").field(status).finish(),
            Self::IncomingCall { peer } => {
                f.debug_struct("IncomingCall").field("peer", peer).finish()
            }
            // The track handle has no useful textual form.
            Self::RemoteAudio(_) => f.write_str("RemoteAudio(..)"),
            Self::Rejected { peer } => f.debug_struct("Rejected").field("peer", peer).finish(),
            Self::Ended { peer } => f.debug_struct("Ended").field("peer", peer).finish(),
            Self::Failed { reason } => f.debug_struct("Failed").field("reason", reason).finish(),
            Self::ProtocolError { reason } => f
                .debug_struct("ProtocolError")
                .field("reason", reason)
                .finish(),
            Self::PermissionDenied => f.write_str("PermissionDenied"),
            Self::SignalingUnavailable => f.write_str("SignalingUnavailable"),
        }
    }
}

/// Typed event bus with one broadcast channel per concern.
#[derive(Debug)]
pub struct EventBus {
    pub call: broadcast::Sender<Arc<CallEvent>>,
    /// Mirrors whether the signaling channel is currently open, for
    /// connectivity banners.
    pub connectivity: broadcast::Sender<bool>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            call: broadcast::channel(CHANNEL_CAPACITY).0,
            connectivity: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn dispatch(&self, event: CallEvent) {
        // Nobody listening is fine; events are advisory.
        let _ = self.call.send(Arc::new(event));
    }

    pub fn set_connectivity(&self, ready: bool) {
        let _ = self.connectivity.send(ready);
    }

    pub fn subscribe_calls(&self) -> broadcast::Receiver<Arc<CallEvent>> {
        self.call.subscribe()
    }

    pub fn subscribe_connectivity(&self) -> broadcast::Receiver<bool> {
        self.connectivity.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
