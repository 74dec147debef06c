//! Call session state.

use crate::message::SessionDescriptionPayload;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Externally observable status of the call engine.
///
/// Exactly one call may be pending or in progress at a time; the engine
/// rejects a second concurrent call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// No call activity.
    #[default]
    Idle,
    /// Outgoing call being set up or ringing at the peer.
    Connecting,
    /// A remote invite is ringing locally.
    Incoming,
    /// Media negotiation finished, call is live.
    InCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// One pending or in-progress call.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    /// Server-assigned identifier. Empty until the invite is acknowledged.
    pub call_id: String,
    /// The peer's email address.
    pub peer: String,
    pub direction: CallDirection,
    /// The peer's offer, held until the call is accepted locally.
    pub offer: Option<SessionDescriptionPayload>,
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new_outgoing(call_id: impl Into<String>, peer: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            peer: peer.into(),
            direction: CallDirection::Outgoing,
            offer: None,
            created_at: Utc::now(),
        }
    }

    pub fn new_incoming(
        call_id: impl Into<String>,
        peer: impl Into<String>,
        offer: SessionDescriptionPayload,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            peer: peer.into(),
            direction: CallDirection::Incoming,
            offer: Some(offer),
            created_at: Utc::now(),
        }
    }

    /// Whether the session can address wire messages: a call identifier has
    /// been assigned by the server.
    pub fn is_addressable(&self) -> bool {
        !self.call_id.is_empty()
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == CallDirection::Outgoing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SdpKind;

    fn offer() -> SessionDescriptionPayload {
        SessionDescriptionPayload {
            kind: SdpKind::Offer,
            sdp: "v=0\r\n".to_string(),
        }
    }

    #[test]
    fn test_outgoing_session_starts_unaddressable() {
        let session = CallSession::new_outgoing("", "b@x.com");
        assert!(session.is_outgoing());
        assert!(!session.is_addressable());
        assert!(session.offer.is_none());
    }

    #[test]
    fn test_incoming_session_stores_offer_verbatim() {
        let session = CallSession::new_incoming("c1", "a@x.com", offer());
        assert_eq!(session.direction, CallDirection::Incoming);
        assert!(session.is_addressable());
        assert_eq!(session.offer, Some(offer()));
    }

    #[test]
    fn test_status_default_is_idle() {
        assert_eq!(CallStatus::default(), CallStatus::Idle);
    }
}
