//! Signaling wire message definitions.
//!
//! Every frame exchanged with the signaling server is one UTF-8 JSON object
//! of the shape `{type, call_id?, to, from?, payload?}`. The payload is kept
//! as raw JSON and extracted through the typed accessors below, so a frame
//! with an unexpected payload shape never fails to parse as a whole.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Message kinds for call control, tagged with their wire literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    /// Initial call offer sent to the callee. Carries the SDP offer.
    #[serde(rename = "call.invite")]
    CallInvite,

    /// Server acknowledgment of an invite; assigns the call identifier.
    #[serde(rename = "call.invite.ack")]
    CallInviteAck,

    /// Call accepted by the callee. Carries the SDP answer.
    #[serde(rename = "call.accept")]
    CallAccept,

    /// Call declined by the callee.
    #[serde(rename = "call.reject")]
    CallReject,

    /// Call hung up by either side.
    #[serde(rename = "call.end")]
    CallEnd,

    /// One ICE candidate for NAT traversal.
    #[serde(rename = "ice.candidate")]
    IceCandidate,

    /// Server- or peer-reported call failure. Payload may carry `{reason}`.
    #[serde(rename = "call.error")]
    CallError,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalKind::CallInvite => "call.invite",
            SignalKind::CallInviteAck => "call.invite.ack",
            SignalKind::CallAccept => "call.accept",
            SignalKind::CallReject => "call.reject",
            SignalKind::CallEnd => "call.end",
            SignalKind::IceCandidate => "ice.candidate",
            SignalKind::CallError => "call.error",
        };
        f.write_str(s)
    }
}

/// A session description as carried on the wire: `{type: offer|answer, sdp}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptionPayload {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// One ICE candidate as carried on the wire.
///
/// Field names follow the WebRTC `RTCIceCandidateInit` dictionary so both
/// ends can hand the payload straight to their media layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidatePayload {
    /// Identity under duplicate delivery: the candidate string plus its
    /// media-line identifiers.
    pub fn dedup_key(&self) -> (&str, Option<&str>, Option<u16>) {
        (
            self.candidate.as_str(),
            self.sdp_mid.as_deref(),
            self.sdp_mline_index,
        )
    }
}

/// One signaling frame.
///
/// `call_id` is absent on `call.invite` until the server assigns one in the
/// acknowledgment; handlers must tolerate its absence on every kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl SignalMessage {
    pub fn new(kind: SignalKind, to: impl Into<String>) -> Self {
        Self {
            kind,
            call_id: None,
            to: to.into(),
            from: None,
            payload: None,
        }
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        let call_id = call_id.into();
        if !call_id.is_empty() {
            self.call_id = Some(call_id);
        }
        self
    }

    pub fn with_description(mut self, description: &SessionDescriptionPayload) -> Self {
        self.payload = serde_json::to_value(description).ok();
        self
    }

    pub fn with_candidate(mut self, candidate: &IceCandidatePayload) -> Self {
        self.payload = serde_json::to_value(candidate).ok();
        self
    }

    /// Extracts the payload as a session description, validating that both
    /// `sdp` and `type` are present with the right types.
    pub fn session_description(&self) -> Option<SessionDescriptionPayload> {
        let payload = self.payload.as_ref()?;
        serde_json::from_value(payload.clone()).ok()
    }

    /// Extracts the payload as an ICE candidate.
    pub fn ice_candidate(&self) -> Option<IceCandidatePayload> {
        let payload = self.payload.as_ref()?;
        serde_json::from_value(payload.clone()).ok()
    }

    /// Extracts a `{reason}` string from a `call.error` payload.
    pub fn error_reason(&self) -> Option<String> {
        self.payload
            .as_ref()?
            .get("reason")
            .and_then(|r| r.as_str())
            .map(str::to_string)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invite_round_trip() {
        let offer = SessionDescriptionPayload {
            kind: SdpKind::Offer,
            sdp: "v=0\r\n".to_string(),
        };
        let msg =
            SignalMessage::new(SignalKind::CallInvite, "b@x.com").with_description(&offer);

        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"call.invite\""));
        assert!(json.contains("\"to\":\"b@x.com\""));
        // No call identifier exists yet on an invite.
        assert!(!json.contains("call_id"));

        let parsed = SignalMessage::from_json(&json).unwrap();
        assert_eq!(parsed.kind, SignalKind::CallInvite);
        assert_eq!(parsed.session_description(), Some(offer));
    }

    #[test]
    fn test_wire_tags_match_contract() {
        for (kind, tag) in [
            (SignalKind::CallInvite, "call.invite"),
            (SignalKind::CallInviteAck, "call.invite.ack"),
            (SignalKind::CallAccept, "call.accept"),
            (SignalKind::CallReject, "call.reject"),
            (SignalKind::CallEnd, "call.end"),
            (SignalKind::IceCandidate, "ice.candidate"),
            (SignalKind::CallError, "call.error"),
        ] {
            assert_eq!(serde_json::to_value(kind).unwrap(), tag);
        }
    }

    #[test]
    fn test_session_description_requires_both_fields() {
        let msg = SignalMessage {
            kind: SignalKind::CallInvite,
            call_id: None,
            to: "b@x.com".to_string(),
            from: Some("a@x.com".to_string()),
            payload: Some(serde_json::json!({ "sdp": "v=0" })),
        };
        assert!(msg.session_description().is_none());

        let msg = SignalMessage {
            payload: Some(serde_json::json!({ "type": "offer", "sdp": 42 })),
            ..msg
        };
        assert!(msg.session_description().is_none());
    }

    #[test]
    fn test_ice_candidate_media_line_fields_optional() {
        let json = r#"{"type":"ice.candidate","call_id":"c1","to":"b@x.com","payload":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host"}}"#;
        let parsed = SignalMessage::from_json(json).unwrap();
        let candidate = parsed.ice_candidate().unwrap();
        assert_eq!(candidate.sdp_mid, None);
        assert_eq!(candidate.sdp_mline_index, None);
    }

    #[test]
    fn test_candidate_wire_field_names() {
        let candidate = IceCandidatePayload {
            candidate: "candidate:1".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let msg = SignalMessage::new(SignalKind::IceCandidate, "b@x.com")
            .with_call_id("c1")
            .with_candidate(&candidate);
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"sdpMid\":\"0\""));
        assert!(json.contains("\"sdpMLineIndex\":0"));
    }

    #[test]
    fn test_error_reason_extraction() {
        let json = r#"{"type":"call.error","to":"a@x.com","payload":{"reason":"callee offline"}}"#;
        let parsed = SignalMessage::from_json(json).unwrap();
        assert_eq!(parsed.error_reason().as_deref(), Some("callee offline"));

        let json = r#"{"type":"call.error","to":"a@x.com"}"#;
        let parsed = SignalMessage::from_json(json).unwrap();
        assert_eq!(parsed.error_reason(), None);
    }

    #[test]
    fn test_empty_call_id_not_serialized() {
        let msg = SignalMessage::new(SignalKind::CallAccept, "a@x.com").with_call_id("");
        assert_eq!(msg.call_id, None);
    }
}
