//! Call-related error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("not signed in")]
    NotAuthenticated,

    #[error("another call is already in progress")]
    CallInProgress,

    #[error("no call to act on")]
    NoActiveCall,

    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("audio capture failed: {0}")]
    Capture(String),

    #[error("invalid call request: {0}")]
    InvalidPayload(&'static str),

    #[error("media negotiation failed: {0}")]
    Negotiation(String),

    #[error("signaling error: {0}")]
    Signaling(#[from] crate::client::SignalingError),

    #[error("call attempt was superseded")]
    Superseded,
}

impl From<webrtc::Error> for CallError {
    fn from(e: webrtc::Error) -> Self {
        CallError::Negotiation(e.to_string())
    }
}
