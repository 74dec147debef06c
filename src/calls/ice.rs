//! Buffering for not-yet-deliverable ICE candidates.
//!
//! Candidates arrive from two independent sources with no cross-stream
//! ordering: the local media layer may produce candidates before the server
//! has assigned a call identifier to address them with, and the peer may
//! deliver candidates before a remote session description has been applied
//! (applying a candidate first is rejected by the media layer). Each
//! direction gets its own FIFO buffer, drained exactly when it becomes
//! deliverable.

use crate::message::IceCandidatePayload;
use log::{debug, warn};
use std::sync::Arc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;

#[derive(Default)]
pub struct CandidateBuffer {
    pending_local: Vec<IceCandidatePayload>,
    pending_remote: Vec<IceCandidatePayload>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a locally generated candidate until a call identifier and peer
    /// exist to address it.
    pub fn enqueue_local(&mut self, candidate: IceCandidatePayload) {
        self.pending_local.push(candidate);
    }

    /// Hands over every buffered local candidate, in generation order, and
    /// clears the buffer. The caller sends them tagged with the now-known
    /// call identifier; call once per transition into an addressable state.
    pub fn take_local(&mut self) -> Vec<IceCandidatePayload> {
        std::mem::take(&mut self.pending_local)
    }

    /// Queues a remote candidate until a remote description exists.
    /// Idempotent under duplicate delivery: a candidate with an identical
    /// (candidate, sdpMid, sdpMLineIndex) triple is queued only once.
    pub fn enqueue_remote(&mut self, candidate: IceCandidatePayload) {
        let duplicate = self
            .pending_remote
            .iter()
            .any(|queued| queued.dedup_key() == candidate.dedup_key());
        if duplicate {
            debug!("Ignoring duplicate queued ICE candidate");
            return;
        }
        self.pending_remote.push(candidate);
    }

    /// Applies every buffered remote candidate to the peer connection in
    /// arrival order. A candidate that fails to apply is logged and skipped
    /// (ICE tolerates individual losses); the buffer is cleared either way.
    pub async fn drain_remote(&mut self, pc: &Arc<RTCPeerConnection>) {
        let pending = std::mem::take(&mut self.pending_remote);
        if pending.is_empty() {
            return;
        }
        debug!("Applying {} queued remote ICE candidates", pending.len());
        for candidate in pending {
            if let Err(e) = pc.add_ice_candidate(candidate_init(&candidate)).await {
                warn!("Failed to add queued ICE candidate: {e}");
            }
        }
    }

    /// Drops all buffered candidates in both directions. Called whenever the
    /// peer connection is torn down.
    pub fn clear(&mut self) {
        self.pending_local.clear();
        self.pending_remote.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pending_local.is_empty() && self.pending_remote.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn pending_remote(&self) -> &[IceCandidatePayload] {
        &self.pending_remote
    }
}

/// Maps a wire candidate onto the media layer's candidate dictionary.
pub fn candidate_init(candidate: &IceCandidatePayload) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate.clone(),
        sdp_mid: candidate.sdp_mid.clone(),
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidatePayload {
        IceCandidatePayload {
            candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 500{n} typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    #[test]
    fn test_local_candidates_flush_in_order_once() {
        let mut buffer = CandidateBuffer::new();
        buffer.enqueue_local(candidate(1));
        buffer.enqueue_local(candidate(2));
        buffer.enqueue_local(candidate(3));

        let flushed = buffer.take_local();
        assert_eq!(flushed.len(), 3);
        for (i, c) in flushed.iter().enumerate() {
            assert!(c.candidate.starts_with(&format!("candidate:{}", i + 1)));
        }

        // A second flush has nothing left to emit.
        assert!(buffer.take_local().is_empty());
    }

    #[test]
    fn test_remote_duplicates_queued_once() {
        let mut buffer = CandidateBuffer::new();
        buffer.enqueue_remote(candidate(1));
        buffer.enqueue_remote(candidate(1));
        buffer.enqueue_remote(candidate(2));

        assert_eq!(buffer.pending_remote().len(), 2);
    }

    #[test]
    fn test_same_candidate_different_media_line_is_not_a_duplicate() {
        let mut buffer = CandidateBuffer::new();
        let mut other_line = candidate(1);
        other_line.sdp_mid = Some("1".to_string());
        other_line.sdp_mline_index = Some(1);

        buffer.enqueue_remote(candidate(1));
        buffer.enqueue_remote(other_line);

        assert_eq!(buffer.pending_remote().len(), 2);
    }

    #[test]
    fn test_clear_empties_both_directions() {
        let mut buffer = CandidateBuffer::new();
        buffer.enqueue_local(candidate(1));
        buffer.enqueue_remote(candidate(2));
        assert!(!buffer.is_empty());

        buffer.clear();
        assert!(buffer.is_empty());
    }
}
