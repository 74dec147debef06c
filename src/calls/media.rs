//! Media negotiation.
//!
//! [`MediaSession`] owns the one live peer connection, the local capture
//! feed, the remote track slot, and both ICE candidate buffers. The call
//! engine drives it through the operations below; media-layer callbacks are
//! funneled back to the engine as [`MediaEvent`]s so every state decision
//! happens in one place.

use super::capture::{AudioCapture, CaptureHandle};
use super::error::CallError;
use super::ice::{CandidateBuffer, candidate_init};
use crate::message::{IceCandidatePayload, SdpKind, SessionDescriptionPayload};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

/// Events surfaced by the media layer to the call engine.
#[derive(Clone)]
pub enum MediaEvent {
    /// The local agent gathered a candidate for the peer.
    LocalCandidate(IceCandidatePayload),
    /// The peer's audio arrived.
    RemoteTrack(Arc<TrackRemote>),
    /// The transport reached failed/disconnected/closed. This is the only
    /// path that ends a call without a signaling message.
    ConnectionFailed(RTCPeerConnectionState),
}

pub struct MediaSession {
    stun_servers: Vec<String>,
    peer_connection: Mutex<Option<Arc<RTCPeerConnection>>>,
    local_track: Mutex<Option<Arc<TrackLocalStaticSample>>>,
    capture_handle: Mutex<Option<CaptureHandle>>,
    remote_track: Arc<Mutex<Option<Arc<TrackRemote>>>>,
    candidates: Mutex<CandidateBuffer>,
}

impl MediaSession {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self {
            stun_servers,
            peer_connection: Mutex::new(None),
            local_track: Mutex::new(None),
            capture_handle: Mutex::new(None),
            remote_track: Arc::new(Mutex::new(None)),
            candidates: Mutex::new(CandidateBuffer::new()),
        }
    }

    /// Builds the peer connection for a new call and registers the three
    /// media callbacks. Any previous connection is torn down first.
    pub async fn create_peer_connection(
        &self,
        events: mpsc::Sender<MediaEvent>,
    ) -> Result<Arc<RTCPeerConnection>, CallError> {
        if self.peer_connection.lock().await.is_some() {
            warn!("Peer connection already exists, tearing down the old one");
            self.teardown().await;
        }

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.stun_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);

        let candidate_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let payload = IceCandidatePayload {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        };
                        let _ = candidate_tx.send(MediaEvent::LocalCandidate(payload)).await;
                    }
                    Err(e) => warn!("Failed to serialize local ICE candidate: {e}"),
                }
            })
        }));

        let track_tx = events.clone();
        let remote_slot = self.remote_track.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let track_tx = track_tx.clone();
            let remote_slot = remote_slot.clone();
            Box::pin(async move {
                info!(
                    "Remote track arrived: {} ({})",
                    track.id(),
                    track.codec().capability.mime_type
                );
                *remote_slot.lock().await = Some(track.clone());
                let _ = track_tx.send(MediaEvent::RemoteTrack(track)).await;
            })
        }));

        let state_tx = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let state_tx = state_tx.clone();
            Box::pin(async move {
                debug!("Peer connection state: {state}");
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Closed
                ) {
                    let _ = state_tx.send(MediaEvent::ConnectionFailed(state)).await;
                }
            })
        }));

        *self.peer_connection.lock().await = Some(pc.clone());
        Ok(pc)
    }

    /// Creates the local audio track, attaches it to the peer connection,
    /// and starts the capture feed.
    pub async fn acquire_local_audio(
        &self,
        capture: &Arc<dyn AudioCapture>,
    ) -> Result<(), CallError> {
        let pc = self.require_peer_connection().await?;

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 1,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            "audio".to_owned(),
            "voicelink".to_owned(),
        ));

        pc.add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let handle = capture.start(track.clone()).await?;

        *self.local_track.lock().await = Some(track);
        *self.capture_handle.lock().await = Some(handle);
        Ok(())
    }

    /// Audio-only offer: creates a local description, applies it, and
    /// returns its wire form.
    pub async fn create_offer(&self) -> Result<SessionDescriptionPayload, CallError> {
        let pc = self.require_peer_connection().await?;
        let offer = pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        pc.set_local_description(offer).await?;
        Ok(SessionDescriptionPayload {
            kind: SdpKind::Offer,
            sdp,
        })
    }

    /// Audio-only answer to the applied remote offer.
    pub async fn create_answer(&self) -> Result<SessionDescriptionPayload, CallError> {
        let pc = self.require_peer_connection().await?;
        let answer = pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        pc.set_local_description(answer).await?;
        Ok(SessionDescriptionPayload {
            kind: SdpKind::Answer,
            sdp,
        })
    }

    /// Applies the peer's session description.
    pub async fn apply_remote_description(
        &self,
        payload: &SessionDescriptionPayload,
    ) -> Result<(), CallError> {
        let pc = self.require_peer_connection().await?;
        let description = match payload.kind {
            SdpKind::Offer => RTCSessionDescription::offer(payload.sdp.clone())?,
            SdpKind::Answer => RTCSessionDescription::answer(payload.sdp.clone())?,
        };
        pc.set_remote_description(description).await?;
        Ok(())
    }

    pub async fn has_remote_description(&self) -> bool {
        match self.peer_connection.lock().await.as_ref() {
            Some(pc) => pc.remote_description().await.is_some(),
            None => false,
        }
    }

    /// Applies a remote candidate immediately when a remote description
    /// exists, otherwise buffers it. Application failures are logged and
    /// swallowed; ICE tolerates individual candidate loss.
    pub async fn apply_or_buffer_remote_candidate(&self, candidate: IceCandidatePayload) {
        let pc = self.peer_connection.lock().await.clone();
        match pc {
            Some(pc) if pc.remote_description().await.is_some() => {
                if let Err(e) = pc.add_ice_candidate(candidate_init(&candidate)).await {
                    warn!("Failed to add ICE candidate: {e}");
                }
            }
            _ => {
                self.candidates.lock().await.enqueue_remote(candidate);
            }
        }
    }

    /// Applies every buffered remote candidate, in arrival order. Called
    /// right after a remote description is set.
    pub async fn drain_remote_candidates(&self) {
        let pc = self.peer_connection.lock().await.clone();
        if let Some(pc) = pc {
            self.candidates.lock().await.drain_remote(&pc).await;
        }
    }

    /// Buffers a locally gathered candidate until the call is addressable.
    pub async fn buffer_local_candidate(&self, candidate: IceCandidatePayload) {
        self.candidates.lock().await.enqueue_local(candidate);
    }

    /// Hands over the buffered local candidates for sending; empties the
    /// buffer.
    pub async fn take_local_candidates(&self) -> Vec<IceCandidatePayload> {
        self.candidates.lock().await.take_local()
    }

    /// The peer's audio track, once it has arrived.
    pub async fn remote_track(&self) -> Option<Arc<TrackRemote>> {
        self.remote_track.lock().await.clone()
    }

    /// Releases every media resource, in dependency order: callbacks first
    /// (so closing the connection cannot re-enter the engine), then the
    /// connection, the capture feed, both stream handles, and both candidate
    /// buffers. Safe to call when nothing is allocated, and safe to call
    /// twice.
    pub async fn teardown(&self) {
        if let Some(pc) = self.peer_connection.lock().await.take() {
            pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
            pc.on_track(Box::new(|_, _, _| Box::pin(async {})));
            pc.on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
            if let Err(e) = pc.close().await {
                warn!("Error closing peer connection: {e}");
            }
        }

        if let Some(handle) = self.capture_handle.lock().await.take() {
            handle.stop();
        }
        *self.local_track.lock().await = None;
        *self.remote_track.lock().await = None;
        self.candidates.lock().await.clear();
    }

    pub async fn has_peer_connection(&self) -> bool {
        self.peer_connection.lock().await.is_some()
    }

    async fn require_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, CallError> {
        self.peer_connection
            .lock()
            .await
            .clone()
            .ok_or_else(|| CallError::Negotiation("no peer connection".to_string()))
    }

    #[cfg(test)]
    pub(crate) async fn candidate_buffers_empty(&self) -> bool {
        self.candidates.lock().await.is_empty()
    }
}
