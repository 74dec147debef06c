//! Call orchestration.
//!
//! [`CallManager`] owns the call status, the single [`CallSession`], and the
//! pending outgoing target. It is the only writer of that state: inbound
//! signaling messages, media-layer events, and local user actions all funnel
//! through it, and every cross-component effect goes through the documented
//! operations of [`MediaSession`] and [`SignalingClient`].
//!
//! User flows suspend at permission and negotiation awaits while other
//! events keep being processed, so a flow never assumes state survived an
//! await: the `epoch` counter is bumped by every teardown and each flow
//! re-checks it after suspension points, aborting as superseded when a
//! concurrent reject/end/disconnect won the race.

use super::capture::{AudioCapability, AudioCapture};
use super::error::CallError;
use super::events::{CallEvent, EventBus};
use super::media::{MediaEvent, MediaSession};
use super::state::{CallSession, CallStatus};
use crate::auth::CredentialSource;
use crate::client::{SendOutcome, SignalingClient, SignalingEvent};
use crate::config::ClientConfig;
use crate::message::{SessionDescriptionPayload, SignalKind, SignalMessage};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

/// State owned exclusively by the manager.
#[derive(Default)]
struct CallCore {
    status: CallStatus,
    session: Option<CallSession>,
    /// Outgoing target remembered between `call.invite` and its ack, before
    /// a call identifier exists.
    pending_target: Option<String>,
    /// Bumped by every teardown; in-flight flows compare against it after
    /// each suspension point.
    epoch: u64,
}

pub struct CallManager {
    signaling: Arc<SignalingClient>,
    credentials: Arc<dyn CredentialSource>,
    permission_gate: Arc<dyn AudioCapability>,
    capture: Arc<dyn AudioCapture>,
    media: MediaSession,
    events: EventBus,

    core: Mutex<CallCore>,
    /// Serializes media-stack construction between user flows; event
    /// handlers never take it.
    media_flow: Mutex<()>,

    media_tx: mpsc::Sender<MediaEvent>,
    media_rx: Mutex<Option<mpsc::Receiver<MediaEvent>>>,
}

impl CallManager {
    pub fn new(
        config: &ClientConfig,
        signaling: Arc<SignalingClient>,
        credentials: Arc<dyn CredentialSource>,
        permission_gate: Arc<dyn AudioCapability>,
        capture: Arc<dyn AudioCapture>,
    ) -> Arc<Self> {
        let (media_tx, media_rx) = mpsc::channel(64);
        Arc::new(Self {
            signaling,
            credentials,
            permission_gate,
            capture,
            media: MediaSession::new(config.stun_servers.clone()),
            events: EventBus::new(),
            core: Mutex::new(CallCore::default()),
            media_flow: Mutex::new(()),
            media_tx,
            media_rx: Mutex::new(Some(media_rx)),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn status(&self) -> CallStatus {
        self.core.lock().await.status
    }

    pub async fn session(&self) -> Option<CallSession> {
        self.core.lock().await.session.clone()
    }

    /// The peer's audio track once it has arrived, for playback.
    pub async fn remote_track(
        &self,
    ) -> Option<Arc<webrtc::track::track_remote::TrackRemote>> {
        self.media.remote_track().await
    }

    /// Dispatch loop: consumes signaling and media events until the
    /// signaling channel is dropped. Spawn once per manager.
    pub async fn run(self: &Arc<Self>, mut signaling_rx: mpsc::Receiver<SignalingEvent>) {
        let Some(mut media_rx) = self.media_rx.lock().await.take() else {
            warn!("CallManager::run called twice");
            return;
        };

        loop {
            tokio::select! {
                event = signaling_rx.recv() => match event {
                    Some(event) => self.handle_signaling_event(event).await,
                    None => break,
                },
                // The manager holds a sender, so this arm never closes.
                Some(event) = media_rx.recv() => {
                    self.handle_media_event(event).await;
                }
            }
        }

        debug!("Signaling event stream ended, shutting down call manager");
        self.teardown_call().await;
    }

    /// Reacts to a credential change: a missing token forces teardown and
    /// closes the channel; a fresh token (re)starts it.
    pub async fn credentials_changed(self: &Arc<Self>) {
        if self.credentials.token().is_some() {
            self.signaling.connect();
        } else {
            info!("Auth token gone, tearing down call state");
            self.teardown_call().await;
            self.signaling.disconnect().await;
        }
    }

    // ---- local user actions ----

    /// Starts an outgoing call to `peer`.
    ///
    /// The `Connecting` slot is reserved before the first await so a racing
    /// second attempt fails fast with no side effects.
    pub async fn start_call(self: &Arc<Self>, peer: &str) -> Result<(), CallError> {
        if self.credentials.identity().is_none() {
            return Err(CallError::NotAuthenticated);
        }

        let epoch = {
            let mut core = self.core.lock().await;
            if core.status != CallStatus::Idle {
                return Err(CallError::CallInProgress);
            }
            core.status = CallStatus::Connecting;
            core.epoch
        };
        self.events
            .dispatch(CallEvent::StatusChanged(CallStatus::Connecting));

        if !self.permission_gate.request_audio_capability().await {
            self.release_reservation(epoch).await;
            self.events.dispatch(CallEvent::PermissionDenied);
            return Err(CallError::PermissionDenied);
        }

        match self.setup_outgoing(peer, epoch).await {
            Ok(()) => {
                info!("Outgoing call to {peer}: invite sent");
                Ok(())
            }
            Err(CallError::Superseded) => {
                debug!("Outgoing call to {peer} superseded during setup");
                Err(CallError::Superseded)
            }
            Err(e) => {
                warn!("start_call to {peer} failed: {e}");
                self.events.dispatch(CallEvent::Failed {
                    reason: e.to_string(),
                });
                self.teardown_call().await;
                Err(e)
            }
        }
    }

    async fn setup_outgoing(self: &Arc<Self>, peer: &str, epoch: u64) -> Result<(), CallError> {
        let _flow = self.media_flow.lock().await;
        let result = self.setup_outgoing_locked(peer, epoch).await;
        if matches!(result, Err(CallError::Superseded)) {
            // A concurrent teardown took ownership of the call slot while we
            // were building; our half-built media stack has no owner left.
            // Release it before the flow lock lets the next attempt in.
            self.media.teardown().await;
        }
        result
    }

    async fn setup_outgoing_locked(
        self: &Arc<Self>,
        peer: &str,
        epoch: u64,
    ) -> Result<(), CallError> {
        self.ensure_epoch(epoch).await?;

        self.media.teardown().await;
        self.media
            .create_peer_connection(self.media_tx.clone())
            .await?;
        self.media.acquire_local_audio(&self.capture).await?;
        self.ensure_epoch(epoch).await?;

        let offer = self.media.create_offer().await?;

        {
            let mut core = self.core.lock().await;
            if core.epoch != epoch {
                return Err(CallError::Superseded);
            }
            core.pending_target = Some(peer.to_string());
        }

        let invite = SignalMessage::new(SignalKind::CallInvite, peer).with_description(&offer);
        self.send_signal(invite).await?;
        Ok(())
    }

    /// Accepts the ringing incoming call.
    pub async fn accept_call(self: &Arc<Self>) -> Result<(), CallError> {
        let (epoch, peer, offer, call_id) = {
            let core = self.core.lock().await;
            let session = match (&core.session, core.status) {
                (Some(session), CallStatus::Incoming) => session,
                _ => return Err(CallError::NoActiveCall),
            };
            let Some(offer) = session.offer.clone() else {
                return Err(CallError::InvalidPayload("incoming call has no offer"));
            };
            (
                core.epoch,
                session.peer.clone(),
                offer,
                session.call_id.clone(),
            )
        };

        if !self.permission_gate.request_audio_capability().await {
            // The call keeps ringing; the user may retry or reject.
            self.events.dispatch(CallEvent::PermissionDenied);
            return Err(CallError::PermissionDenied);
        }

        match self.setup_incoming(epoch, &peer, &offer, &call_id).await {
            Ok(()) => {
                info!("Accepted call from {peer}");
                Ok(())
            }
            Err(CallError::Superseded) => {
                debug!("Accept of call from {peer} superseded during setup");
                Err(CallError::Superseded)
            }
            Err(e) => {
                warn!("accept_call from {peer} failed: {e}");
                self.events.dispatch(CallEvent::Failed {
                    reason: e.to_string(),
                });
                self.teardown_call().await;
                Err(e)
            }
        }
    }

    async fn setup_incoming(
        self: &Arc<Self>,
        epoch: u64,
        peer: &str,
        offer: &SessionDescriptionPayload,
        call_id: &str,
    ) -> Result<(), CallError> {
        let _flow = self.media_flow.lock().await;
        let result = self.setup_incoming_locked(epoch, peer, offer, call_id).await;
        if matches!(result, Err(CallError::Superseded)) {
            self.media.teardown().await;
        }
        result
    }

    async fn setup_incoming_locked(
        self: &Arc<Self>,
        epoch: u64,
        peer: &str,
        offer: &SessionDescriptionPayload,
        call_id: &str,
    ) -> Result<(), CallError> {
        self.ensure_epoch(epoch).await?;

        self.media
            .create_peer_connection(self.media_tx.clone())
            .await?;
        self.media.acquire_local_audio(&self.capture).await?;
        self.ensure_epoch(epoch).await?;

        if let Err(e) = self.media.apply_remote_description(offer).await {
            warn!("Stored offer from {peer} did not apply: {e}");
            return Err(CallError::InvalidPayload("invalid call request"));
        }
        // Candidates the peer sent while we were ringing become applicable
        // the moment the offer is in.
        self.media.drain_remote_candidates().await;

        let answer = self.media.create_answer().await?;
        self.ensure_epoch(epoch).await?;

        let accept = SignalMessage::new(SignalKind::CallAccept, peer)
            .with_call_id(call_id)
            .with_description(&answer);
        self.send_signal(accept).await?;

        {
            let mut core = self.core.lock().await;
            if core.epoch != epoch {
                return Err(CallError::Superseded);
            }
            core.status = CallStatus::InCall;
        }
        self.events
            .dispatch(CallEvent::StatusChanged(CallStatus::InCall));
        Ok(())
    }

    /// Declines the ringing incoming call.
    pub async fn reject_call(self: &Arc<Self>) -> Result<(), CallError> {
        let (peer, call_id) = {
            let core = self.core.lock().await;
            match &core.session {
                Some(session) => (session.peer.clone(), session.call_id.clone()),
                None => return Err(CallError::NoActiveCall),
            }
        };

        let reject = SignalMessage::new(SignalKind::CallReject, &peer).with_call_id(call_id);
        let _ = self.send_signal(reject).await;
        self.teardown_call().await;
        Ok(())
    }

    /// Hangs up the current call, or abandons a not-yet-acknowledged
    /// outgoing attempt.
    pub async fn end_call(self: &Arc<Self>) -> Result<(), CallError> {
        let target = {
            let core = self.core.lock().await;
            match (&core.session, core.status) {
                (Some(session), _) => Some((session.peer.clone(), session.call_id.clone())),
                (None, CallStatus::Idle) => return Err(CallError::NoActiveCall),
                // Pre-ack outgoing attempt: nothing addressable to notify.
                (None, _) => None,
            }
        };

        if let Some((peer, call_id)) = target {
            let end = SignalMessage::new(SignalKind::CallEnd, &peer).with_call_id(call_id);
            let _ = self.send_signal(end).await;
        }
        self.teardown_call().await;
        Ok(())
    }

    // ---- signaling events ----

    async fn handle_signaling_event(self: &Arc<Self>, event: SignalingEvent) {
        match event {
            SignalingEvent::Open => {
                self.events.set_connectivity(true);
            }
            SignalingEvent::Close { code, reason } => {
                debug!(
                    "Signaling channel closed (code {:?}, reason {:?})",
                    code, reason
                );
                self.events.set_connectivity(false);
                self.teardown_with_notice().await;
            }
            SignalingEvent::Message(message) => self.handle_message(message).await,
            SignalingEvent::Error(e) => {
                warn!("Signaling error: {e}");
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, message: SignalMessage) {
        match message.kind {
            SignalKind::CallInviteAck => self.handle_invite_ack(message).await,
            SignalKind::CallInvite => self.handle_invite(message).await,
            SignalKind::CallAccept => self.handle_remote_accept(message).await,
            SignalKind::CallReject => self.handle_remote_reject(message).await,
            SignalKind::CallEnd => self.handle_remote_end(message).await,
            SignalKind::IceCandidate => self.handle_remote_candidate(message).await,
            SignalKind::CallError => self.handle_remote_error(message).await,
        }
    }

    /// The server acknowledged our invite and assigned the call identifier.
    /// Only meaningful while an outgoing target is pending; a duplicate or
    /// stale ack is a no-op.
    async fn handle_invite_ack(self: &Arc<Self>, message: SignalMessage) {
        let flush = {
            let mut core = self.core.lock().await;
            let Some(peer) = core.pending_target.take() else {
                debug!("Ignoring call.invite.ack with no pending target");
                return;
            };
            let call_id = message.call_id.clone().unwrap_or_default();
            debug!("Call to {peer} acknowledged (call_id: {call_id})");
            core.session = Some(CallSession::new_outgoing(call_id.clone(), peer.clone()));
            core.status = CallStatus::Connecting;
            (!call_id.is_empty()).then_some((call_id, peer))
        };

        // The session is addressable now; release candidates gathered early.
        if let Some((call_id, peer)) = flush {
            self.flush_local_candidates(&call_id, &peer).await;
        }
    }

    /// A remote invite. Only meaningful while idle; the payload must be a
    /// valid session description.
    async fn handle_invite(self: &Arc<Self>, message: SignalMessage) {
        let (Some(from), Some(offer)) = (message.from.clone(), message.session_description())
        else {
            warn!("Received call.invite with missing sender or invalid offer");
            self.events.dispatch(CallEvent::ProtocolError {
                reason: "invalid call request".to_string(),
            });
            return;
        };

        {
            let mut core = self.core.lock().await;
            if core.status != CallStatus::Idle || core.session.is_some() {
                debug!("Busy, ignoring call.invite from {from}");
                return;
            }
            let call_id = message.call_id.clone().unwrap_or_default();
            core.session = Some(CallSession::new_incoming(call_id, from.clone(), offer));
            core.status = CallStatus::Incoming;
        }

        info!("Incoming call from {from}");
        self.events
            .dispatch(CallEvent::StatusChanged(CallStatus::Incoming));
        self.events.dispatch(CallEvent::IncomingCall { peer: from });
    }

    /// The peer accepted our outgoing call.
    ///
    /// The call enters `InCall` even when the answer fails to apply: the
    /// failure is logged and the connection-state callback remains the
    /// authority on whether media actually comes up.
    async fn handle_remote_accept(self: &Arc<Self>, message: SignalMessage) {
        let epoch = {
            let core = self.core.lock().await;
            match &core.session {
                Some(session) if session.is_outgoing() => core.epoch,
                _ => {
                    debug!("Ignoring call.accept with no outgoing session");
                    return;
                }
            }
        };

        if let Some(answer) = message.session_description() {
            if let Err(e) = self.media.apply_remote_description(&answer).await {
                warn!("Failed to apply remote answer: {e}");
            }
            self.media.drain_remote_candidates().await;
        } else {
            warn!("call.accept carried no valid answer payload");
        }

        let flush = {
            let mut core = self.core.lock().await;
            if core.epoch != epoch {
                return;
            }
            let Some(session) = core.session.as_mut() else {
                return;
            };
            let flush = match &message.call_id {
                Some(id) if !id.is_empty() && *id != session.call_id => {
                    session.call_id = id.clone();
                    Some((id.clone(), session.peer.clone()))
                }
                _ => None,
            };
            core.status = CallStatus::InCall;
            flush
        };

        self.events
            .dispatch(CallEvent::StatusChanged(CallStatus::InCall));
        if let Some((call_id, peer)) = flush {
            self.flush_local_candidates(&call_id, &peer).await;
        }
    }

    async fn handle_remote_reject(self: &Arc<Self>, message: SignalMessage) {
        let peer = self.peer_for_notice(&message).await;
        info!("Call rejected by {}", peer.as_deref().unwrap_or("peer"));
        self.events.dispatch(CallEvent::Rejected {
            peer: peer.unwrap_or_else(|| "peer".to_string()),
        });
        self.teardown_call().await;
    }

    async fn handle_remote_end(self: &Arc<Self>, message: SignalMessage) {
        let peer = self.peer_for_notice(&message).await;
        info!("Call ended by {}", peer.as_deref().unwrap_or("peer"));
        self.events.dispatch(CallEvent::Ended { peer });
        self.teardown_call().await;
    }

    async fn handle_remote_error(self: &Arc<Self>, message: SignalMessage) {
        let reason = message
            .error_reason()
            .unwrap_or_else(|| "call error".to_string());
        warn!("Remote call error: {reason}");
        self.events.dispatch(CallEvent::Failed { reason });
        self.teardown_call().await;
    }

    /// A remote candidate: applied immediately once a remote description
    /// exists, buffered otherwise.
    async fn handle_remote_candidate(self: &Arc<Self>, message: SignalMessage) {
        let Some(candidate) = message.ice_candidate() else {
            debug!("Ignoring ice.candidate with invalid payload");
            return;
        };
        self.media.apply_or_buffer_remote_candidate(candidate).await;
    }

    // ---- media events ----

    async fn handle_media_event(self: &Arc<Self>, event: MediaEvent) {
        match event {
            MediaEvent::LocalCandidate(candidate) => {
                // Address from the authoritative session at the moment of
                // use; a stale copy captured before an ack would misroute.
                let target = {
                    let core = self.core.lock().await;
                    core.session
                        .as_ref()
                        .filter(|s| s.is_addressable())
                        .map(|s| (s.call_id.clone(), s.peer.clone()))
                };
                match target {
                    Some((call_id, peer)) => {
                        let message = SignalMessage::new(SignalKind::IceCandidate, peer)
                            .with_call_id(call_id)
                            .with_candidate(&candidate);
                        let _ = self.send_signal(message).await;
                    }
                    None => self.media.buffer_local_candidate(candidate).await,
                }
            }
            MediaEvent::RemoteTrack(track) => {
                self.events.dispatch(CallEvent::RemoteAudio(track));
            }
            MediaEvent::ConnectionFailed(state) => {
                if self.status().await != CallStatus::Idle {
                    info!("Media transport {state}, ending call");
                    let peer = self.session().await.map(|s| s.peer);
                    self.events.dispatch(CallEvent::Ended { peer });
                    self.teardown_call().await;
                }
            }
        }
    }

    // ---- teardown ----

    /// Full teardown to `Idle`: clears the pending target and session, bumps
    /// the epoch so in-flight flows abort, and releases every media
    /// resource. Safe to call from multiple racing triggers.
    pub async fn teardown_call(&self) {
        let was_active = {
            let mut core = self.core.lock().await;
            let was_active = core.status != CallStatus::Idle || core.session.is_some();
            core.epoch += 1;
            core.pending_target = None;
            core.session = None;
            core.status = CallStatus::Idle;
            was_active
        };

        self.media.teardown().await;

        if was_active {
            self.events
                .dispatch(CallEvent::StatusChanged(CallStatus::Idle));
        }
    }

    /// Teardown that also tells the user their call went away (signaling
    /// loss, logout).
    async fn teardown_with_notice(&self) {
        let peer = {
            let core = self.core.lock().await;
            if core.status == CallStatus::Idle && core.session.is_none() {
                return;
            }
            core.session.as_ref().map(|s| s.peer.clone())
        };
        self.events.dispatch(CallEvent::Ended { peer });
        self.teardown_call().await;
    }

    // ---- helpers ----

    async fn ensure_epoch(&self, epoch: u64) -> Result<(), CallError> {
        if self.core.lock().await.epoch != epoch {
            return Err(CallError::Superseded);
        }
        Ok(())
    }

    /// Rolls an early `Connecting` reservation back to `Idle` after a
    /// permission denial, unless a teardown already reset it.
    async fn release_reservation(&self, epoch: u64) {
        let restored = {
            let mut core = self.core.lock().await;
            if core.epoch == epoch
                && core.status == CallStatus::Connecting
                && core.session.is_none()
            {
                core.status = CallStatus::Idle;
                true
            } else {
                false
            }
        };
        if restored {
            self.events
                .dispatch(CallEvent::StatusChanged(CallStatus::Idle));
        }
    }

    /// Sends every buffered local candidate, tagged with the now-known call
    /// identifier, in generation order.
    async fn flush_local_candidates(self: &Arc<Self>, call_id: &str, peer: &str) {
        let pending = self.media.take_local_candidates().await;
        if pending.is_empty() {
            return;
        }
        debug!(
            "Flushing {} buffered local candidates for call {call_id}",
            pending.len()
        );
        for candidate in pending {
            let message = SignalMessage::new(SignalKind::IceCandidate, peer)
                .with_call_id(call_id)
                .with_candidate(&candidate);
            let _ = self.send_signal(message).await;
        }
    }

    /// Sends through the signaling channel. Failures on candidate messages
    /// are silent (ICE is lossy-tolerant); anything else raises a
    /// user-visible event at the call site's behalf.
    async fn send_signal(
        self: &Arc<Self>,
        message: SignalMessage,
    ) -> Result<SendOutcome, CallError> {
        let is_candidate = message.kind == SignalKind::IceCandidate;
        match self.signaling.send(message).await {
            Ok(SendOutcome::Sent) => Ok(SendOutcome::Sent),
            Ok(SendOutcome::Queued) => {
                debug!("Signaling message queued until connection recovers");
                Ok(SendOutcome::Queued)
            }
            Err(e) => {
                warn!("Failed to send signaling message: {e}");
                if !is_candidate {
                    self.events.dispatch(CallEvent::SignalingUnavailable);
                }
                Err(e.into())
            }
        }
    }

    async fn peer_for_notice(&self, message: &SignalMessage) -> Option<String> {
        if let Some(from) = &message.from {
            return Some(from.clone());
        }
        self.core
            .lock()
            .await
            .session
            .as_ref()
            .map(|s| s.peer.clone())
    }

    #[cfg(test)]
    pub(crate) fn media(&self) -> &MediaSession {
        &self.media
    }
}
