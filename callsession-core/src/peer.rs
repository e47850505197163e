//! Peer connection controller
//!
//! Wraps one negotiation instance (offer/answer plus ICE) for exactly one
//! call and exposes a single authoritative [`PeerConnectionState`].
//!
//! # Inbound ordering
//!
//! Every inbound payload and every local command goes through one FIFO queue
//! drained by one worker task, so payloads are applied in the order they
//! arrived. Payloads that arrive too early are parked rather than rejected:
//!
//! - an answer received before the local offer exists waits for the offer
//! - candidates received before the remote description wait for it
//!
//! Relays deliver at least once, so re-applying a description or a candidate
//! that was already applied is ignored.

use crate::media::{LocalMedia, LocalTrack};
use crate::types::{CallId, CallRole, IceCandidate, RemoteTrackInfo, SignalingPayload, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Peer connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Track replacement requested on a connection without a video sender
    #[error("No active video sender")]
    NoActiveVideoSender,

    /// Offer/answer could not be produced or applied
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Operation not valid in the current signaling state
    #[error("Invalid signaling state: {0}")]
    InvalidState(String),

    /// Underlying primitive error
    #[error("Transport error: {0}")]
    Transport(String),

    /// The controller has been closed
    #[error("Peer connection closed")]
    Closed,
}

/// Connection state reported by the negotiation primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerConnectionState {
    /// Nothing negotiated yet
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Connectivity lost, may recover
    Disconnected,
    /// Unrecoverable failure
    Failed,
    /// Closed locally or by the peer
    Closed,
}

impl PeerConnectionState {
    /// Whether the connection can no longer change state
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

/// Type of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdpKind {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Opaque handle to an outbound RTP sender of a [`PeerTransport`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(
    /// Index assigned by the transport
    pub u32,
);

/// Events raised by a negotiation primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerTransportEvent {
    /// A local ICE candidate was gathered
    LocalCandidate(IceCandidate),
    /// Connection state changed
    StateChanged(PeerConnectionState),
    /// The peer started sending a track
    RemoteTrack(RemoteTrackInfo),
}

// ============================================================================
// Negotiation Primitive Abstraction
// ============================================================================

/// Backend abstraction for the WebRTC negotiation primitive
///
/// One instance serves one call. Implementations follow standard WebRTC
/// rules: a remote answer needs a local offer, candidates need a remote
/// description, and replacing a sender's track never renegotiates.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach a local track and return its sender
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<SenderId, PeerError>;

    /// Swap the track feeding an existing sender
    async fn replace_track(&self, sender: SenderId, track: Arc<LocalTrack>) -> Result<(), PeerError>;

    /// Create an offer and apply it as the local description
    async fn create_offer(&self) -> Result<String, PeerError>;

    /// Create an answer and apply it as the local description
    async fn create_answer(&self) -> Result<String, PeerError>;

    /// Apply the peer's description
    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), PeerError>;

    /// Apply a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Close the connection
    async fn close(&self) -> Result<(), PeerError>;

    /// Get the backend type name for debugging/logging
    fn backend_type(&self) -> &'static str;
}

/// Creates one [`PeerTransport`] per call
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    /// Create a transport whose events are delivered on `events`
    async fn create(
        &self,
        call_id: &CallId,
        events: mpsc::UnboundedSender<PeerTransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError>;
}

// ============================================================================
// Controller
// ============================================================================

/// Events the controller raises for the call manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// Payload to send through the relay
    Outbound(SignalingPayload),
    /// Connection state changed
    StateChanged(PeerConnectionState),
    /// Remote track received
    RemoteTrack(RemoteTrackInfo),
    /// Non-fatal error; fatal ones are followed by `StateChanged(Failed)`
    Error(PeerError),
}

enum Command {
    Remote(SignalingPayload),
    CreateOffer(oneshot::Sender<Result<(), PeerError>>),
}

#[derive(Default)]
struct Senders {
    audio: Option<(SenderId, Arc<LocalTrack>)>,
    video: Option<(SenderId, Arc<LocalTrack>)>,
}

/// Controller for one call's peer connection
pub struct PeerConnectionController {
    call_id: CallId,
    role: CallRole,
    transport: Arc<dyn PeerTransport>,
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<Mutex<PeerConnectionState>>,
    senders: Mutex<Senders>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for PeerConnectionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionController")
            .field("call_id", &self.call_id)
            .field("role", &self.role)
            .field("backend", &self.transport.backend_type())
            .field("state", &self.connection_state())
            .finish()
    }
}

impl PeerConnectionController {
    /// Create the connection for a call and attach the local tracks
    ///
    /// The worker that applies inbound signaling starts immediately; nothing
    /// is offered until [`PeerConnectionController::negotiate`].
    ///
    /// # Errors
    ///
    /// Returns error if the primitive cannot be created or a track cannot be
    /// attached. The primitive is closed before returning in the latter case.
    #[tracing::instrument(skip(factory, media, events), fields(call_id = %call_id))]
    pub async fn new(
        call_id: CallId,
        role: CallRole,
        factory: &dyn PeerTransportFactory,
        media: &LocalMedia,
        events: mpsc::UnboundedSender<ControllerEvent>,
    ) -> Result<Self, PeerError> {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = factory.create(&call_id, transport_tx).await?;

        let mut senders = Senders::default();
        for track in media.tracks() {
            let sender = match transport.add_track(Arc::clone(track)).await {
                Ok(sender) => sender,
                Err(e) => {
                    let _ = transport.close().await;
                    return Err(e);
                }
            };
            match track.kind() {
                TrackKind::Audio => senders.audio = Some((sender, Arc::clone(track))),
                TrackKind::Video | TrackKind::ScreenShare => {
                    senders.video = Some((sender, Arc::clone(track)))
                }
            }
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(PeerConnectionState::New));
        let shutdown = CancellationToken::new();

        let worker = NegotiationWorker {
            call_id: call_id.clone(),
            role,
            transport: Arc::clone(&transport),
            events,
            state: Arc::clone(&state),
            local_description: None,
            remote_description: None,
            pending_answer: None,
            pending_candidates: Vec::new(),
            applied_candidates: HashSet::new(),
            failed: false,
        };
        tokio::spawn(worker.run(command_rx, transport_rx, shutdown.clone()));

        tracing::debug!(
            backend = transport.backend_type(),
            tracks = media.tracks().len(),
            "Peer connection created"
        );

        Ok(Self {
            call_id,
            role,
            transport,
            commands,
            state,
            senders: Mutex::new(senders),
            shutdown,
        })
    }

    /// Start negotiation
    ///
    /// The offerer creates its offer and queues it for the relay; payloads
    /// that were parked waiting for it are applied right after. The answerer
    /// has nothing to do until the offer arrives.
    ///
    /// # Errors
    ///
    /// Returns error if the offer cannot be created
    pub async fn negotiate(&self) -> Result<(), PeerError> {
        if !self.role.is_offerer() {
            return Ok(());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::CreateOffer(reply_tx))
            .map_err(|_| PeerError::Closed)?;
        reply_rx.await.map_err(|_| PeerError::Closed)?
    }

    /// Queue an inbound payload
    ///
    /// Payloads are applied in the order of these calls.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the controller no longer accepts payloads
    pub fn apply_remote_signal(&self, payload: SignalingPayload) -> Result<(), PeerError> {
        self.commands
            .send(Command::Remote(payload))
            .map_err(|_| PeerError::Closed)
    }

    /// Replace the track feeding the outgoing video sender
    ///
    /// Only an existing sender is touched; no new sender is created and no
    /// new offer/answer round is started. Returns the track that was replaced.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveVideoSender` if the connection has no video sender
    pub async fn replace_outgoing_video_track(
        &self,
        track: Arc<LocalTrack>,
    ) -> Result<Arc<LocalTrack>, PeerError> {
        if self.shutdown.is_cancelled() {
            return Err(PeerError::Closed);
        }
        let sender = self
            .senders
            .lock()
            .video
            .as_ref()
            .map(|(sender, _)| *sender)
            .ok_or(PeerError::NoActiveVideoSender)?;

        self.transport
            .replace_track(sender, Arc::clone(&track))
            .await?;

        let mut senders = self.senders.lock();
        let previous = senders
            .video
            .replace((sender, Arc::clone(&track)))
            .map(|(_, previous)| previous)
            .ok_or(PeerError::NoActiveVideoSender)?;

        tracing::info!(
            call_id = %self.call_id,
            previous = %previous.id(),
            current = %track.id(),
            "Outgoing video track replaced"
        );
        Ok(previous)
    }

    /// Check if an outgoing video sender exists
    #[must_use]
    pub fn has_video_sender(&self) -> bool {
        self.senders.lock().video.is_some()
    }

    /// Track currently feeding the video sender
    #[must_use]
    pub fn outgoing_video_track(&self) -> Option<Arc<LocalTrack>> {
        self.senders
            .lock()
            .video
            .as_ref()
            .map(|(_, track)| Arc::clone(track))
    }

    /// Track currently feeding the audio sender
    #[must_use]
    pub fn outgoing_audio_track(&self) -> Option<Arc<LocalTrack>> {
        self.senders
            .lock()
            .audio
            .as_ref()
            .map(|(_, track)| Arc::clone(track))
    }

    /// Current connection state
    #[must_use]
    pub fn connection_state(&self) -> PeerConnectionState {
        *self.state.lock()
    }

    /// Offer/answer role
    #[must_use]
    pub fn role(&self) -> CallRole {
        self.role
    }

    /// Call this controller negotiates for
    #[must_use]
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Stop the worker and close the underlying connection
    ///
    /// Idempotent.
    pub async fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        if let Err(e) = self.transport.close().await {
            tracing::warn!(call_id = %self.call_id, error = %e, "Failed to close peer connection");
        }
        *self.state.lock() = PeerConnectionState::Closed;
        tracing::debug!(call_id = %self.call_id, "Peer connection closed");
    }
}

impl Drop for PeerConnectionController {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ============================================================================
// Negotiation Worker
// ============================================================================

struct NegotiationWorker {
    call_id: CallId,
    role: CallRole,
    transport: Arc<dyn PeerTransport>,
    events: mpsc::UnboundedSender<ControllerEvent>,
    state: Arc<Mutex<PeerConnectionState>>,
    local_description: Option<SdpKind>,
    remote_description: Option<String>,
    pending_answer: Option<String>,
    pending_candidates: Vec<IceCandidate>,
    applied_candidates: HashSet<IceCandidate>,
    failed: bool,
}

impl NegotiationWorker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport_events: mpsc::UnboundedReceiver<PeerTransportEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(Command::Remote(payload)) => self.apply(payload).await,
                    Some(Command::CreateOffer(reply)) => {
                        let result = self.create_offer().await;
                        let _ = reply.send(result);
                    }
                    None => break,
                },
                event = transport_events.recv() => match event {
                    Some(event) => self.on_transport_event(event),
                    None => break,
                },
            }
        }
        tracing::trace!(call_id = %self.call_id, "Negotiation worker stopped");
    }

    fn emit(&self, event: ControllerEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: PeerConnectionState) {
        {
            let mut current = self.state.lock();
            if *current == state || current.is_terminal() {
                return;
            }
            tracing::debug!(
                call_id = %self.call_id,
                old_state = ?*current,
                new_state = ?state,
                "Peer connection state transition"
            );
            *current = state;
        }
        self.emit(ControllerEvent::StateChanged(state));
    }

    fn fail(&mut self, error: PeerError) {
        tracing::error!(call_id = %self.call_id, error = %error, "Negotiation failed");
        self.failed = true;
        self.pending_answer = None;
        self.pending_candidates.clear();
        self.emit(ControllerEvent::Error(error));
        self.set_state(PeerConnectionState::Failed);
    }

    fn on_transport_event(&mut self, event: PeerTransportEvent) {
        match event {
            PeerTransportEvent::LocalCandidate(candidate) => {
                if !self.failed {
                    self.emit(ControllerEvent::Outbound(SignalingPayload::IceCandidate {
                        candidate,
                    }));
                }
            }
            PeerTransportEvent::StateChanged(PeerConnectionState::Failed) if !self.failed => {
                self.fail(PeerError::NegotiationFailed("connection failed".to_string()));
            }
            PeerTransportEvent::StateChanged(state) => self.set_state(state),
            PeerTransportEvent::RemoteTrack(track) => {
                tracing::debug!(call_id = %self.call_id, track_id = %track.id, kind = %track.kind, "Remote track");
                self.emit(ControllerEvent::RemoteTrack(track));
            }
        }
    }

    async fn create_offer(&mut self) -> Result<(), PeerError> {
        if self.local_description.is_some() {
            return Err(PeerError::InvalidState(
                "local description already set".to_string(),
            ));
        }
        let sdp = self.transport.create_offer().await.map_err(|e| {
            let error = PeerError::NegotiationFailed(format!("create offer: {e}"));
            self.fail(error.clone());
            error
        })?;
        self.local_description = Some(SdpKind::Offer);
        self.set_state(PeerConnectionState::Connecting);
        self.emit(ControllerEvent::Outbound(SignalingPayload::Offer { sdp }));
        tracing::debug!(call_id = %self.call_id, "Local offer created");

        if let Some(answer) = self.pending_answer.take() {
            tracing::debug!(call_id = %self.call_id, "Applying parked answer");
            self.apply_answer(answer).await;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, payload), fields(call_id = %self.call_id, payload = payload.kind()))]
    async fn apply(&mut self, payload: SignalingPayload) {
        if self.failed {
            tracing::debug!("Ignoring payload after negotiation failure");
            return;
        }
        match payload {
            SignalingPayload::Offer { sdp } => self.apply_offer(sdp).await,
            SignalingPayload::Answer { sdp } => self.apply_answer(sdp).await,
            SignalingPayload::IceCandidate { candidate } => self.apply_candidate(candidate).await,
        }
    }

    /// Check a description against the one already applied
    ///
    /// Returns `true` when the description should be applied.
    fn accept_description(&self, sdp: &str) -> bool {
        match &self.remote_description {
            None => true,
            Some(applied) if applied == sdp => {
                tracing::debug!("Duplicate remote description ignored");
                false
            }
            Some(_) => {
                tracing::warn!("Renegotiation is not supported, ignoring new remote description");
                self.emit(ControllerEvent::Error(PeerError::InvalidState(
                    "remote description already applied".to_string(),
                )));
                false
            }
        }
    }

    async fn apply_offer(&mut self, sdp: String) {
        if self.role.is_offerer() {
            tracing::warn!("Offer received by the offering side");
            self.emit(ControllerEvent::Error(PeerError::InvalidState(
                "offer received by offerer".to_string(),
            )));
            return;
        }
        if !self.accept_description(&sdp) {
            return;
        }

        if let Err(e) = self
            .transport
            .set_remote_description(SdpKind::Offer, sdp.clone())
            .await
        {
            self.fail(PeerError::NegotiationFailed(format!("apply offer: {e}")));
            return;
        }
        self.remote_description = Some(sdp);
        self.set_state(PeerConnectionState::Connecting);

        match self.transport.create_answer().await {
            Ok(answer) => {
                self.local_description = Some(SdpKind::Answer);
                self.emit(ControllerEvent::Outbound(SignalingPayload::Answer { sdp: answer }));
                tracing::debug!("Local answer created");
            }
            Err(e) => {
                self.fail(PeerError::NegotiationFailed(format!("create answer: {e}")));
                return;
            }
        }

        self.flush_candidates().await;
    }

    async fn apply_answer(&mut self, sdp: String) {
        if !self.role.is_offerer() {
            tracing::warn!("Answer received by the answering side");
            self.emit(ControllerEvent::Error(PeerError::InvalidState(
                "answer received by answerer".to_string(),
            )));
            return;
        }
        if !self.accept_description(&sdp) {
            return;
        }
        if self.local_description.is_none() {
            if self.pending_answer.is_none() {
                tracing::debug!("Answer arrived before local offer, parking it");
                self.pending_answer = Some(sdp);
            }
            return;
        }

        if let Err(e) = self
            .transport
            .set_remote_description(SdpKind::Answer, sdp.clone())
            .await
        {
            self.fail(PeerError::NegotiationFailed(format!("apply answer: {e}")));
            return;
        }
        self.remote_description = Some(sdp);
        self.flush_candidates().await;
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) {
        if self.applied_candidates.contains(&candidate) {
            tracing::trace!("Duplicate candidate ignored");
            return;
        }
        if self.remote_description.is_none() {
            if !self.pending_candidates.contains(&candidate) {
                tracing::trace!("Candidate arrived before remote description, parking it");
                self.pending_candidates.push(candidate);
            }
            return;
        }

        match self.transport.add_ice_candidate(candidate.clone()).await {
            Ok(()) => {
                self.applied_candidates.insert(candidate);
            }
            Err(e) => {
                tracing::warn!(error = %e, candidate = %candidate.candidate, "Remote candidate rejected");
                self.emit(ControllerEvent::Error(PeerError::NegotiationFailed(format!(
                    "add candidate: {e}"
                ))));
            }
        }
    }

    async fn flush_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "Applying parked candidates");
        }
        for candidate in pending {
            self.apply_candidate(candidate).await;
        }
    }
}
