//! Call session management
//!
//! [`CallManager`] owns a registry of call sessions keyed by caller-supplied
//! call ids. Each session owns its local media, one peer connection
//! controller and a relay subscription, and moves through:
//!
//! ```text
//!      Idle
//!        │ initiate
//!        ▼
//!  AcquiringMedia ──────────────┐
//!        │                      │
//!        ▼                      ▼
//!   Negotiating ───────────► Failed
//!        │                      ▲
//!        ▼                      │
//!    Connected ─────────────────┘
//!        │ end_call / peer close
//!        ▼
//!      Ended
//! ```
//!
//! `end_call` may end a session from any live state. Sessions that terminate
//! without `end_call` (negotiation failure, relay outage, peer close) leave
//! their terminal state behind so `call_state` can report it; the id cannot
//! be reused until `end_call` clears it.

use crate::events::{EventReceiver, EventSender, SessionEvents};
use crate::media::{CaptureBackend, LocalMedia, LocalTrack, MediaCaptureAdapter, MediaError};
use crate::peer::{ControllerEvent, PeerConnectionController, PeerConnectionState, PeerError, PeerTransportFactory};
use crate::signaling::{SignalingError, SignalingHandler, SignalingTransport, Subscription};
use crate::types::{
    CallId, CallRole, CallSessionInfo, CallState, ErrorKind, MediaConstraints, MediaFlags,
    RemoteTrackInfo, SignalingPayload, TrackKind,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Call management errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The platform refused access to a capture device
    #[error("Media acquisition denied for {0}")]
    MediaAcquisitionDenied(TrackKind),

    /// No usable capture device
    #[error("Media unavailable: {0}")]
    MediaUnavailable(TrackKind),

    /// A session with this id already exists
    #[error("Session already exists for call {0}")]
    DuplicateSession(CallId),

    /// Track replacement on a connection without a video sender
    #[error("No active video sender")]
    NoActiveVideoSender,

    /// Offer/answer could not be produced or applied
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The signaling relay cannot be used
    #[error("Relay unavailable: {0}")]
    RelayUnavailable(String),

    /// Too many live sessions
    #[error("Maximum concurrent calls limit reached: {0}")]
    CallLimitReached(usize),

    /// `end_call` ran while the session was being set up
    #[error("Call {0} was ended during setup")]
    Aborted(CallId),
}

impl CallError {
    /// Category delivered with [`CallEvent::Error`](crate::types::CallEvent::Error)
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MediaAcquisitionDenied(_) => ErrorKind::MediaAcquisitionDenied,
            Self::MediaUnavailable(_) => ErrorKind::MediaUnavailable,
            Self::DuplicateSession(_) => ErrorKind::DuplicateSession,
            Self::NoActiveVideoSender => ErrorKind::NoActiveVideoSender,
            Self::NegotiationFailed(_) => ErrorKind::NegotiationFailed,
            Self::RelayUnavailable(_) => ErrorKind::RelayUnavailable,
            Self::CallLimitReached(_) => ErrorKind::CallLimitReached,
            Self::Aborted(_) => ErrorKind::Aborted,
        }
    }
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied(kind) => CallError::MediaAcquisitionDenied(kind),
            MediaError::DeviceUnavailable(kind) | MediaError::DeviceError { kind, .. } => {
                CallError::MediaUnavailable(kind)
            }
        }
    }
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        CallError::RelayUnavailable(err.to_string())
    }
}

impl From<PeerError> for CallError {
    fn from(err: PeerError) -> Self {
        match err {
            PeerError::NoActiveVideoSender => CallError::NoActiveVideoSender,
            other => CallError::NegotiationFailed(other.to_string()),
        }
    }
}

/// Call manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallManagerConfig {
    /// Maximum concurrent calls
    pub max_concurrent_calls: usize,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 10,
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

struct ScreenShare {
    track: Arc<LocalTrack>,
    watcher: CancellationToken,
}

struct Session {
    call_id: CallId,
    serial: u64,
    role: CallRole,
    state: CallState,
    flags: MediaFlags,
    media: LocalMedia,
    screen: Option<ScreenShare>,
    /// A screen share start or stop is suspended on capture or replacement
    screen_busy: bool,
    remote_tracks: Vec<RemoteTrackInfo>,
    /// Remote tracks announced before the connection came up
    pending_remote: Vec<RemoteTrackInfo>,
    controller: Option<Arc<PeerConnectionController>>,
    cancel: CancellationToken,
    /// Fired once `initiate` stops touching the session
    setup: CancellationToken,
    ending: bool,
    /// `end_call` arrived while a teardown was already running
    end_requested: bool,
    /// Fired once the session is released and removed
    torn_down: CancellationToken,
    events: SessionEvents,
    created_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
}

impl Session {
    fn new(call_id: CallId, serial: u64, role: CallRole, observers: Vec<EventSender>) -> Self {
        Self {
            events: SessionEvents::new(call_id.clone(), observers),
            call_id,
            serial,
            role,
            state: CallState::Idle,
            flags: MediaFlags::default(),
            media: LocalMedia::default(),
            screen: None,
            screen_busy: false,
            remote_tracks: Vec::new(),
            pending_remote: Vec::new(),
            controller: None,
            cancel: CancellationToken::new(),
            setup: CancellationToken::new(),
            ending: false,
            end_requested: false,
            torn_down: CancellationToken::new(),
            created_at: Utc::now(),
            connected_at: None,
        }
    }

    fn transition(&mut self, to: CallState) -> bool {
        if !self.state.can_transition_to(to) {
            tracing::warn!(
                call_id = %self.call_id,
                from = ?self.state,
                to = ?to,
                "Rejected call state transition"
            );
            return false;
        }
        tracing::debug!(
            call_id = %self.call_id,
            old_state = ?self.state,
            new_state = ?to,
            "Call state transition"
        );
        let from = self.state;
        self.state = to;
        self.events.state_changed(from, to);
        true
    }

    /// Move into a terminal state and notify observers for the last time
    fn finish(&mut self, to: CallState, error: Option<ErrorKind>) {
        let from = self.state;
        if !from.can_transition_to(to) {
            tracing::warn!(call_id = %self.call_id, from = ?from, to = ?to, "Unexpected terminal transition");
        }
        tracing::debug!(
            call_id = %self.call_id,
            old_state = ?from,
            new_state = ?to,
            "Call state transition"
        );
        self.state = to;
        self.events.finish(from, to, error);
    }

    fn attach(&mut self, media: LocalMedia, controller: Arc<PeerConnectionController>) {
        self.flags = MediaFlags {
            video_enabled: media.video().is_some_and(|t| t.is_enabled()),
            audio_enabled: media.audio().is_some_and(|t| t.is_enabled()),
            screen_sharing: false,
        };
        self.media = media;
        self.controller = Some(controller);
    }

    fn take_resources(&mut self) -> Teardown {
        Teardown {
            call_id: self.call_id.clone(),
            controller: self.controller.take(),
            media: std::mem::take(&mut self.media),
            screen: self.screen.take(),
            remote_tracks: self.remote_tracks.len() + self.pending_remote.len(),
        }
    }

    fn info(&self) -> CallSessionInfo {
        let mut local_tracks = self.media.track_ids();
        if let Some(share) = &self.screen {
            local_tracks.push(share.track.id().to_string());
        }
        CallSessionInfo {
            call_id: self.call_id.clone(),
            role: self.role,
            state: self.state,
            flags: self.flags,
            local_tracks,
            remote_tracks: self.remote_tracks.clone(),
            created_at: self.created_at,
            connected_at: self.connected_at,
        }
    }
}

/// Everything a session holds that must be closed or released
struct Teardown {
    call_id: CallId,
    controller: Option<Arc<PeerConnectionController>>,
    media: LocalMedia,
    screen: Option<ScreenShare>,
    remote_tracks: usize,
}

impl Teardown {
    async fn run(self) {
        if let Some(share) = self.screen {
            share.watcher.cancel();
            share.track.stop();
        }
        if let Some(controller) = self.controller {
            controller.close().await;
        }
        let released = self.media.release_all();
        tracing::debug!(
            call_id = %self.call_id,
            released,
            remote_tracks = self.remote_tracks,
            "Session media released"
        );
    }
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<CallId, Session>,
    /// Terminal state of sessions that ended without `end_call`
    terminated: HashMap<CallId, CallState>,
    /// Observers registered before their session exists
    pending_observers: HashMap<CallId, Vec<EventSender>>,
}

struct Inner {
    config: CallManagerConfig,
    capture: MediaCaptureAdapter,
    signaling: SignalingHandler,
    peers: Arc<dyn PeerTransportFactory>,
    registry: Mutex<Registry>,
    next_serial: AtomicU64,
}

// ============================================================================
// Call Manager
// ============================================================================

/// Call manager
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct CallManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallManager")
            .field("config", &self.inner.config)
            .field("sessions", &self.inner.registry.lock().sessions.len())
            .finish()
    }
}

impl CallManager {
    /// Create a call manager
    #[must_use]
    pub fn new(
        config: CallManagerConfig,
        capture: Arc<dyn CaptureBackend>,
        signaling: Arc<dyn SignalingTransport>,
        peers: Arc<dyn PeerTransportFactory>,
    ) -> Self {
        tracing::debug!(
            max_concurrent_calls = config.max_concurrent_calls,
            capture = capture.backend_type(),
            "Call manager created"
        );
        Self {
            inner: Arc::new(Inner {
                config,
                capture: MediaCaptureAdapter::new(capture),
                signaling: SignalingHandler::new(signaling),
                peers,
                registry: Mutex::new(Registry::default()),
                next_serial: AtomicU64::new(1),
            }),
        }
    }

    /// Manager configuration
    #[must_use]
    pub fn config(&self) -> &CallManagerConfig {
        &self.inner.config
    }

    /// Relay client used by this manager
    #[must_use]
    pub fn signaling(&self) -> &SignalingHandler {
        &self.inner.signaling
    }

    /// Start a call session
    ///
    /// Acquires local media, subscribes to the relay, creates the peer
    /// connection and starts negotiating. The offerer's offer is on its way to
    /// the relay when this returns; the answerer waits for the offer.
    ///
    /// # Errors
    ///
    /// - `DuplicateSession` if the id is in use
    /// - `CallLimitReached` if too many sessions are live
    /// - `MediaAcquisitionDenied` / `MediaUnavailable` if capture fails
    /// - `RelayUnavailable` if the relay cannot be subscribed
    /// - `NegotiationFailed` if the connection cannot start
    /// - `Aborted` if `end_call` ran meanwhile
    ///
    /// On error the registry has no entry for the id and every acquired
    /// device has been released.
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn initiate(
        &self,
        call_id: CallId,
        role: CallRole,
        want_video: bool,
        want_audio: bool,
    ) -> Result<CallSessionInfo, CallError> {
        let constraints = MediaConstraints {
            audio: want_audio,
            video: want_video,
        };
        let (serial, cancel, setup) = self.reserve(&call_id, role)?;

        // Also fires if this future is dropped mid-setup.
        let setup = setup.drop_guard();
        let established = self
            .establish(&call_id, serial, role, constraints, &cancel)
            .await;
        drop(setup);

        match established {
            Ok(info) => {
                tracing::info!(tracks = info.local_tracks.len(), "Call session initiated");
                Ok(info)
            }
            Err(error) => {
                tracing::warn!(error = %error, "Call setup failed");
                self.terminate(&call_id, Some(serial), CallState::Failed, Some(error.kind()), false)
                    .await;
                Err(error)
            }
        }
    }

    fn reserve(
        &self,
        call_id: &CallId,
        role: CallRole,
    ) -> Result<(u64, CancellationToken, CancellationToken), CallError> {
        let mut guard = self.inner.registry.lock();
        let registry = &mut *guard;

        if registry.sessions.contains_key(call_id) || registry.terminated.contains_key(call_id) {
            tracing::warn!("Session already exists");
            return Err(CallError::DuplicateSession(call_id.clone()));
        }
        let limit = self.inner.config.max_concurrent_calls;
        if registry.sessions.len() >= limit {
            tracing::warn!(limit, "Maximum concurrent calls reached");
            return Err(CallError::CallLimitReached(limit));
        }

        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        let observers = registry.pending_observers.remove(call_id).unwrap_or_default();
        let mut session = Session::new(call_id.clone(), serial, role, observers);
        session.transition(CallState::AcquiringMedia);
        let (cancel, setup) = (session.cancel.clone(), session.setup.clone());
        registry.sessions.insert(call_id.clone(), session);
        Ok((serial, cancel, setup))
    }

    async fn establish(
        &self,
        call_id: &CallId,
        serial: u64,
        role: CallRole,
        constraints: MediaConstraints,
        cancel: &CancellationToken,
    ) -> Result<CallSessionInfo, CallError> {
        // Dropping the acquisition future releases whatever it had acquired.
        let media = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CallError::Aborted(call_id.clone())),
            media = self.inner.capture.acquire_user_media(constraints) => media?,
        };

        let subscription = match self.inner.signaling.subscribe(call_id) {
            Ok(subscription) => subscription,
            Err(e) => {
                media.release_all();
                return Err(e.into());
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let controller = match PeerConnectionController::new(
            call_id.clone(),
            role,
            self.inner.peers.as_ref(),
            &media,
            events_tx,
        )
        .await
        {
            Ok(controller) => Arc::new(controller),
            Err(e) => {
                media.release_all();
                return Err(e.into());
            }
        };

        let rejected = {
            let mut registry = self.inner.registry.lock();
            match registry
                .sessions
                .get_mut(call_id)
                .filter(|s| s.serial == serial && !s.ending)
            {
                Some(session) => {
                    session.attach(media, Arc::clone(&controller));
                    session.transition(CallState::Negotiating);
                    None
                }
                None => Some(media),
            }
        };
        if let Some(media) = rejected {
            controller.close().await;
            media.release_all();
            return Err(CallError::Aborted(call_id.clone()));
        }

        if let Err(e) = controller.negotiate().await {
            if cancel.is_cancelled() {
                return Err(CallError::Aborted(call_id.clone()));
            }
            return Err(e.into());
        }

        tokio::spawn(self.clone().drive(
            call_id.clone(),
            serial,
            controller,
            subscription,
            events_rx,
            cancel.clone(),
        ));

        self.snapshot(call_id, serial)
            .ok_or_else(|| CallError::Aborted(call_id.clone()))
    }

    /// Pump one session: relay → controller, controller → relay and observers
    async fn drive(
        self,
        call_id: CallId,
        serial: u64,
        controller: Arc<PeerConnectionController>,
        mut subscription: Subscription,
        mut events: mpsc::UnboundedReceiver<ControllerEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if self.on_controller_event(&call_id, serial, event).await.is_break() {
                        break;
                    }
                }
                payload = subscription.recv() => match payload {
                    Some(payload) => {
                        if controller.apply_remote_signal(payload).is_err() {
                            break;
                        }
                    }
                    None => {
                        tracing::warn!(call_id = %call_id, "Relay closed the signaling stream");
                        self.terminate(
                            &call_id,
                            Some(serial),
                            CallState::Failed,
                            Some(ErrorKind::RelayUnavailable),
                            true,
                        )
                        .await;
                        break;
                    }
                },
            }
        }
        tracing::trace!(call_id = %call_id, "Session driver stopped");
    }

    async fn on_controller_event(
        &self,
        call_id: &CallId,
        serial: u64,
        event: ControllerEvent,
    ) -> ControlFlow<()> {
        match event {
            ControllerEvent::Outbound(payload) => {
                if let Err(e) = self.inner.signaling.send_payload(call_id, payload).await {
                    tracing::error!(call_id = %call_id, error = %e, "Relay rejected outbound signaling");
                    self.terminate(
                        call_id,
                        Some(serial),
                        CallState::Failed,
                        Some(ErrorKind::RelayUnavailable),
                        true,
                    )
                    .await;
                    return ControlFlow::Break(());
                }
            }
            ControllerEvent::StateChanged(state) => {
                return self.on_peer_state(call_id, serial, state).await;
            }
            ControllerEvent::RemoteTrack(track) => self.on_remote_track(call_id, serial, track),
            ControllerEvent::Error(error) => {
                let kind = CallError::from(error).kind();
                self.with_session(call_id, serial, |s| s.events.error(kind));
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_peer_state(
        &self,
        call_id: &CallId,
        serial: u64,
        state: PeerConnectionState,
    ) -> ControlFlow<()> {
        match state {
            PeerConnectionState::Connected => {
                self.with_session(call_id, serial, |s| {
                    if s.state != CallState::Negotiating || !s.transition(CallState::Connected) {
                        return;
                    }
                    s.connected_at = Some(Utc::now());
                    s.events.connected();
                    if !s.pending_remote.is_empty() {
                        s.remote_tracks.append(&mut s.pending_remote);
                        s.events.remote_stream(s.remote_tracks.clone());
                    }
                    tracing::info!(call_id = %call_id, "Call connected");
                });
                ControlFlow::Continue(())
            }
            PeerConnectionState::Disconnected => {
                tracing::warn!(call_id = %call_id, "Peer connection interrupted");
                ControlFlow::Continue(())
            }
            PeerConnectionState::Failed => {
                self.terminate(call_id, Some(serial), CallState::Failed, None, true)
                    .await;
                ControlFlow::Break(())
            }
            PeerConnectionState::Closed => {
                tracing::info!(call_id = %call_id, "Peer closed the call");
                self.terminate(call_id, Some(serial), CallState::Ended, None, true)
                    .await;
                ControlFlow::Break(())
            }
            PeerConnectionState::New | PeerConnectionState::Connecting => ControlFlow::Continue(()),
        }
    }

    fn on_remote_track(&self, call_id: &CallId, serial: u64, track: RemoteTrackInfo) {
        self.with_session(call_id, serial, |s| {
            let known = s
                .remote_tracks
                .iter()
                .chain(&s.pending_remote)
                .any(|t| t.id == track.id);
            if known {
                return;
            }
            if s.state == CallState::Connected {
                s.remote_tracks.push(track);
                s.events.remote_stream(s.remote_tracks.clone());
            } else {
                s.pending_remote.push(track);
            }
        });
    }

    /// Run `f` on a live session, matching the setup generation
    fn with_session<R>(
        &self,
        call_id: &CallId,
        serial: u64,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        let mut registry = self.inner.registry.lock();
        registry
            .sessions
            .get_mut(call_id)
            .filter(|s| s.serial == serial && !s.ending)
            .map(f)
    }

    fn snapshot(&self, call_id: &CallId, serial: u64) -> Option<CallSessionInfo> {
        self.with_session(call_id, serial, |s| s.info())
    }

    /// Tear a session down and remove it
    ///
    /// `serial` restricts the teardown to one setup generation. With
    /// `remember` the terminal state stays queryable until `end_call`.
    /// Without it the caller is ending the call itself: a teardown already
    /// under way is awaited and leaves no terminal state behind.
    ///
    /// Returns once the connection is closed, every local track is released
    /// and the entry is gone, or `false` if there was nothing to tear down.
    async fn terminate(
        &self,
        call_id: &CallId,
        serial: Option<u64>,
        to: CallState,
        error: Option<ErrorKind>,
        remember: bool,
    ) -> bool {
        let started = {
            let mut registry = self.inner.registry.lock();
            let Some(session) = registry.sessions.get_mut(call_id) else {
                return false;
            };
            if serial.is_some_and(|serial| serial != session.serial) {
                return false;
            }
            if session.ending {
                if remember {
                    return false;
                }
                session.end_requested = true;
                Err(session.torn_down.clone())
            } else {
                session.ending = true;
                session.cancel.cancel();
                Ok((
                    session.take_resources(),
                    session.setup.clone(),
                    session.torn_down.clone(),
                ))
            }
        };

        let (teardown, setup, torn_down) = match started {
            Ok(parts) => parts,
            Err(torn_down) => {
                tracing::debug!(call_id = %call_id, "Waiting for teardown in progress");
                torn_down.cancelled().await;
                return true;
            }
        };

        // Runs detached so a dropped caller cannot strand the session half torn down.
        let manager = self.clone();
        let id = call_id.clone();
        let task = tokio::spawn(async move {
            teardown.run().await;
            // Whatever initiate built after the cancel is released before it lets go.
            setup.cancelled().await;

            let session = {
                let mut registry = manager.inner.registry.lock();
                let session = registry.sessions.remove(&id);
                let ended_by_caller = session.as_ref().is_some_and(|s| s.end_requested);
                if remember && !ended_by_caller {
                    registry.terminated.insert(id.clone(), to);
                }
                session
            };
            if let Some(mut session) = session {
                session.finish(to, error);
            }
            torn_down.cancel();
        });
        if let Err(e) = task.await {
            tracing::error!(call_id = %call_id, error = %e, "Session teardown task failed");
        }
        true
    }

    /// Flip the camera track's enabled flag
    ///
    /// Returns the new state, or `false` if there is no session or no camera
    /// track.
    pub fn toggle_video(&self, call_id: &CallId) -> bool {
        self.toggle(call_id, TrackKind::Video)
    }

    /// Flip the microphone track's enabled flag
    ///
    /// Returns the new state, or `false` if there is no session or no
    /// microphone track.
    pub fn toggle_audio(&self, call_id: &CallId) -> bool {
        self.toggle(call_id, TrackKind::Audio)
    }

    fn toggle(&self, call_id: &CallId, kind: TrackKind) -> bool {
        let mut registry = self.inner.registry.lock();
        let Some(session) = registry.sessions.get_mut(call_id).filter(|s| !s.ending) else {
            tracing::debug!(call_id = %call_id, kind = %kind, "Toggle on unknown call");
            return false;
        };
        let Some(track) = session.media.track(kind).cloned() else {
            tracing::debug!(call_id = %call_id, kind = %kind, "Toggle without local track");
            return false;
        };

        let enabled = track.toggle();
        match kind {
            TrackKind::Audio => session.flags.audio_enabled = enabled,
            TrackKind::Video => session.flags.video_enabled = enabled,
            TrackKind::ScreenShare => {}
        }
        tracing::debug!(call_id = %call_id, kind = %kind, enabled, "Local track toggled");
        enabled
    }

    /// Send a screen capture instead of the camera
    ///
    /// The capture replaces the track of the existing video sender; the call
    /// is not renegotiated. When the capture ends on its own (the user stops
    /// sharing from the platform UI) the camera is restored automatically.
    ///
    /// Returns `false` if there is no session, the connection has no video
    /// sender, a share is already active, or capture is refused.
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn start_screen_share(&self, call_id: &CallId) -> bool {
        let (serial, controller, session_cancel) = {
            let mut registry = self.inner.registry.lock();
            let Some(session) = registry.sessions.get_mut(call_id).filter(|s| !s.ending) else {
                tracing::debug!("Screen share on unknown call");
                return false;
            };
            if session.screen.is_some() || session.screen_busy {
                tracing::debug!("Screen share already active");
                return false;
            }
            let Some(controller) = session.controller.clone() else {
                tracing::debug!("Screen share before the connection exists");
                return false;
            };
            if !controller.has_video_sender() {
                tracing::info!("No active video sender, screen share refused");
                return false;
            }
            session.screen_busy = true;
            (session.serial, controller, session.cancel.clone())
        };

        let screen = match self.inner.capture.acquire_screen().await {
            Ok(track) => track,
            Err(e) => {
                tracing::warn!(error = %e, "Screen capture unavailable");
                self.with_session(call_id, serial, |s| s.screen_busy = false);
                return false;
            }
        };

        if let Err(e) = controller
            .replace_outgoing_video_track(Arc::clone(&screen))
            .await
        {
            tracing::warn!(error = %e, "Failed to substitute screen capture");
            screen.stop();
            self.with_session(call_id, serial, |s| s.screen_busy = false);
            return false;
        }

        let watcher = session_cancel.child_token();
        let committed = self
            .with_session(call_id, serial, |s| {
                s.screen_busy = false;
                s.flags.screen_sharing = true;
                s.screen = Some(ScreenShare {
                    track: Arc::clone(&screen),
                    watcher: watcher.clone(),
                });
            })
            .is_some();
        if !committed {
            screen.stop();
            return false;
        }

        let manager = self.clone();
        let id = call_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watcher.cancelled() => {}
                _ = screen.source_ended() => {
                    tracing::info!(call_id = %id, "Screen capture ended by the platform");
                    manager.stop_screen_share(&id).await;
                }
            }
        });

        tracing::info!("Screen share started");
        true
    }

    /// Put the camera back on the video sender and release the screen capture
    ///
    /// Returns `false` if no share was active, or if the camera could not be
    /// put back; the share then stays active and observers get an
    /// `Error` event.
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn stop_screen_share(&self, call_id: &CallId) -> bool {
        let (serial, controller, camera) = {
            let mut registry = self.inner.registry.lock();
            let Some(session) = registry.sessions.get_mut(call_id).filter(|s| !s.ending) else {
                return false;
            };
            if session.screen_busy {
                return false;
            }
            if session.screen.is_none() {
                tracing::debug!("No active screen share");
                return false;
            }
            session.screen_busy = true;
            (
                session.serial,
                session.controller.clone(),
                session.media.video().cloned(),
            )
        };

        if let (Some(controller), Some(camera)) = (controller, camera) {
            if let Err(e) = controller.replace_outgoing_video_track(camera).await {
                tracing::warn!(error = %e, "Failed to restore camera track");
                let kind = CallError::from(e).kind();
                self.with_session(call_id, serial, |s| {
                    s.screen_busy = false;
                    s.events.error(kind);
                });
                return false;
            }
        }

        let share = self
            .with_session(call_id, serial, |s| {
                s.screen_busy = false;
                s.flags.screen_sharing = false;
                s.screen.take()
            })
            .flatten();
        // Otherwise the session is being torn down and the teardown stops it.
        if let Some(share) = share {
            share.watcher.cancel();
            share.track.stop();
        }

        tracing::info!("Screen share stopped");
        true
    }

    /// End a call
    ///
    /// Closes the connection, releases every local track and removes the
    /// session. Safe in every state: during setup it cancels the pending
    /// `initiate`, and if the session is already being torn down (the peer
    /// hung up, the connection failed) it waits for that to finish. When
    /// this returns the id is free for a new `initiate`. Unknown ids and
    /// repeated calls are no-ops.
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn end_call(&self, call_id: &CallId) {
        let ended = self
            .terminate(call_id, None, CallState::Ended, None, false)
            .await;

        // After the teardown, so a failure finishing meanwhile is cleared too.
        let forgotten = self.inner.registry.lock().terminated.remove(call_id);
        if let Some(state) = forgotten {
            tracing::debug!(state = ?state, "Cleared terminated call");
        }

        if ended {
            tracing::info!("Call ended");
        } else {
            tracing::debug!("Nothing to end");
        }
    }

    /// Apply a signaling payload received outside the relay subscription
    ///
    /// Goes through the same queue as relay deliveries. Returns `false` if
    /// the call has no connection to apply it to.
    pub fn handle_signaling(&self, call_id: &CallId, payload: SignalingPayload) -> bool {
        let controller = self
            .inner
            .registry
            .lock()
            .sessions
            .get(call_id)
            .filter(|s| !s.ending)
            .and_then(|s| s.controller.clone());

        match controller {
            Some(controller) => controller.apply_remote_signal(payload).is_ok(),
            None => {
                tracing::debug!(call_id = %call_id, payload = payload.kind(), "Signaling for unknown call dropped");
                false
            }
        }
    }

    /// Register an observer for a call's events
    ///
    /// If no session with this id is live, the observer is attached to the
    /// next session created with it. Such an observer is held until then or
    /// until its receiver is dropped. The receiver closes once the session
    /// is terminal.
    pub fn subscribe(&self, call_id: &CallId) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.inner.registry.lock();
        let registry = &mut *guard;
        match registry.sessions.get_mut(call_id).filter(|s| !s.ending) {
            Some(session) => session.events.add_observer(tx),
            None => {
                registry.pending_observers.retain(|_, observers| {
                    observers.retain(|observer| !observer.is_closed());
                    !observers.is_empty()
                });
                registry
                    .pending_observers
                    .entry(call_id.clone())
                    .or_default()
                    .push(tx);
            }
        }
        rx
    }

    #[cfg(test)]
    fn pending_observer_count(&self) -> usize {
        self.inner
            .registry
            .lock()
            .pending_observers
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Snapshot of a live session
    #[must_use]
    pub fn session(&self, call_id: &CallId) -> Option<CallSessionInfo> {
        self.inner
            .registry
            .lock()
            .sessions
            .get(call_id)
            .map(Session::info)
    }

    /// Snapshots of every live session, ordered by call id
    #[must_use]
    pub fn sessions(&self) -> Vec<CallSessionInfo> {
        let mut sessions: Vec<CallSessionInfo> = self
            .inner
            .registry
            .lock()
            .sessions
            .values()
            .map(Session::info)
            .collect();
        sessions.sort_by(|a, b| a.call_id.as_str().cmp(b.call_id.as_str()));
        sessions
    }

    /// Current state of a call
    ///
    /// Reports the terminal state of calls that ended or failed without
    /// `end_call`. That state is kept, and the id stays reserved, until
    /// `end_call` or `shutdown` clears it.
    #[must_use]
    pub fn call_state(&self, call_id: &CallId) -> Option<CallState> {
        let registry = self.inner.registry.lock();
        registry
            .sessions
            .get(call_id)
            .map(|s| s.state)
            .or_else(|| registry.terminated.get(call_id).copied())
    }

    /// Number of live sessions
    #[must_use]
    pub fn active_call_count(&self) -> usize {
        self.inner.registry.lock().sessions.len()
    }

    /// End every call and forget terminated ones
    pub async fn shutdown(&self) {
        let call_ids: Vec<CallId> = self.inner.registry.lock().sessions.keys().cloned().collect();
        for call_id in &call_ids {
            self.end_call(call_id).await;
        }
        let mut registry = self.inner.registry.lock();
        registry.terminated.clear();
        registry.pending_observers.clear();
        tracing::info!(ended = call_ids.len(), "Call manager shut down");
    }
}
