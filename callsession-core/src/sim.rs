//! In-process negotiation primitive
//!
//! [`SimulatedPeerTransport`] follows the WebRTC signaling rules (a remote
//! answer needs a local offer, candidates need a remote description) and
//! produces well-formed SDP and host candidates, but moves no media. It
//! reports `Connected` once both descriptions and at least one remote
//! candidate have been applied. Used by the demo CLI and by tests that need
//! deterministic negotiation.

use crate::media::LocalTrack;
use crate::peer::{
    PeerConnectionState, PeerError, PeerTransport, PeerTransportEvent, PeerTransportFactory,
    SdpKind, SenderId,
};
use crate::types::{CallId, IceCandidate, RemoteTrackInfo, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const SIM_STREAM_ID: &str = "callsession";

/// Failure and timing injection for [`SimulatedPeerTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimOptions {
    /// Local candidates gathered after each local description
    pub candidate_count: u16,
    /// Make `create_offer` fail
    pub fail_offer: bool,
    /// Make `set_remote_description` fail
    pub fail_remote_description: bool,
    /// Suspend `close` for this long before closing
    pub close_delay: Option<Duration>,
    /// Suspend the factory's `create` for this long
    pub create_delay: Option<Duration>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            candidate_count: 2,
            fail_offer: false,
            fail_remote_description: false,
            close_delay: None,
            create_delay: None,
        }
    }
}

#[derive(Debug)]
struct Sender {
    id: SenderId,
    kind: TrackKind,
    track_id: String,
}

#[derive(Debug)]
struct SimState {
    senders: Vec<Sender>,
    local: Option<SdpKind>,
    remote: Option<SdpKind>,
    remote_tracks: Vec<RemoteTrackInfo>,
    remote_candidates: usize,
    connection: PeerConnectionState,
    offers_created: usize,
    answers_created: usize,
    replacements: usize,
}

/// Simulated peer connection for one call
#[derive(Debug)]
pub struct SimulatedPeerTransport {
    call_id: CallId,
    session_tag: u64,
    options: SimOptions,
    events: mpsc::UnboundedSender<PeerTransportEvent>,
    state: Mutex<SimState>,
    fail_replacements: AtomicBool,
}

impl SimulatedPeerTransport {
    /// Create a transport reporting on `events`
    #[must_use]
    pub fn new(
        call_id: CallId,
        options: SimOptions,
        events: mpsc::UnboundedSender<PeerTransportEvent>,
    ) -> Self {
        Self {
            call_id,
            session_tag: u64::from(uuid::Uuid::new_v4().as_fields().0),
            options,
            events,
            state: Mutex::new(SimState {
                senders: Vec::new(),
                local: None,
                remote: None,
                remote_tracks: Vec::new(),
                remote_candidates: 0,
                connection: PeerConnectionState::New,
                offers_created: 0,
                answers_created: 0,
                replacements: 0,
            }),
            fail_replacements: AtomicBool::new(false),
        }
    }

    fn emit(&self, event: PeerTransportEvent) {
        let _ = self.events.send(event);
    }

    fn render_sdp(&self, kind: SdpKind, senders: &[Sender]) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=x-sim-type:{}\r\n",
            self.session_tag,
            match kind {
                SdpKind::Offer => "offer",
                SdpKind::Answer => "answer",
            }
        );
        for sender in senders {
            let media = if sender.kind.is_video() { "video" } else { "audio" };
            sdp.push_str(&format!(
                "m={media} 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{}\r\na=msid:{SIM_STREAM_ID} {}\r\n",
                sender.id.0, sender.track_id
            ));
        }
        sdp
    }

    fn parse_remote_tracks(sdp: &str) -> Result<Vec<RemoteTrackInfo>, PeerError> {
        if !sdp.starts_with("v=0") {
            return Err(PeerError::NegotiationFailed(
                "session description must start with v=0".to_string(),
            ));
        }
        let mut tracks = Vec::new();
        let mut current: Option<TrackKind> = None;
        for line in sdp.lines() {
            if let Some(media) = line.strip_prefix("m=") {
                current = match media.split_whitespace().next() {
                    Some("audio") => Some(TrackKind::Audio),
                    Some("video") => Some(TrackKind::Video),
                    _ => None,
                };
            } else if let Some(msid) = line.strip_prefix("a=msid:") {
                if let (Some(kind), Some(track_id)) = (current, msid.split_whitespace().nth(1)) {
                    tracks.push(RemoteTrackInfo {
                        id: track_id.to_string(),
                        kind,
                    });
                }
            }
        }
        Ok(tracks)
    }

    fn gather_candidates(&self) {
        for n in 0..self.options.candidate_count {
            let port = 50_000u16.saturating_add(n);
            self.emit(PeerTransportEvent::LocalCandidate(IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 2122260223 127.0.0.1 {port} typ host",
                    self.session_tag.wrapping_add(u64::from(n))
                ),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            }));
        }
    }

    /// Report `Connected` once everything needed has been applied
    fn maybe_connect(&self, state: &mut SimState) -> Vec<PeerTransportEvent> {
        let ready = state.local.is_some() && state.remote.is_some() && state.remote_candidates > 0;
        if !ready || state.connection != PeerConnectionState::Connecting {
            return Vec::new();
        }
        state.connection = PeerConnectionState::Connected;
        tracing::debug!(call_id = %self.call_id, "Simulated connection established");

        let mut events = vec![PeerTransportEvent::StateChanged(PeerConnectionState::Connected)];
        events.extend(
            state
                .remote_tracks
                .iter()
                .cloned()
                .map(PeerTransportEvent::RemoteTrack),
        );
        events
    }

    fn ensure_open(state: &SimState) -> Result<(), PeerError> {
        if state.connection.is_terminal() {
            return Err(PeerError::Closed);
        }
        Ok(())
    }

    fn set_local(&self, kind: SdpKind) -> Result<String, PeerError> {
        let sdp = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            if state.local.is_some() {
                return Err(PeerError::InvalidState(
                    "local description already set".to_string(),
                ));
            }
            match kind {
                SdpKind::Offer => {
                    if state.remote.is_some() {
                        return Err(PeerError::InvalidState(
                            "cannot offer after a remote offer".to_string(),
                        ));
                    }
                    state.offers_created += 1;
                }
                SdpKind::Answer => {
                    if state.remote != Some(SdpKind::Offer) {
                        return Err(PeerError::InvalidState(
                            "cannot answer without a remote offer".to_string(),
                        ));
                    }
                    state.answers_created += 1;
                }
            }
            state.local = Some(kind);
            if state.connection == PeerConnectionState::New {
                state.connection = PeerConnectionState::Connecting;
                self.emit(PeerTransportEvent::StateChanged(
                    PeerConnectionState::Connecting,
                ));
            }
            self.render_sdp(kind, &state.senders)
        };
        self.gather_candidates();

        let events = self.maybe_connect(&mut self.state.lock());
        for event in events {
            self.emit(event);
        }
        Ok(sdp)
    }

    /// Simulate the peer closing its side
    pub fn simulate_remote_close(&self) {
        let mut state = self.state.lock();
        if state.connection.is_terminal() {
            return;
        }
        state.connection = PeerConnectionState::Closed;
        self.emit(PeerTransportEvent::StateChanged(PeerConnectionState::Closed));
    }

    /// Simulate an unrecoverable connectivity failure
    pub fn simulate_failure(&self) {
        let mut state = self.state.lock();
        if state.connection.is_terminal() {
            return;
        }
        state.connection = PeerConnectionState::Failed;
        self.emit(PeerTransportEvent::StateChanged(PeerConnectionState::Failed));
    }

    /// Simulate a transient connectivity loss
    pub fn simulate_disconnect(&self) {
        let state = self.state.lock();
        if state.connection == PeerConnectionState::Connected {
            self.emit(PeerTransportEvent::StateChanged(
                PeerConnectionState::Disconnected,
            ));
        }
    }

    /// Make every later `replace_track` fail (or succeed again)
    pub fn fail_replacements(&self, fail: bool) {
        self.fail_replacements.store(fail, Ordering::SeqCst);
    }

    /// Current connection state
    #[must_use]
    pub fn connection_state(&self) -> PeerConnectionState {
        self.state.lock().connection
    }

    /// Whether `close` was called or the peer closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().connection == PeerConnectionState::Closed
    }

    /// Offers produced so far
    #[must_use]
    pub fn offers_created(&self) -> usize {
        self.state.lock().offers_created
    }

    /// Answers produced so far
    #[must_use]
    pub fn answers_created(&self) -> usize {
        self.state.lock().answers_created
    }

    /// Remote candidates applied so far
    #[must_use]
    pub fn remote_candidate_count(&self) -> usize {
        self.state.lock().remote_candidates
    }

    /// Number of outbound senders
    #[must_use]
    pub fn sender_count(&self) -> usize {
        self.state.lock().senders.len()
    }

    /// Successful track replacements
    #[must_use]
    pub fn replacement_count(&self) -> usize {
        self.state.lock().replacements
    }

    /// Track id currently feeding the first video sender
    #[must_use]
    pub fn video_sender_track(&self) -> Option<String> {
        self.state
            .lock()
            .senders
            .iter()
            .find(|s| s.kind.is_video())
            .map(|s| s.track_id.clone())
    }
}

#[async_trait]
impl PeerTransport for SimulatedPeerTransport {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<SenderId, PeerError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        let id = SenderId(u32::try_from(state.senders.len()).unwrap_or(u32::MAX));
        state.senders.push(Sender {
            id,
            kind: track.kind(),
            track_id: track.id().to_string(),
        });
        Ok(id)
    }

    async fn replace_track(&self, sender: SenderId, track: Arc<LocalTrack>) -> Result<(), PeerError> {
        if self.fail_replacements.load(Ordering::SeqCst) {
            return Err(PeerError::Transport("simulated replacement failure".to_string()));
        }
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        let slot = state
            .senders
            .iter_mut()
            .find(|s| s.id == sender)
            .ok_or_else(|| PeerError::InvalidState(format!("unknown sender {}", sender.0)))?;
        if slot.kind.is_video() != track.kind().is_video() {
            return Err(PeerError::InvalidState(
                "replacement track kind does not match sender".to_string(),
            ));
        }
        slot.track_id = track.id().to_string();
        state.replacements += 1;
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, PeerError> {
        if self.options.fail_offer {
            return Err(PeerError::Transport("simulated offer failure".to_string()));
        }
        self.set_local(SdpKind::Offer)
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        self.set_local(SdpKind::Answer)
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), PeerError> {
        if self.options.fail_remote_description {
            return Err(PeerError::Transport(
                "simulated remote description failure".to_string(),
            ));
        }
        let tracks = Self::parse_remote_tracks(&sdp)?;
        let events = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            if state.remote.is_some() {
                return Err(PeerError::InvalidState(
                    "remote description already set".to_string(),
                ));
            }
            match kind {
                SdpKind::Offer if state.local.is_some() => {
                    return Err(PeerError::InvalidState(
                        "remote offer after local description".to_string(),
                    ));
                }
                SdpKind::Answer if state.local != Some(SdpKind::Offer) => {
                    return Err(PeerError::InvalidState(
                        "remote answer without local offer".to_string(),
                    ));
                }
                _ => {}
            }
            state.remote = Some(kind);
            state.remote_tracks = tracks;
            if state.connection == PeerConnectionState::New {
                state.connection = PeerConnectionState::Connecting;
                self.emit(PeerTransportEvent::StateChanged(
                    PeerConnectionState::Connecting,
                ));
            }
            self.maybe_connect(&mut state)
        };
        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if !candidate.candidate.starts_with("candidate:") {
            return Err(PeerError::NegotiationFailed(format!(
                "malformed candidate: {}",
                candidate.candidate
            )));
        }
        let events = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            if state.remote.is_none() {
                return Err(PeerError::InvalidState(
                    "remote description not set".to_string(),
                ));
            }
            state.remote_candidates += 1;
            self.maybe_connect(&mut state)
        };
        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        if let Some(delay) = self.options.close_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if state.connection == PeerConnectionState::Closed {
            return Ok(());
        }
        state.connection = PeerConnectionState::Closed;
        self.emit(PeerTransportEvent::StateChanged(PeerConnectionState::Closed));
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "SimulatedPeerTransport"
    }
}

/// Factory producing [`SimulatedPeerTransport`]s
///
/// Keeps every transport it created so tests and the demo can reach in and
/// simulate remote events.
#[derive(Debug, Default)]
pub struct SimulatedTransportFactory {
    options: Mutex<SimOptions>,
    created: Mutex<Vec<Arc<SimulatedPeerTransport>>>,
}

impl SimulatedTransportFactory {
    /// Factory with default options
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with the given options
    #[must_use]
    pub fn with_options(options: SimOptions) -> Self {
        Self {
            options: Mutex::new(options),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Replace the options used for transports created from now on
    pub fn set_options(&self, options: SimOptions) {
        *self.options.lock() = options;
    }

    /// Every transport created so far
    #[must_use]
    pub fn transports(&self) -> Vec<Arc<SimulatedPeerTransport>> {
        self.created.lock().clone()
    }

    /// Most recently created transport
    #[must_use]
    pub fn last(&self) -> Option<Arc<SimulatedPeerTransport>> {
        self.created.lock().last().cloned()
    }

    /// Most recently created transport for a call
    #[must_use]
    pub fn for_call(&self, call_id: &CallId) -> Option<Arc<SimulatedPeerTransport>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|t| &t.call_id == call_id)
            .cloned()
    }
}

#[async_trait]
impl PeerTransportFactory for SimulatedTransportFactory {
    async fn create(
        &self,
        call_id: &CallId,
        events: mpsc::UnboundedSender<PeerTransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        let options = self.options.lock().clone();
        if let Some(delay) = options.create_delay {
            tokio::time::sleep(delay).await;
        }
        let transport = Arc::new(SimulatedPeerTransport::new(
            call_id.clone(),
            options,
            events,
        ));
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::{MediaCaptureAdapter, SyntheticCaptureBackend};
    use crate::types::MediaConstraints;

    fn transport() -> (SimulatedPeerTransport, mpsc::UnboundedReceiver<PeerTransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SimulatedPeerTransport::new(CallId::new("sim"), SimOptions::default(), tx),
            rx,
        )
    }

    #[tokio::test]
    async fn test_offer_lists_tracks() {
        let capture = MediaCaptureAdapter::new(Arc::new(SyntheticCaptureBackend::new()));
        let media = capture
            .acquire_user_media(MediaConstraints::video_call())
            .await
            .unwrap();
        let (sim, _rx) = transport();
        for track in media.tracks() {
            sim.add_track(Arc::clone(track)).await.unwrap();
        }

        let offer = sim.create_offer().await.unwrap();
        let tracks = SimulatedPeerTransport::parse_remote_tracks(&offer).unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].kind, TrackKind::Audio);
        assert_eq!(tracks[1].kind, TrackKind::Video);
        assert_eq!(tracks[1].id, media.video().unwrap().id());
    }

    #[tokio::test]
    async fn test_candidate_requires_remote_description() {
        let (sim, _rx) = transport();
        let result = sim
            .add_ice_candidate(IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 1 typ host"))
            .await;
        assert!(matches!(result, Err(PeerError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_answer_requires_local_offer() {
        let (sim, _rx) = transport();
        let result = sim
            .set_remote_description(SdpKind::Answer, "v=0\r\n".to_string())
            .await;
        assert!(matches!(result, Err(PeerError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_connects_after_candidate() {
        let (offerer, mut rx) = transport();
        offerer.create_offer().await.unwrap();
        offerer
            .set_remote_description(SdpKind::Answer, "v=0\r\n".to_string())
            .await
            .unwrap();
        assert_eq!(offerer.connection_state(), PeerConnectionState::Connecting);

        offerer
            .add_ice_candidate(IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 1 typ host"))
            .await
            .unwrap();
        assert_eq!(offerer.connection_state(), PeerConnectionState::Connected);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        let candidates = events
            .iter()
            .filter(|e| matches!(e, PeerTransportEvent::LocalCandidate(_)))
            .count();
        assert_eq!(candidates, 2);
        assert_eq!(
            events.last(),
            Some(&PeerTransportEvent::StateChanged(PeerConnectionState::Connected))
        );
    }

    #[tokio::test]
    async fn test_close_reports_closed_once() {
        let (sim, mut rx) = transport();
        sim.close().await.unwrap();
        sim.close().await.unwrap();
        sim.simulate_remote_close();

        assert_eq!(
            rx.try_recv().unwrap(),
            PeerTransportEvent::StateChanged(PeerConnectionState::Closed)
        );
        assert!(rx.try_recv().is_err());
    }
}
