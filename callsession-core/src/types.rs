//! Call session types and data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Caller-supplied identifier of a call
///
/// The id is opaque to this crate. It is the registry key for sessions and the
/// address used on the signaling relay, so both parties must agree on it
/// out of band (typically the id of the appointment or call record).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Wrap an externally supplied identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Which side of the offer/answer exchange a session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallRole {
    /// Produces the offer
    Offerer,
    /// Waits for the offer and produces the answer
    Answerer,
}

impl CallRole {
    /// Check if this side creates the offer
    #[must_use]
    pub fn is_offerer(self) -> bool {
        matches!(self, Self::Offerer)
    }
}

/// Media constraints for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Enable audio
    pub audio: bool,
    /// Enable video
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Check if audio is enabled
    pub fn has_audio(&self) -> bool {
        self.audio
    }

    /// Check if video is enabled
    pub fn has_video(&self) -> bool {
        self.video
    }

    /// Check if no modality was requested
    pub fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }

    /// Convert to the track kinds that must be captured, audio first
    pub fn to_track_kinds(&self) -> Vec<TrackKind> {
        let mut kinds = Vec::new();
        if self.audio {
            kinds.push(TrackKind::Audio);
        }
        if self.video {
            kinds.push(TrackKind::Video);
        }
        kinds
    }
}

/// Kinds of media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    /// Microphone audio
    Audio,
    /// Camera video
    Video,
    /// Screen capture video
    ScreenShare,
}

impl TrackKind {
    /// Whether the track carries video frames
    #[must_use]
    pub fn is_video(self) -> bool {
        matches!(self, Self::Video | Self::ScreenShare)
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::ScreenShare => "screen",
        };
        f.write_str(name)
    }
}

/// Call state enumeration
///
/// ```text
///     Idle
///       │
///       ▼
///  AcquiringMedia ────────┐
///       │                 │
///       ▼                 ▼
///  Negotiating ───────► Failed
///       │                 ▲
///       ▼                 │
///   Connected ────────────┘
///       │
///       ▼
///     Ended
/// ```
///
/// `Ended` and `Failed` are terminal. `end_call` may also end a session that
/// never connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// Session object exists, nothing started
    Idle,
    /// Waiting on local capture devices
    AcquiringMedia,
    /// Offer/answer and candidate exchange in progress
    Negotiating,
    /// Media path established
    Connected,
    /// Closed locally or by the peer
    Ended,
    /// Acquisition, negotiation or relay failure
    Failed,
}

impl CallState {
    /// No transition leaves a terminal state
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    /// Check whether `self → to` is an edge of the session state machine
    #[must_use]
    pub fn can_transition_to(self, to: CallState) -> bool {
        matches!(
            (self, to),
            (Self::Idle, Self::AcquiringMedia)
                | (Self::AcquiringMedia, Self::Negotiating)
                | (Self::Negotiating, Self::Connected)
                // Failures
                | (Self::AcquiringMedia, Self::Failed)
                | (Self::Negotiating, Self::Failed)
                | (Self::Connected, Self::Failed)
                // Explicit end is allowed from every live state
                | (Self::Idle, Self::Ended)
                | (Self::AcquiringMedia, Self::Ended)
                | (Self::Negotiating, Self::Ended)
                | (Self::Connected, Self::Ended)
        )
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Local toggle flags of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaFlags {
    /// Camera track enabled
    pub video_enabled: bool,
    /// Microphone track enabled
    pub audio_enabled: bool,
    /// Screen capture is replacing the camera on the video sender
    pub screen_sharing: bool,
}

/// ICE candidate carried by the relay
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// SDP media ID
    pub sdp_mid: Option<String>,
    /// SDP media line index
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate with no media association
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Signaling payload exchanged through the relay
///
/// Opaque to the call manager; only the peer connection controller looks
/// inside.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingPayload {
    /// Session description offer
    Offer {
        /// SDP content
        sdp: String,
    },
    /// Session description answer
    Answer {
        /// SDP content
        sdp: String,
    },
    /// Trickled ICE candidate
    IceCandidate {
        /// The candidate
        #[serde(flatten)]
        candidate: IceCandidate,
    },
}

impl SignalingPayload {
    /// Short name used in logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice_candidate",
        }
    }

    /// Check if this payload carries a session description
    #[must_use]
    pub fn is_description(&self) -> bool {
        matches!(self, Self::Offer { .. } | Self::Answer { .. })
    }

    /// Encode as the JSON frame carried over a relay
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode a JSON relay frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not a valid payload
    pub fn from_json(frame: &str) -> serde_json::Result<Self> {
        serde_json::from_str(frame)
    }
}

/// Error category carried by [`CallEvent::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Platform denied camera/microphone/screen access
    MediaAcquisitionDenied,
    /// No capture device for a requested modality
    MediaUnavailable,
    /// A live session already uses the call id
    DuplicateSession,
    /// Track replacement without an outgoing video sender
    NoActiveVideoSender,
    /// Offer/answer or ICE failed
    NegotiationFailed,
    /// Relay could not carry signaling
    RelayUnavailable,
    /// Concurrent call limit reached
    CallLimitReached,
    /// Session ended while it was being set up
    Aborted,
}

/// Remote track surfaced to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrackInfo {
    /// Track id assigned by the remote peer
    pub id: String,
    /// Track kind
    pub kind: TrackKind,
}

/// Lifecycle notification delivered to session observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallEvent {
    /// Session state changed
    StateChanged {
        /// Call identifier
        call_id: CallId,
        /// Previous state
        from: CallState,
        /// New state
        to: CallState,
    },
    /// Remote media became available
    RemoteStream {
        /// Call identifier
        call_id: CallId,
        /// All remote tracks received so far
        tracks: Vec<RemoteTrackInfo>,
    },
    /// Media path established
    Connected {
        /// Call identifier
        call_id: CallId,
    },
    /// Session ended
    Ended {
        /// Call identifier
        call_id: CallId,
    },
    /// Error surfaced for the session
    Error {
        /// Call identifier
        call_id: CallId,
        /// What went wrong
        kind: ErrorKind,
    },
}

impl CallEvent {
    /// Call this event belongs to
    #[must_use]
    pub fn call_id(&self) -> &CallId {
        match self {
            Self::StateChanged { call_id, .. }
            | Self::RemoteStream { call_id, .. }
            | Self::Connected { call_id }
            | Self::Ended { call_id }
            | Self::Error { call_id, .. } => call_id,
        }
    }
}

/// Snapshot of a call session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSessionInfo {
    /// Call identifier
    pub call_id: CallId,
    /// Offer/answer role
    pub role: CallRole,
    /// Current state
    pub state: CallState,
    /// Toggle flags
    pub flags: MediaFlags,
    /// Ids of the local tracks owned by the session
    pub local_tracks: Vec<String>,
    /// Remote tracks received so far
    pub remote_tracks: Vec<RemoteTrackInfo>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// When the session reached `Connected`
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallSessionInfo {
    /// Get call duration
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.connected_at.map(|start| Utc::now() - start)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_is_caller_supplied() {
        let id = CallId::new("call-1");
        assert_eq!(id.as_str(), "call-1");
        assert_eq!(id, CallId::from("call-1"));
        assert_eq!(id.to_string(), "call-1");
    }

    #[test]
    fn test_media_constraints() {
        let audio = MediaConstraints::audio_only();
        assert!(audio.has_audio());
        assert!(!audio.has_video());
        assert_eq!(audio.to_track_kinds(), vec![TrackKind::Audio]);

        let video = MediaConstraints::video_call();
        assert_eq!(
            video.to_track_kinds(),
            vec![TrackKind::Audio, TrackKind::Video]
        );

        let none = MediaConstraints {
            audio: false,
            video: false,
        };
        assert!(none.is_empty());
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        let all = [
            CallState::Idle,
            CallState::AcquiringMedia,
            CallState::Negotiating,
            CallState::Connected,
            CallState::Ended,
            CallState::Failed,
        ];
        for from in [CallState::Ended, CallState::Failed] {
            assert!(from.is_terminal());
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_setup_path_transitions() {
        assert!(CallState::Idle.can_transition_to(CallState::AcquiringMedia));
        assert!(CallState::AcquiringMedia.can_transition_to(CallState::Negotiating));
        assert!(CallState::Negotiating.can_transition_to(CallState::Connected));
        assert!(CallState::Connected.can_transition_to(CallState::Ended));
        assert!(CallState::AcquiringMedia.can_transition_to(CallState::Failed));

        assert!(!CallState::Idle.can_transition_to(CallState::Connected));
        assert!(!CallState::Connected.can_transition_to(CallState::Negotiating));
        assert!(!CallState::Idle.can_transition_to(CallState::Failed));
    }

    #[test]
    fn test_payload_json_shape() {
        let offer = SignalingPayload::Offer {
            sdp: "v=0\r\n".to_string(),
        };
        let json = offer.to_json().unwrap();
        assert!(json.contains("\"type\":\"offer\""));
        assert_eq!(SignalingPayload::from_json(&json).unwrap(), offer);

        let candidate = SignalingPayload::IceCandidate {
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            },
        };
        let json = candidate.to_json().unwrap();
        assert!(json.contains("\"type\":\"ice_candidate\""));
        assert!(json.contains("\"sdp_mid\":\"0\""));
        assert_eq!(SignalingPayload::from_json(&json).unwrap(), candidate);
    }

    #[test]
    fn test_payload_rejects_unknown_type() {
        assert!(SignalingPayload::from_json(r#"{"type":"bye"}"#).is_err());
    }

    const ALL_STATES: [CallState; 6] = [
        CallState::Idle,
        CallState::AcquiringMedia,
        CallState::Negotiating,
        CallState::Connected,
        CallState::Ended,
        CallState::Failed,
    ];

    proptest::proptest! {
        /// Walking any sequence of permitted edges never revisits a state
        /// and stops for good at a terminal one.
        #[test]
        fn prop_transitions_are_acyclic(picks in proptest::collection::vec(0usize..6, 0..16)) {
            let mut state = CallState::Idle;
            let mut visited = vec![state];
            for pick in picks {
                let to = ALL_STATES[pick];
                if !state.can_transition_to(to) {
                    continue;
                }
                proptest::prop_assert!(!state.is_terminal());
                proptest::prop_assert!(!visited.contains(&to));
                visited.push(to);
                state = to;
            }
            proptest::prop_assert!(visited.len() <= 5);
        }
    }

    #[test]
    fn test_event_call_id() {
        let event = CallEvent::Error {
            call_id: CallId::new("c"),
            kind: ErrorKind::RelayUnavailable,
        };
        assert_eq!(event.call_id().as_str(), "c");
    }
}
