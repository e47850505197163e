//! Negotiation primitive backed by the `webrtc` crate

use crate::config::PeerConfig;
use crate::media::LocalTrack;
use crate::peer::{
    PeerConnectionState, PeerError, PeerTransport, PeerTransportEvent, PeerTransportFactory,
    SdpKind, SenderId,
};
use crate::types::{CallId, IceCandidate, RemoteTrackInfo, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const STREAM_ID: &str = "callsession";

fn transport_error(context: &str) -> impl Fn(webrtc::Error) -> PeerError + '_ {
    move |e| PeerError::Transport(format!("{context}: {e}"))
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video | TrackKind::ScreenShare => RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

fn to_rtc_track(track: &LocalTrack) -> Arc<dyn TrackLocal + Send + Sync> {
    Arc::new(TrackLocalStaticSample::new(
        codec_for(track.kind()),
        track.id().to_string(),
        STREAM_ID.to_string(),
    ))
}

fn map_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// [`PeerTransport`] over an `RTCPeerConnection`
///
/// Local tracks are sample tracks; feeding them with encoded media is left to
/// the capture integration.
pub struct WebRtcPeerTransport {
    call_id: CallId,
    connection: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<SenderId, (TrackKind, Arc<RTCRtpSender>)>>,
}

impl WebRtcPeerTransport {
    fn install_handlers(&self, events: mpsc::UnboundedSender<PeerTransportEvent>) {
        let candidates = events.clone();
        let call_id = self.call_id.clone();
        self.connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let candidates = candidates.clone();
                let call_id = call_id.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        tracing::debug!(call_id = %call_id, "ICE gathering complete");
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = candidates.send(PeerTransportEvent::LocalCandidate(
                                IceCandidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                },
                            ));
                        }
                        Err(e) => {
                            tracing::warn!(call_id = %call_id, error = %e, "Failed to serialize local candidate");
                        }
                    }
                })
            }));

        let states = events.clone();
        let call_id = self.call_id.clone();
        self.connection
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                tracing::debug!(call_id = %call_id, state = %state, "RTCPeerConnection state");
                if let Some(state) = map_state(state) {
                    let _ = states.send(PeerTransportEvent::StateChanged(state));
                }
                Box::pin(async {})
            }));

        let tracks = events;
        self.connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(TrackKind::Audio),
                    RTPCodecType::Video => Some(TrackKind::Video),
                    _ => None,
                };
                if let Some(kind) = kind {
                    let _ = tracks.send(PeerTransportEvent::RemoteTrack(RemoteTrackInfo {
                        id: track.id().to_string(),
                        kind,
                    }));
                }
                Box::pin(async {})
            },
        ));
    }

    async fn apply_local(&self, description: RTCSessionDescription) -> Result<String, PeerError> {
        let sdp = description.sdp.clone();
        self.connection
            .set_local_description(description)
            .await
            .map_err(transport_error("set local description"))?;
        Ok(sdp)
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeerTransport {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<SenderId, PeerError> {
        let sender = self
            .connection
            .add_track(to_rtc_track(&track))
            .await
            .map_err(transport_error("add track"))?;

        // RTCP has to be drained for interceptors to run.
        let rtcp_reader = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_reader.read(&mut buf).await.is_ok() {}
        });

        let mut senders = self.senders.lock();
        let id = SenderId(u32::try_from(senders.len()).unwrap_or(u32::MAX));
        senders.insert(id, (track.kind(), sender));
        Ok(id)
    }

    async fn replace_track(&self, sender: SenderId, track: Arc<LocalTrack>) -> Result<(), PeerError> {
        let (kind, rtp_sender) = self
            .senders
            .lock()
            .get(&sender)
            .map(|(kind, s)| (*kind, Arc::clone(s)))
            .ok_or_else(|| PeerError::InvalidState(format!("unknown sender {}", sender.0)))?;
        if kind.is_video() != track.kind().is_video() {
            return Err(PeerError::InvalidState(
                "replacement track kind does not match sender".to_string(),
            ));
        }
        rtp_sender
            .replace_track(Some(to_rtc_track(&track)))
            .await
            .map_err(transport_error("replace track"))
    }

    async fn create_offer(&self) -> Result<String, PeerError> {
        let offer = self
            .connection
            .create_offer(None)
            .await
            .map_err(transport_error("create offer"))?;
        self.apply_local(offer).await
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(transport_error("create answer"))?;
        self.apply_local(answer).await
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), PeerError> {
        if sdp.trim().is_empty() {
            return Err(PeerError::NegotiationFailed(
                "session description cannot be empty".to_string(),
            ));
        }
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp),
        }
        .map_err(|e| PeerError::NegotiationFailed(format!("invalid session description: {e}")))?;

        self.connection
            .set_remote_description(description)
            .await
            .map_err(transport_error("set remote description"))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(transport_error("add ice candidate"))
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.connection
            .close()
            .await
            .map_err(transport_error("close"))
    }

    fn backend_type(&self) -> &'static str {
        "WebRtcPeerTransport"
    }
}

/// Factory creating one `RTCPeerConnection` per call
pub struct WebRtcTransportFactory {
    api: API,
    config: PeerConfig,
}

impl WebRtcTransportFactory {
    /// Build the WebRTC API with the default codecs and interceptors
    ///
    /// # Errors
    ///
    /// Returns error if codec or interceptor registration fails
    pub fn new(config: PeerConfig) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(transport_error("register codecs"))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(transport_error("register interceptors"))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, config })
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    #[tracing::instrument(skip(self, events), fields(call_id = %call_id))]
    async fn create(
        &self,
        call_id: &CallId,
        events: mpsc::UnboundedSender<PeerTransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        let connection = self
            .api
            .new_peer_connection(self.rtc_configuration())
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to create peer connection");
                PeerError::Transport(format!("create peer connection: {e}"))
            })?;

        let transport = WebRtcPeerTransport {
            call_id: call_id.clone(),
            connection: Arc::new(connection),
            senders: Mutex::new(HashMap::new()),
        };
        transport.install_handlers(events);
        tracing::debug!(ice_servers = self.config.ice_servers.len(), "Created RTCPeerConnection");
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::{MediaCaptureAdapter, SyntheticCaptureBackend};
    use crate::peer::{ControllerEvent, PeerConnectionController};
    use crate::types::{CallRole, MediaConstraints, SignalingPayload};

    #[test]
    fn test_rtc_configuration_carries_credentials() {
        let mut config = PeerConfig::default();
        config.ice_servers.push(crate::config::IceServerConfig {
            urls: vec!["turn:turn.example.org:3478".to_string()],
            username: Some("user".to_string()),
            credential: Some("secret".to_string()),
        });
        let factory = WebRtcTransportFactory::new(config).unwrap();
        let rtc = factory.rtc_configuration();

        assert_eq!(rtc.ice_servers.len(), 3);
        assert_eq!(rtc.ice_servers[0].urls, vec!["stun:stun.l.google.com:19302"]);
        assert_eq!(rtc.ice_servers[2].username, "user");
        assert_eq!(rtc.ice_servers[2].credential, "secret");
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            map_state(RTCPeerConnectionState::Connected),
            Some(PeerConnectionState::Connected)
        );
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), None);
    }

    #[tokio::test]
    async fn test_offer_contains_media_sections() {
        let capture = MediaCaptureAdapter::new(Arc::new(SyntheticCaptureBackend::new()));
        let media = capture
            .acquire_user_media(MediaConstraints::video_call())
            .await
            .unwrap();
        let factory = WebRtcTransportFactory::new(PeerConfig { ice_servers: vec![] }).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let controller = PeerConnectionController::new(
            CallId::new("rtc-offer"),
            CallRole::Offerer,
            &factory,
            &media,
            tx,
        )
        .await
        .unwrap();

        controller.negotiate().await.unwrap();
        let offer = loop {
            if let ControllerEvent::Outbound(SignalingPayload::Offer { sdp }) =
                rx.recv().await.unwrap()
            {
                break sdp;
            }
        };
        assert!(offer.contains("m=audio"));
        assert!(offer.contains("m=video"));
        controller.close().await;
    }

    /// Full loopback over host candidates; needs a usable network stack.
    #[tokio::test]
    #[ignore]
    async fn test_loopback_connects() {
        let capture = MediaCaptureAdapter::new(Arc::new(SyntheticCaptureBackend::new()));
        let factory = WebRtcTransportFactory::new(PeerConfig { ice_servers: vec![] }).unwrap();
        let media_a = capture
            .acquire_user_media(MediaConstraints::audio_only())
            .await
            .unwrap();
        let media_b = capture
            .acquire_user_media(MediaConstraints::audio_only())
            .await
            .unwrap();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let call = CallId::new("rtc-loopback");
        let a = PeerConnectionController::new(call.clone(), CallRole::Offerer, &factory, &media_a, tx_a)
            .await
            .unwrap();
        let b = PeerConnectionController::new(call, CallRole::Answerer, &factory, &media_b, tx_b)
            .await
            .unwrap();
        a.negotiate().await.unwrap();

        let connected = async {
            let (mut a_up, mut b_up) = (false, false);
            while !(a_up && b_up) {
                tokio::select! {
                    Some(event) = rx_a.recv() => match event {
                        ControllerEvent::Outbound(p) => b.apply_remote_signal(p).unwrap(),
                        ControllerEvent::StateChanged(PeerConnectionState::Connected) => a_up = true,
                        _ => {}
                    },
                    Some(event) = rx_b.recv() => match event {
                        ControllerEvent::Outbound(p) => a.apply_remote_signal(p).unwrap(),
                        ControllerEvent::StateChanged(PeerConnectionState::Connected) => b_up = true,
                        _ => {}
                    },
                }
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(20), connected)
            .await
            .unwrap();
        a.close().await;
        b.close().await;
    }
}
