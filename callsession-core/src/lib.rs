//! Callsession - peer-to-peer call session management
//!
//! Orchestrates one-to-one audio/video calls between two parties (for
//! example a customer and a remote technician):
//!
//! - **Media capture**: camera, microphone and screen sources with
//!   guaranteed release, through a pluggable [`CaptureBackend`]
//! - **Signaling relay**: offers, answers and ICE candidates routed by call
//!   id through any [`SignalingTransport`]
//! - **Negotiation**: one [`PeerConnectionController`] per call with ordered,
//!   duplicate-tolerant application of inbound signaling
//! - **Session registry**: [`CallManager`] owns every session and its state
//!   machine, and notifies per-session observers
//!
//! # Examples
//!
//! ```rust,no_run
//! use callsession_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), CallError> {
//! let (customer_relay, _technician_relay) = InMemoryRelay::pair();
//! let manager = CallManager::new(
//!     CallManagerConfig::default(),
//!     Arc::new(SyntheticCaptureBackend::new()),
//!     Arc::new(customer_relay),
//!     Arc::new(SimulatedTransportFactory::new()),
//! );
//!
//! let call_id = CallId::new("ticket-4711");
//! let mut events = manager.subscribe(&call_id);
//! manager.initiate(call_id.clone(), CallRole::Offerer, true, true).await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Core types shared by every component
pub mod types;

/// Local media capture
pub mod media;

/// Signaling relay client
pub mod signaling;

/// Peer connection negotiation
pub mod peer;

/// In-process negotiation primitive
pub mod sim;

/// Negotiation primitive over the webrtc crate (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod webrtc_transport;

/// Per-session event delivery
pub mod events;

/// Call session registry and lifecycle
pub mod call;

/// Configuration
pub mod config;

pub use call::{CallError, CallManager, CallManagerConfig};
pub use config::{ConfigError, IceServerConfig, PeerConfig, SessionConfig};
pub use events::EventReceiver;
pub use media::{
    CaptureBackend, CaptureHandle, LocalMedia, LocalTrack, MediaCaptureAdapter, MediaError,
    SyntheticCaptureBackend,
};
pub use peer::{
    ControllerEvent, PeerConnectionController, PeerConnectionState, PeerError, PeerTransport,
    PeerTransportEvent, PeerTransportFactory, SdpKind, SenderId,
};
pub use signaling::{
    InMemoryRelay, RelayEndpoint, SignalingError, SignalingHandler, SignalingTransport,
    Subscription,
};
pub use sim::{SimOptions, SimulatedPeerTransport, SimulatedTransportFactory};
pub use types::{
    CallEvent, CallId, CallRole, CallSessionInfo, CallState, ErrorKind, IceCandidate,
    MediaConstraints, MediaFlags, RemoteTrackInfo, SignalingPayload, TrackKind,
};
#[cfg(feature = "webrtc-backend")]
pub use webrtc_transport::{WebRtcPeerTransport, WebRtcTransportFactory};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        CallError, CallEvent, CallId, CallManager, CallManagerConfig, CallRole, CallSessionInfo,
        CallState, CaptureBackend, ErrorKind, EventReceiver, InMemoryRelay, MediaConstraints,
        PeerConfig, PeerTransportFactory, SessionConfig, SignalingPayload, SignalingTransport,
        SimulatedTransportFactory, SyntheticCaptureBackend, TrackKind,
    };

    #[cfg(feature = "webrtc-backend")]
    pub use crate::WebRtcTransportFactory;
}
