//! Peer connection seam, transports and stats

pub mod peer;
pub mod stats;
pub mod transport;
#[cfg(feature = "webrtc-rs")]
pub mod webrtc_peer;

pub use peer::{
    DataChannel, DataChannelEvent, DataChannelInit, DataChannelState, IceCandidate,
    PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, RemoteTrack,
    SdpType, SessionDescription, SignalingState, TrackKind,
};
pub use stats::TrackStats;
pub use transport::{Transport, TransportEvent, TransportOptions};
#[cfg(feature = "webrtc-rs")]
pub use webrtc_peer::WebRtcPeerFactory;
