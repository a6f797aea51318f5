//! Peer connection seam
//!
//! The engine and transports only talk to these traits. The webrtc-rs
//! adapter lives in `webrtc_peer`; tests drive in-memory fakes.

use crate::config::RtcConfiguration;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// SDP blob plus its role in the offer/answer exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in its JSON init form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Parse the JSON string carried by trickle messages
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Protocol(format!("invalid candidate init: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// States that call for a reconnect
    pub fn is_lost(&self) -> bool {
        matches!(
            self,
            PeerConnectionState::Disconnected | PeerConnectionState::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Data channel creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataChannelInit {
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

impl DataChannelInit {
    pub fn reliable() -> Self {
        Self {
            ordered: true,
            max_retransmits: None,
        }
    }

    pub fn lossy() -> Self {
        Self {
            ordered: false,
            max_retransmits: Some(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Remote media track announced by a peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub track_id: String,
    pub stream_ids: Vec<String>,
    pub kind: TrackKind,
}

/// One RTP stream entry from a stats report
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtpStreamSample {
    pub ssrc: String,
    pub track_id: String,
    pub kind: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub codec: Option<String>,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    ConnectionStateChanged(PeerConnectionState),
    IceCandidate(IceCandidate),
    DataChannel(Arc<dyn DataChannel>),
    TrackAdded(RemoteTrack),
    TrackRemoved(RemoteTrack),
    NegotiationNeeded,
}

pub type PeerEventHandler = Arc<dyn Fn(PeerEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChannelEvent {
    StateChanged(DataChannelState),
    Message(Bytes),
}

pub type DataChannelEventHandler = Arc<dyn Fn(DataChannelEvent) + Send + Sync>;

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn id(&self) -> Option<u16>;

    fn ready_state(&self) -> DataChannelState;

    async fn send(&self, data: Bytes) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Replace the event listener; `None` detaches it
    fn set_event_handler(&self, handler: Option<DataChannelEventHandler>);
}

impl fmt::Debug for dyn DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.label())
            .field("id", &self.id())
            .finish()
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn remote_description(&self) -> Option<SessionDescription>;

    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> PeerConnectionState;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn create_data_channel(
        &self,
        label: &str,
        init: DataChannelInit,
    ) -> Result<Arc<dyn DataChannel>>;

    /// Detach every local sender
    async fn remove_all_senders(&self) -> Result<()>;

    async fn stats(&self) -> Result<Vec<RtpStreamSample>>;

    /// Replace the event listener; `None` detaches it
    fn set_event_handler(&self, handler: Option<PeerEventHandler>);

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, config: &RtcConfiguration) -> Result<Arc<dyn PeerConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_init_json_shape() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let json = candidate.to_json().unwrap();
        assert!(json.contains("\"sdpMid\":\"0\""));
        assert!(json.contains("\"sdpMLineIndex\":0"));
        assert_eq!(IceCandidate::from_json(&json).unwrap(), candidate);
    }

    #[test]
    fn test_candidate_parse_error_is_protocol() {
        assert!(matches!(
            IceCandidate::from_json("{}"),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_description_serializes_type_field() {
        let json = serde_json::to_string(&SessionDescription::offer("v=0")).unwrap();
        assert_eq!(json, r#"{"type":"offer","sdp":"v=0"}"#);
    }
}
