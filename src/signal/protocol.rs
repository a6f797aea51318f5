//! Signaling protocol messages
//!
//! Requests and responses travel as JSON objects tagged by `type`, one per
//! WebSocket frame. Binary frames carry the same JSON encoded as UTF-8.

use crate::config::IceServer;
use crate::error::{Error, Result};
use crate::rtc::peer::{SessionDescription, TrackKind};
use serde::{Deserialize, Serialize};

/// Which peer connection a signaling message is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalTarget {
    Publisher,
    Subscriber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackSource {
    #[default]
    Unknown,
    Camera,
    Microphone,
    ScreenShare,
    ScreenShareAudio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoQuality {
    #[default]
    Low,
    Medium,
    High,
    Off,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TrackInfo {
    pub sid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: Option<TrackKind>,
    #[serde(default)]
    pub source: TrackSource,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ParticipantInfo {
    pub sid: String,
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub tracks: Vec<TrackInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RoomInfo {
    pub sid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub metadata: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClientConfigSetting {
    #[default]
    Unset,
    Disabled,
    Enabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClientConfiguration {
    #[serde(default)]
    pub force_relay: ClientConfigSetting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JoinResponse {
    #[serde(default)]
    pub room: RoomInfo,
    #[serde(default)]
    pub participant: ParticipantInfo,
    #[serde(default)]
    pub other_participants: Vec<ParticipantInfo>,
    #[serde(default)]
    pub server_version: String,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(default)]
    pub subscriber_primary: bool,
    #[serde(default)]
    pub client_configuration: Option<ClientConfiguration>,
}

impl JoinResponse {
    pub fn forces_relay(&self) -> bool {
        self.client_configuration
            .as_ref()
            .map(|c| c.force_relay == ClientConfigSetting::Enabled)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackPublishedResponse {
    pub cid: String,
    pub track: TrackInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerInfo {
    pub sid: String,
    pub level: f32,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionQualityInfo {
    pub participant_sid: String,
    pub quality: String,
    #[serde(default)]
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStateInfo {
    pub participant_sid: String,
    pub track_sid: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribedQuality {
    pub quality: VideoQuality,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPermissionUpdate {
    pub participant_sid: String,
    pub track_sid: String,
    pub allowed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AddTrackRequest {
    pub cid: String,
    pub name: String,
    pub kind: Option<TrackKind>,
    #[serde(default)]
    pub source: TrackSource,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub disable_dtx: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UpdateTrackSettings {
    pub track_sids: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub quality: VideoQuality,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoLayer {
    pub quality: VideoQuality,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub bitrate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantTracks {
    pub participant_sid: String,
    pub track_sids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UpdateSubscription {
    pub track_sids: Vec<String>,
    pub subscribe: bool,
    #[serde(default)]
    pub participant_tracks: Vec<ParticipantTracks>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackPermission {
    pub participant_sid: String,
    #[serde(default)]
    pub all_tracks: bool,
    #[serde(default)]
    pub track_sids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SubscriptionPermission {
    pub all_participants: bool,
    #[serde(default)]
    pub track_permissions: Vec<TrackPermission>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChannelInfo {
    pub label: String,
    pub id: u16,
    pub target: SignalTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncState {
    pub answer: Option<SessionDescription>,
    pub subscription: UpdateSubscription,
    #[serde(default)]
    pub publish_tracks: Vec<TrackPublishedResponse>,
    #[serde(default)]
    pub data_channels: Vec<DataChannelInfo>,
}

/// Server-side failure injection, for testing reconnects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulateScenario {
    NodeFailure,
    Migration,
    ServerLeave,
    SpeakerUpdate(u32),
}

/// Client-to-server messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalRequest {
    Offer {
        description: SessionDescription,
    },
    Answer {
        description: SessionDescription,
    },
    Trickle {
        candidate_init: String,
        target: SignalTarget,
    },
    Mute {
        sid: String,
        muted: bool,
    },
    AddTrack(AddTrackRequest),
    UpdateTrackSettings(UpdateTrackSettings),
    UpdateVideoLayers {
        track_sid: String,
        layers: Vec<VideoLayer>,
    },
    Subscription(UpdateSubscription),
    SubscriptionPermission(SubscriptionPermission),
    SyncState(SyncState),
    Simulate {
        scenario: SimulateScenario,
    },
    Leave,
}

impl SignalRequest {
    /// Whether the request may be buffered while the socket reconnects
    ///
    /// Negotiation and session-control messages are only meaningful on the
    /// socket they were produced for.
    pub fn can_enqueue(&self) -> bool {
        !matches!(
            self,
            SignalRequest::SyncState(_)
                | SignalRequest::Trickle { .. }
                | SignalRequest::Offer { .. }
                | SignalRequest::Answer { .. }
                | SignalRequest::Simulate { .. }
                | SignalRequest::Leave
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            SignalRequest::Offer { .. } => "offer",
            SignalRequest::Answer { .. } => "answer",
            SignalRequest::Trickle { .. } => "trickle",
            SignalRequest::Mute { .. } => "mute",
            SignalRequest::AddTrack(_) => "add_track",
            SignalRequest::UpdateTrackSettings(_) => "update_track_settings",
            SignalRequest::UpdateVideoLayers { .. } => "update_video_layers",
            SignalRequest::Subscription(_) => "subscription",
            SignalRequest::SubscriptionPermission(_) => "subscription_permission",
            SignalRequest::SyncState(_) => "sync_state",
            SignalRequest::Simulate { .. } => "simulate",
            SignalRequest::Leave => "leave",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize request: {}", e)))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Serialization(format!("Invalid signal request: {}", e)))
    }
}

/// Server-to-client messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalResponse {
    Join(JoinResponse),
    Answer {
        description: SessionDescription,
    },
    Offer {
        description: SessionDescription,
    },
    Trickle {
        candidate_init: String,
        target: SignalTarget,
    },
    Update {
        participants: Vec<ParticipantInfo>,
    },
    RoomUpdate {
        room: RoomInfo,
    },
    TrackPublished(TrackPublishedResponse),
    TrackUnpublished {
        track_sid: String,
    },
    SpeakersChanged {
        speakers: Vec<SpeakerInfo>,
    },
    ConnectionQuality {
        updates: Vec<ConnectionQualityInfo>,
    },
    Mute {
        sid: String,
        muted: bool,
    },
    Leave {
        #[serde(default)]
        can_reconnect: bool,
    },
    StreamStateUpdate {
        stream_states: Vec<StreamStateInfo>,
    },
    SubscribedQualityUpdate {
        track_sid: String,
        subscribed_qualities: Vec<SubscribedQuality>,
    },
    SubscriptionPermissionUpdate(SubscriptionPermissionUpdate),
    RefreshToken {
        token: String,
    },
    Pong {
        timestamp: i64,
    },
}

impl SignalResponse {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Serialization(format!("Invalid signal response: {}", e)))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| Error::Serialization(format!("Signal frame is not UTF-8: {}", e)))?;
        Self::from_json(text)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize response: {}", e)))
    }
}
