//! Data channel packets
//!
//! Packets travel as JSON on the publisher's `_reliable` and `_lossy`
//! channels. User payloads are base64 inside the JSON envelope.

use crate::error::{Error, Result};
use crate::rtc::peer::DataChannelInit;
use crate::signal::protocol::SpeakerInfo;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub const RELIABLE_LABEL: &str = "_reliable";
pub const LOSSY_LABEL: &str = "_lossy";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Reliability {
    #[default]
    Reliable,
    Lossy,
}

impl Reliability {
    pub fn label(&self) -> &'static str {
        match self {
            Reliability::Reliable => RELIABLE_LABEL,
            Reliability::Lossy => LOSSY_LABEL,
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            RELIABLE_LABEL => Some(Reliability::Reliable),
            LOSSY_LABEL => Some(Reliability::Lossy),
            _ => None,
        }
    }

    pub fn channel_init(&self) -> DataChannelInit {
        match self {
            Reliability::Reliable => DataChannelInit::reliable(),
            Reliability::Lossy => DataChannelInit::lossy(),
        }
    }
}

/// Application payload sent by one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UserPacket {
    #[serde(default)]
    pub participant_sid: String,
    #[serde(with = "base64_payload")]
    pub payload: Bytes,
    #[serde(default)]
    pub destination_sids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

impl UserPacket {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ActiveSpeakerUpdate {
    pub speakers: Vec<SpeakerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataPacketValue {
    User(UserPacket),
    Speaker(ActiveSpeakerUpdate),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPacket {
    pub kind: Reliability,
    pub value: DataPacketValue,
}

impl DataPacket {
    pub fn user(packet: UserPacket, kind: Reliability) -> Self {
        Self {
            kind,
            value: DataPacketValue::User(packet),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| Error::Serialization(format!("invalid data packet: {}", e)))
    }
}

mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_packet_payload_is_base64() {
        let packet = DataPacket::user(UserPacket::new(&b"hello"[..]), Reliability::Lossy);
        let encoded = packet.encode().unwrap();
        let json = std::str::from_utf8(&encoded).unwrap();
        assert!(json.contains("\"payload\":\"aGVsbG8=\""));
        assert!(json.contains("\"kind\":\"lossy\""));

        let decoded = DataPacket::decode(&encoded).unwrap();
        match decoded.value {
            DataPacketValue::User(user) => assert_eq!(&user.payload[..], b"hello"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_speaker_packet_decodes() {
        let json = r#"{"kind":"reliable","value":{"type":"speaker","speakers":[{"sid":"PA_1","level":0.5,"active":true}]}}"#;
        let packet = DataPacket::decode(json.as_bytes()).unwrap();
        match packet.value {
            DataPacketValue::Speaker(update) => {
                assert_eq!(update.speakers.len(), 1);
                assert_eq!(update.speakers[0].sid, "PA_1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_garbage_is_serialization_error() {
        assert!(matches!(
            DataPacket::decode(b"\x00\x01"),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_labels() {
        assert_eq!(Reliability::from_label("_lossy"), Some(Reliability::Lossy));
        assert_eq!(Reliability::from_label("chat"), None);
        assert_eq!(Reliability::Reliable.channel_init(), DataChannelInit::reliable());
    }
}
