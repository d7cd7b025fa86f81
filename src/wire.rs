//! Objects exchanged with the ground station.
//!
//! Each object is one JSON document per link block, tagged by `type`.
//! Every variant except `text` carries a creation `timestamp`, which the
//! receiving side uses as its deduplication key.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detect::Region;
use crate::frame::Timestamp;
use crate::position::Position;
use crate::settings::{SettingValue, SettingsScope};

/// Send priority for routine objects. Lower values are sent first.
pub const DEFAULT_PRIORITY: u32 = 10_000;
/// Send priority for explicitly requested objects.
pub const REQUEST_PRIORITY: u32 = 1_000;

/// Serde module for base64 encoding of byte buffers.
///
/// Use with `#[serde(with = "base64_bytes")]` on `Vec<u8>` fields.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(D::Error::custom)
    }
}

/// Composite thumbnail of the surviving regions of one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThumbPacket {
    pub timestamp: Timestamp,
    pub frame_time: Timestamp,
    pub regions: Vec<Region>,
    #[serde(with = "base64_bytes")]
    pub jpeg: Vec<u8>,
    pub position: Option<Position>,
    pub high_score: f64,
}

/// Whole frame, re-encoded for transmission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImagePacket {
    pub timestamp: Timestamp,
    pub frame_time: Timestamp,
    #[serde(with = "base64_bytes")]
    pub jpeg: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Thumbnail(ThumbPacket),
    #[serde(rename = "image")]
    FullImage(ImagePacket),
    SettingChange {
        timestamp: Timestamp,
        scope: SettingsScope,
        name: String,
        value: SettingValue,
    },
    #[serde(rename = "heartbeat")]
    HeartBeat { timestamp: Timestamp },
    Text { message: String },
    Command { timestamp: Timestamp, command: String },
    ImageRequest {
        timestamp: Timestamp,
        frame_time: Timestamp,
        #[serde(default)]
        fullres: bool,
        #[serde(default)]
        priority: Option<u32>,
    },
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed object: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("failed to encode object: {0}")]
    Encode(#[source] serde_json::Error),
}

impl Message {
    pub fn text(message: impl Into<String>) -> Self {
        Message::Text {
            message: message.into(),
        }
    }

    /// Creation timestamp, the deduplication key. `None` for text.
    pub fn stamp(&self) -> Option<Timestamp> {
        match self {
            Message::Thumbnail(pkt) => Some(pkt.timestamp),
            Message::FullImage(pkt) => Some(pkt.timestamp),
            Message::SettingChange { timestamp, .. }
            | Message::HeartBeat { timestamp }
            | Message::Command { timestamp, .. }
            | Message::ImageRequest { timestamp, .. } => Some(*timestamp),
            Message::Text { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Thumbnail(_) => "thumbnail",
            Message::FullImage(_) => "image",
            Message::SettingChange { .. } => "setting_change",
            Message::HeartBeat { .. } => "heartbeat",
            Message::Text { .. } => "text",
            Message::Command { .. } => "command",
            Message::ImageRequest { .. } => "image_request",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(WireError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(WireError::Malformed)
    }
}
