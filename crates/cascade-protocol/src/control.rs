//! The SFU <-> peer control protocol carried over the data channel.
//!
//! Messages are JSON objects discriminated by a `type` field. Parsing is
//! deliberately forgiving: unknown message types are reported as
//! [`ControlParseError::UnknownType`] so the caller can log and ignore them,
//! fields the receiver does not know are skipped, and missing resolution
//! fields on a subscribe entry default to zero (the SFU then picks the
//! lowest quality layer).

use crate::metadata::StreamMetadataMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A control message, in either direction.
///
/// | type | direction | purpose |
/// |------|-----------|---------|
/// | `track_subscription` | peer -> SFU | change the peer's subscriptions |
/// | `negotiate` | both | SDP renegotiation over the data channel |
/// | `ping` | SFU -> peer | keepalive probe |
/// | `pong` | peer -> SFU | keepalive reply |
/// | `metadata_changed` | both | announce the current set of streams |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    TrackSubscription {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        subscribe: Vec<SubscribeRequest>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        unsubscribe: Vec<UnsubscribeRequest>,
    },
    Negotiate {
        description: SessionDescription,
        #[serde(default, skip_serializing_if = "StreamMetadataMap::is_empty")]
        stream_metadata: StreamMetadataMap,
    },
    Ping,
    Pong,
    MetadataChanged {
        #[serde(default)]
        stream_metadata: StreamMetadataMap,
    },
}

/// One track the peer wants to receive, with its preferred resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    #[serde(rename = "trackId")]
    pub track_id: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

/// One track the peer no longer wants to receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    #[serde(rename = "trackId")]
    pub track_id: String,
}

/// An SDP description exchanged in a `negotiate` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SdpType {
    Offer,
    Answer,
    /// Anything this build does not understand; handled as a protocol error
    /// by the conference, not a parse failure.
    Unknown,
}

impl From<String> for SdpType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "offer" => SdpType::Offer,
            "answer" => SdpType::Answer,
            _ => SdpType::Unknown,
        }
    }
}

impl From<SdpType> for String {
    fn from(value: SdpType) -> Self {
        match value {
            SdpType::Offer => "offer".to_owned(),
            SdpType::Answer => "answer".to_owned(),
            SdpType::Unknown => "unknown".to_owned(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ControlParseError {
    /// The `type` field named a message this build does not know. Receivers
    /// must ignore these to stay compatible with newer peers.
    #[error("unrecognized control message type `{0}`")]
    UnknownType(String),

    /// The payload was not valid JSON, or a known message had the wrong
    /// shape.
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ControlMessage {
    const KNOWN_TYPES: &'static [&'static str] = &[
        "track_subscription",
        "negotiate",
        "ping",
        "pong",
        "metadata_changed",
    ];

    /// Parse a control message from raw data-channel bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, ControlParseError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        let message_type = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();

        if !Self::KNOWN_TYPES.contains(&message_type) {
            return Err(ControlParseError::UnknownType(message_type.to_owned()));
        }

        Ok(serde_json::from_value(value)?)
    }

    /// Encode for sending over the data channel.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
