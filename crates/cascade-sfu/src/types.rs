//! Core identifiers and media-plane types shared across the service.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};

/// Identity of a conference participant.
///
/// No two participants in a conference may share an id; the triple is the
/// equality key everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantId {
    /// Matrix user id, e.g. `@alice:example.org`.
    pub user_id: String,
    /// Device the call leg belongs to (the wire `party_id`).
    pub device_id: String,
    /// The 1:1 call leg id within the conference.
    pub call_id: String,
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.device_id, self.call_id)
    }
}

/// Opaque id of a published track, unique per publishing participant.
///
/// Cheap to clone; it rides on every forwarded RTP packet's event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackId(Arc<str>);

impl TrackId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TrackId {
    fn from(value: String) -> Self {
        Self(Arc::from(value.as_str()))
    }
}

impl From<&str> for TrackId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A simulcast quality layer. `None` denotes audio or non-simulcast video.
///
/// Ordered: `None < Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SimulcastLayer {
    None,
    Low,
    Medium,
    High,
}

impl SimulcastLayer {
    /// Map a simulcast restriction id to a layer. Publishing clients tag
    /// their encodings `f`/`h`/`q` (full, half, quarter); anything else is
    /// treated as non-simulcast.
    #[must_use]
    pub fn from_rid(rid: &str) -> Self {
        match rid {
            "f" => SimulcastLayer::High,
            "h" => SimulcastLayer::Medium,
            "q" => SimulcastLayer::Low,
            _ => SimulcastLayer::None,
        }
    }

    #[must_use]
    pub fn as_rid(&self) -> &'static str {
        match self {
            SimulcastLayer::High => "f",
            SimulcastLayer::Medium => "h",
            SimulcastLayer::Low => "q",
            SimulcastLayer::None => "",
        }
    }
}

impl fmt::Display for SimulcastLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SimulcastLayer::None => "none",
            SimulcastLayer::Low => "low",
            SimulcastLayer::Medium => "medium",
            SimulcastLayer::High => "high",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for TrackKind {
    fn from(value: RTPCodecType) -> Self {
        match value {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Immutable description of a published track.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub id: TrackId,
    pub stream_id: String,
    pub kind: TrackKind,
    pub codec: RTCRtpCodecCapability,
}

/// Why a participant left the conference. Carried on the signaling hangup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// The client hung up or the peer signalled a clean leave.
    ClientLeft,
    /// ICE connectivity was lost or never established.
    IceFailed,
    /// The DTLS handshake failed.
    DtlsFailed,
    /// No pong within the keepalive window.
    KeepaliveTimeout,
    /// A new session for the same participant replaced this one.
    SessionReplaced,
    /// The call was answered on a different device.
    AnsweredElsewhere,
    /// The conference itself is shutting down.
    ConferenceEnded,
}

impl LeaveReason {
    /// The reason string used on the wire.
    #[must_use]
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            LeaveReason::ClientLeft => "user_hangup",
            LeaveReason::IceFailed => "ice_failed",
            LeaveReason::DtlsFailed => "dtls_failed",
            LeaveReason::KeepaliveTimeout => "keepalive_timeout",
            LeaveReason::SessionReplaced => "replaced",
            LeaveReason::AnsweredElsewhere => "answered_elsewhere",
            LeaveReason::ConferenceEnded => "conference_ended",
        }
    }
}

impl fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire_str())
    }
}
