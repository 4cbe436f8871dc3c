//! Matrix to-device call event payloads.
//!
//! These are the signaling messages the SFU exchanges with clients over the
//! Matrix event bus: invite/answer for call setup, trickled ICE candidates,
//! answer selection and hangup. Identifiers (`call_id`, `conf_id`,
//! `party_id`, session ids) are opaque to the SFU and echoed back verbatim
//! on outbound events.

use crate::control::SessionDescription;
use crate::metadata::StreamMetadataMap;
use serde::{Deserialize, Serialize};

pub const CALL_INVITE: &str = "m.call.invite";
pub const CALL_ANSWER: &str = "m.call.answer";
pub const CALL_CANDIDATES: &str = "m.call.candidates";
pub const CALL_SELECT_ANSWER: &str = "m.call.select_answer";
pub const CALL_HANGUP: &str = "m.call.hangup";

/// VoIP spec version stamped on outbound events.
#[must_use]
pub fn wire_version() -> serde_json::Value {
    serde_json::Value::String("1".to_owned())
}

/// A trickled ICE candidate. An event carrying an empty `candidates` list
/// signals the end of gathering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallCandidate {
    #[serde(default)]
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InviteContent {
    pub call_id: String,
    pub conf_id: String,
    pub party_id: String,
    #[serde(default)]
    pub version: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifetime: Option<u64>,
    pub offer: SessionDescription,
    /// Candidates bundled with the invite; more may trickle separately.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<CallCandidate>,
    #[serde(default, skip_serializing_if = "StreamMetadataMap::is_empty")]
    pub sdp_stream_metadata: StreamMetadataMap,
    /// The sender's session token, echoed on everything we send back.
    #[serde(default)]
    pub sender_session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerContent {
    pub call_id: String,
    pub conf_id: String,
    pub party_id: String,
    #[serde(default)]
    pub version: serde_json::Value,
    pub answer: SessionDescription,
    #[serde(default, skip_serializing_if = "StreamMetadataMap::is_empty")]
    pub sdp_stream_metadata: StreamMetadataMap,
    #[serde(default)]
    pub sender_session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatesContent {
    pub call_id: String,
    pub conf_id: String,
    pub party_id: String,
    #[serde(default)]
    pub version: serde_json::Value,
    #[serde(default)]
    pub candidates: Vec<CallCandidate>,
    #[serde(default)]
    pub sender_session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectAnswerContent {
    pub call_id: String,
    pub conf_id: String,
    pub party_id: String,
    #[serde(default)]
    pub version: serde_json::Value,
    pub selected_party_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HangupContent {
    pub call_id: String,
    pub conf_id: String,
    pub party_id: String,
    #[serde(default)]
    pub version: serde_json::Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

/// A parsed inbound call event.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Invite(InviteContent),
    Candidates(CandidatesContent),
    SelectAnswer(SelectAnswerContent),
    Hangup(HangupContent),
}

impl CallEvent {
    /// Parse an event by its wire type. Returns `Ok(None)` for event types
    /// that are not call signaling (they are simply not for us).
    pub fn parse(
        event_type: &str,
        content: serde_json::Value,
    ) -> Result<Option<Self>, serde_json::Error> {
        let event = match event_type {
            CALL_INVITE => Some(CallEvent::Invite(serde_json::from_value(content)?)),
            CALL_CANDIDATES => Some(CallEvent::Candidates(serde_json::from_value(content)?)),
            CALL_SELECT_ANSWER => Some(CallEvent::SelectAnswer(serde_json::from_value(content)?)),
            CALL_HANGUP => Some(CallEvent::Hangup(serde_json::from_value(content)?)),
            _ => None,
        };
        Ok(event)
    }

    /// The conference this event belongs to.
    #[must_use]
    pub fn conf_id(&self) -> &str {
        match self {
            CallEvent::Invite(c) => &c.conf_id,
            CallEvent::Candidates(c) => &c.conf_id,
            CallEvent::SelectAnswer(c) => &c.conf_id,
            CallEvent::Hangup(c) => &c.conf_id,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::control::SdpType;

    #[test]
    fn test_candidate_wire_casing() {
        let candidate = CallCandidate {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.1 50000 typ host".to_owned(),
            sdp_mid: Some("0".to_owned()),
            sdp_mline_index: Some(0),
        };

        let json = serde_json::to_value(&candidate).unwrap();
        assert!(json.get("sdpMid").is_some());
        assert!(json.get("sdpMLineIndex").is_some());
        assert!(json.get("sdp_mid").is_none());
    }

    #[test]
    fn test_parse_invite() {
        let content = serde_json::json!({
            "call_id": "call-1",
            "conf_id": "!room:example.org",
            "party_id": "DEVICE",
            "version": "1",
            "lifetime": 60000,
            "offer": { "type": "offer", "sdp": "v=0\r\n" },
            "sender_session_id": "sess-abc"
        });

        let event = CallEvent::parse(CALL_INVITE, content).unwrap().unwrap();
        let CallEvent::Invite(invite) = event else {
            panic!("wrong variant");
        };

        assert_eq!(invite.conf_id, "!room:example.org");
        assert_eq!(invite.offer.kind, SdpType::Offer);
        assert_eq!(invite.sender_session_id, "sess-abc");
    }

    #[test]
    fn test_parse_ignores_non_call_events() {
        let parsed = CallEvent::parse("m.room.message", serde_json::json!({})).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn test_empty_candidates_round_trip() {
        let content = CandidatesContent {
            call_id: "call-1".to_owned(),
            conf_id: "conf-1".to_owned(),
            party_id: "SFU".to_owned(),
            version: wire_version(),
            candidates: Vec::new(),
            sender_session_id: "sfu-sess".to_owned(),
            dest_session_id: Some("sess-abc".to_owned()),
        };

        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["candidates"], serde_json::json!([]));

        let back: CandidatesContent = serde_json::from_value(json).unwrap();
        assert!(back.candidates.is_empty());
    }

    #[test]
    fn test_numeric_legacy_version_accepted() {
        let content = serde_json::json!({
            "call_id": "c",
            "conf_id": "conf",
            "party_id": "p",
            "version": 0,
            "reason": "user_hangup"
        });

        let event = CallEvent::parse(CALL_HANGUP, content).unwrap().unwrap();
        assert_eq!(event.conf_id(), "conf");
    }
}
