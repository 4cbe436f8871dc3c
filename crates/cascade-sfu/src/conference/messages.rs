//! Inbound messages for a conference's single event queue.
//!
//! Everything that mutates conference state arrives here: routed signaling
//! events and peer adapter events. The keepalive timer lives on the
//! conference's own select loop.

use cascade_protocol::metadata::StreamMetadataMap;
use cascade_protocol::signaling::CallCandidate;

use crate::peer::PeerEvent;
use crate::types::ParticipantId;

/// One message on a conference's inbound queue.
pub enum ConferenceMessage {
    /// A signaling event routed by call id.
    Signaling(SignalingEvent),
    /// An event from a participant's peer adapter.
    Peer {
        sender: ParticipantId,
        event: PeerEvent,
    },
}

/// Call signaling, already demultiplexed to this conference and translated
/// out of the wire envelope.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Invite {
        participant: ParticipantId,
        remote_session_id: String,
        offer_sdp: String,
        stream_metadata: StreamMetadataMap,
        candidates: Vec<CallCandidate>,
    },
    Candidates {
        participant: ParticipantId,
        candidates: Vec<CallCandidate>,
    },
    CandidatesEnd {
        participant: ParticipantId,
    },
    SelectAnswer {
        participant: ParticipantId,
        selected_party_id: String,
    },
    Hangup {
        participant: ParticipantId,
        reason: String,
    },
}

impl SignalingEvent {
    /// The participant the event concerns.
    #[must_use]
    pub fn participant(&self) -> &ParticipantId {
        match self {
            SignalingEvent::Invite { participant, .. }
            | SignalingEvent::Candidates { participant, .. }
            | SignalingEvent::CandidatesEnd { participant }
            | SignalingEvent::SelectAnswer { participant, .. }
            | SignalingEvent::Hangup { participant, .. } => participant,
        }
    }
}
