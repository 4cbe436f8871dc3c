//! Participants and the per-conference registry.

use std::collections::{HashMap, HashSet};

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::peer::PeerHandle;
use crate::types::{ParticipantId, TrackId};

/// An active member of the conference.
pub struct Participant {
    pub id: ParticipantId,
    /// Opaque session token echoed on signaling we send back.
    pub remote_session_id: String,
    pub handle: PeerHandle,
    pub task: JoinHandle<()>,
    /// When the participant is removed unless a pong arrives first.
    pub pong_deadline: Instant,
    /// Renegotiation slot: the outstanding offer SDP, if any. A newer offer
    /// replaces it; the peer's answer clears it. Re-sent when the data
    /// channel opens.
    pub pending_offer: Option<String>,
    /// Lookup index of tracks this participant subscribes to. The
    /// authoritative state lives on each track's subscriber map.
    pub subscriptions: HashSet<TrackId>,
    pub data_channel_open: bool,
}

/// Error from [`ParticipantRegistry::insert`]. Two live participants with
/// the same id is an invariant violation that fails the conference.
#[derive(Debug)]
pub struct DuplicateParticipant(pub ParticipantId);

/// Identity to participant mapping for one conference.
#[derive(Default)]
pub struct ParticipantRegistry {
    participants: HashMap<ParticipantId, Participant>,
}

impl ParticipantRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, participant: Participant) -> Result<(), DuplicateParticipant> {
        if self.participants.contains_key(&participant.id) {
            return Err(DuplicateParticipant(participant.id));
        }
        self.participants.insert(participant.id.clone(), participant);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn get_mut(&mut self, id: &ParticipantId) -> Option<&mut Participant> {
        self.participants.get_mut(id)
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<Participant> {
        self.participants.remove(id)
    }

    #[must_use]
    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Participant> {
        self.participants.values_mut()
    }

    /// All participants except one (the metadata broadcast set).
    pub fn iter_except<'a>(
        &'a self,
        excluded: &'a ParticipantId,
    ) -> impl Iterator<Item = &'a Participant> {
        self.participants.values().filter(move |p| p.id != *excluded)
    }

    #[must_use]
    pub fn ids(&self) -> Vec<ParticipantId> {
        self.participants.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
