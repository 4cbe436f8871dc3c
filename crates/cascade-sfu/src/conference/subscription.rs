//! Per-(subscriber, track) subscription state.
//!
//! A subscription lives in its track's `subscribers` map; the subscribing
//! participant only keeps a track-id lookup set. Removing either side
//! cascades through both.

use crate::peer::{EgressSender, PeerHandle};
use crate::types::{ParticipantId, SimulcastLayer, TrackId};

pub struct Subscription {
    pub subscriber: ParticipantId,
    /// Command path to the subscriber's adapter, for egress teardown.
    pub subscriber_handle: PeerHandle,
    pub track_id: TrackId,
    /// The resolution the subscriber asked for.
    pub requested_width: u32,
    pub requested_height: u32,
    /// Which simulcast layer is currently forwarded.
    pub active_layer: SimulcastLayer,
    /// Dedicated packet path; `None` for audio, which flows through the
    /// track's shared output sink instead.
    pub egress: Option<EgressSender>,
}

impl Subscription {
    /// Whether an ingest packet on `layer` should be forwarded here.
    #[must_use]
    pub fn wants_layer(&self, layer: SimulcastLayer) -> bool {
        self.active_layer == layer
    }

    /// Detach this subscription's egress from the subscriber's transport.
    /// Covers both the dedicated video path and the shared audio sink.
    pub fn release(&self) {
        self.subscriber_handle.release_egress(self.track_id.clone());
    }
}
