//! Published tracks and simulcast layer selection.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use cascade_protocol::metadata::TrackMetadataEntry;

use crate::peer::{EgressSender, PeerHandle};
use crate::types::{ParticipantId, SimulcastLayer, TrackInfo, TrackKind};

use super::subscription::Subscription;

/// Publisher-reported maximum resolution for a track.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackMetadata {
    pub max_width: u32,
    pub max_height: u32,
}

impl From<TrackMetadataEntry> for TrackMetadata {
    fn from(entry: TrackMetadataEntry) -> Self {
        Self {
            max_width: entry.width,
            max_height: entry.height,
        }
    }
}

/// A track a participant currently sources, together with its subscribers.
pub struct PublishedTrack {
    pub owner: ParticipantId,
    /// Command path to the publishing peer, used for upstream key frame
    /// requests.
    pub owner_handle: PeerHandle,
    pub info: Arc<TrackInfo>,
    pub layers: BTreeSet<SimulcastLayer>,
    /// Ingest SSRC per layer, needed to address upstream PLIs.
    pub layer_ssrcs: HashMap<SimulcastLayer, u32>,
    pub metadata: TrackMetadata,
    /// Shared audio fan-out sink every subscriber attaches.
    pub output_track: Option<Arc<TrackLocalStaticRTP>>,
    /// Non-blocking path into the audio fan-out writer.
    pub audio_egress: Option<EgressSender>,
    pub audio_task: Option<JoinHandle<()>>,
    pub subscriptions: HashMap<ParticipantId, Subscription>,
    /// Earliest instant another upstream key frame request may be sent,
    /// per layer.
    keyframe_gates: HashMap<SimulcastLayer, Instant>,
}

impl PublishedTrack {
    #[must_use]
    pub fn new(
        owner: ParticipantId,
        owner_handle: PeerHandle,
        info: Arc<TrackInfo>,
        metadata: TrackMetadata,
    ) -> Self {
        Self {
            owner,
            owner_handle,
            info,
            layers: BTreeSet::new(),
            layer_ssrcs: HashMap::new(),
            metadata,
            output_track: None,
            audio_egress: None,
            audio_task: None,
            subscriptions: HashMap::new(),
            keyframe_gates: HashMap::new(),
        }
    }

    /// The layer to forward for a subscriber requesting the given size.
    #[must_use]
    pub fn optimal_layer(&self, requested_width: u32, requested_height: u32) -> SimulcastLayer {
        select_layer(
            self.info.kind,
            &self.layers,
            self.metadata,
            requested_width,
            requested_height,
        )
    }

    /// Check and advance the key frame gate for a layer. Returns true when
    /// a request may be forwarded now; the gate then moves to
    /// `now + interval`.
    pub fn pass_keyframe_gate(
        &mut self,
        layer: SimulcastLayer,
        now: Instant,
        interval: Duration,
    ) -> bool {
        let gate = self.keyframe_gates.entry(layer).or_insert(now);
        if now >= *gate {
            *gate = now + interval;
            true
        } else {
            false
        }
    }
}

/// Pick the layer to forward: the desired layer from the size ratio, then
/// the first available fallback in priority order.
///
/// Pure; the whole simulcast policy lives here.
#[must_use]
pub fn select_layer(
    kind: TrackKind,
    available: &BTreeSet<SimulcastLayer>,
    metadata: TrackMetadata,
    requested_width: u32,
    requested_height: u32,
) -> SimulcastLayer {
    // Audio, and video without simulcast, have a single quality.
    if kind == TrackKind::Audio
        || available.is_empty()
        || (available.len() == 1 && available.contains(&SimulcastLayer::None))
    {
        return SimulcastLayer::None;
    }

    let desired = desired_layer(metadata, requested_width, requested_height);

    let priority = [
        desired,
        SimulcastLayer::Medium,
        SimulcastLayer::Low,
        SimulcastLayer::High,
    ];

    priority
        .into_iter()
        .find(|layer| available.contains(layer))
        .unwrap_or(SimulcastLayer::Low)
}

/// The ideal layer for a requested size, ignoring availability.
///
/// The combined width+height ratio between what the publisher produces and
/// what the subscriber wants maps onto the roughly 4x size steps between
/// simulcast layers.
fn desired_layer(metadata: TrackMetadata, requested_width: u32, requested_height: u32) -> SimulcastLayer {
    let full_size = metadata.max_width + metadata.max_height;
    let requested_size = requested_width + requested_height;

    if full_size == 0 || requested_size == 0 {
        return SimulcastLayer::Low;
    }

    #[allow(clippy::cast_precision_loss)]
    let ratio = full_size as f32 / requested_size as f32;
    if ratio <= 1.0 {
        SimulcastLayer::High
    } else if ratio <= 2.0 {
        SimulcastLayer::Medium
    } else {
        SimulcastLayer::Low
    }
}
