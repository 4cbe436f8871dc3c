//! The track tracker: catalog of published tracks, the subscription graph,
//! and the per-packet fan-out path.
//!
//! All methods run on the conference task, so no locking. Time-sensitive
//! operations take `now` explicitly, which keeps the key frame regulation
//! deterministic under test.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

use cascade_protocol::metadata::TrackMetadataEntry;

use crate::errors::SubscribeError;
use crate::peer::{EgressSender, PeerHandle, RtcpPacket, EGRESS_QUEUE_DEPTH};
use crate::stats::ForwardingStats;
use crate::types::{ParticipantId, SimulcastLayer, TrackId, TrackInfo, TrackKind};

use super::subscription::Subscription;
use super::track::{select_layer, PublishedTrack, TrackMetadata};

pub struct TrackTracker {
    tracks: HashMap<TrackId, PublishedTrack>,
    send_keyframe_interval: Duration,
    stats: Arc<ForwardingStats>,
}

impl TrackTracker {
    #[must_use]
    pub fn new(send_keyframe_interval: Duration, stats: Arc<ForwardingStats>) -> Self {
        Self {
            tracks: HashMap::new(),
            send_keyframe_interval,
            stats,
        }
    }

    /// Record a published track, or merge another simulcast layer into an
    /// existing one. Existing subscriptions are reselected when the layer
    /// set grows.
    #[allow(clippy::too_many_arguments)]
    pub fn add_published_track(
        &mut self,
        owner: ParticipantId,
        owner_handle: PeerHandle,
        info: Arc<TrackInfo>,
        layer: SimulcastLayer,
        ssrc: u32,
        metadata: TrackMetadata,
        output_track: Option<Arc<TrackLocalStaticRTP>>,
        now: Instant,
    ) {
        let interval = self.send_keyframe_interval;

        match self.tracks.entry(info.id.clone()) {
            Entry::Occupied(mut occupied) => {
                let track = occupied.get_mut();
                if layer != SimulcastLayer::None {
                    track.layers.insert(layer);
                }
                track.layer_ssrcs.insert(layer, ssrc);
                Self::reselect_all(track, interval, &self.stats, now);
            }
            Entry::Vacant(vacant) => {
                let mut track =
                    PublishedTrack::new(owner, owner_handle, Arc::clone(&info), metadata);
                if layer != SimulcastLayer::None {
                    track.layers.insert(layer);
                }
                track.layer_ssrcs.insert(layer, ssrc);

                if let Some(sink) = output_track {
                    // Audio fan-out: one writer task feeds the shared sink
                    // all subscribers attach.
                    let (tx, mut rx) = mpsc::channel(EGRESS_QUEUE_DEPTH);
                    let writer_sink = Arc::clone(&sink);
                    let task = tokio::spawn(async move {
                        while let Some(packet) = rx.recv().await {
                            if writer_sink.write_rtp(&packet).await.is_err() {
                                break;
                            }
                        }
                    });

                    track.audio_egress = Some(EgressSender::new(
                        info.id.clone(),
                        tx,
                        Arc::clone(&self.stats),
                    ));
                    track.audio_task = Some(task);
                    track.output_track = Some(sink);
                }

                vacant.insert(track);
            }
        }
    }

    /// Remove a track and tear down all of its subscriptions.
    pub fn remove_published_track(&mut self, track_id: &TrackId) -> bool {
        match self.tracks.remove(track_id) {
            Some(track) => {
                Self::teardown_track(track);
                true
            }
            None => false,
        }
    }

    /// Install or adjust a subscription.
    ///
    /// A repeated subscribe with a different requested size acts as a
    /// reselection; with the same size it is rejected as a duplicate.
    pub fn subscribe(
        &mut self,
        subscriber: &ParticipantId,
        subscriber_handle: &PeerHandle,
        track_id: &TrackId,
        requested_width: u32,
        requested_height: u32,
        now: Instant,
    ) -> Result<(), SubscribeError> {
        let interval = self.send_keyframe_interval;

        let Some(track) = self.tracks.get_mut(track_id) else {
            return Err(SubscribeError::NotFound(track_id.to_string()));
        };
        if track.owner == *subscriber {
            return Err(SubscribeError::OwnTrack(track_id.to_string()));
        }

        let new_layer = track.optimal_layer(requested_width, requested_height);

        if track.subscriptions.contains_key(subscriber) {
            let mut changed = false;
            if let Some(sub) = track.subscriptions.get_mut(subscriber) {
                if sub.requested_width == requested_width
                    && sub.requested_height == requested_height
                {
                    return Err(SubscribeError::AlreadySubscribed(track_id.to_string()));
                }
                sub.requested_width = requested_width;
                sub.requested_height = requested_height;
                if sub.active_layer != new_layer {
                    sub.active_layer = new_layer;
                    changed = true;
                }
            }
            if changed {
                Self::request_key_frame(track, new_layer, now, interval, &self.stats);
            }
            return Ok(());
        }

        // Fresh subscription: bind the egress on the subscriber's adapter.
        let egress = match track.info.kind {
            TrackKind::Audio => {
                if let Some(sink) = &track.output_track {
                    if subscriber_handle
                        .bind_shared_egress(track_id.clone(), Arc::clone(sink))
                        .is_err()
                    {
                        debug!(
                            target: "sfu.tracker",
                            subscriber = %subscriber,
                            track_id = %track_id,
                            "subscriber adapter gone while binding audio egress"
                        );
                    }
                }
                None
            }
            TrackKind::Video => {
                let egress_track = Arc::new(TrackLocalStaticRTP::new(
                    track.info.codec.clone(),
                    track.info.id.as_str().to_owned(),
                    track.info.stream_id.clone(),
                ));
                match subscriber_handle.bind_egress(
                    track_id.clone(),
                    egress_track,
                    Arc::clone(&self.stats),
                ) {
                    Ok(egress) => Some(egress),
                    Err(e) => {
                        warn!(
                            target: "sfu.tracker",
                            subscriber = %subscriber,
                            track_id = %track_id,
                            error = %e,
                            "failed to bind video egress"
                        );
                        None
                    }
                }
            }
        };

        track.subscriptions.insert(
            subscriber.clone(),
            Subscription {
                subscriber: subscriber.clone(),
                subscriber_handle: subscriber_handle.clone(),
                track_id: track_id.clone(),
                requested_width,
                requested_height,
                active_layer: new_layer,
                egress,
            },
        );

        if track.info.kind == TrackKind::Video {
            // The subscriber needs a key frame to start decoding.
            Self::request_key_frame(track, new_layer, now, interval, &self.stats);
        }

        Ok(())
    }

    /// Remove a subscription. Idempotent; unknown tracks and absent
    /// subscriptions are no-ops.
    pub fn unsubscribe(&mut self, subscriber: &ParticipantId, track_id: &TrackId) {
        if let Some(track) = self.tracks.get_mut(track_id) {
            if let Some(sub) = track.subscriptions.remove(subscriber) {
                sub.release();
            }
        }
    }

    /// Fan one ingest packet out to the subscribers of its active layer.
    ///
    /// Non-blocking: a slow subscriber loses this packet, nobody else does.
    pub fn process_rtp(&mut self, info: &TrackInfo, layer: SimulcastLayer, packet: rtp::packet::Packet) {
        let Some(track) = self.tracks.get(&info.id) else {
            return;
        };

        if track.info.kind == TrackKind::Audio {
            if let Some(egress) = &track.audio_egress {
                egress.forward(packet);
            }
            return;
        }

        for sub in track.subscriptions.values() {
            if sub.wants_layer(layer) {
                if let Some(egress) = &sub.egress {
                    egress.forward(packet.clone());
                }
            }
        }
    }

    /// Regulate upstream key frame requests triggered by subscriber RTCP.
    pub fn process_rtcp(
        &mut self,
        subscriber: &ParticipantId,
        track_id: &TrackId,
        packets: &[RtcpPacket],
        now: Instant,
    ) {
        let interval = self.send_keyframe_interval;

        let Some(track) = self.tracks.get_mut(track_id) else {
            return;
        };
        let Some(layer) = track
            .subscriptions
            .get(subscriber)
            .map(|sub| sub.active_layer)
        else {
            return;
        };

        if wants_key_frame(packets) {
            Self::request_key_frame(track, layer, now, interval, &self.stats);
        }
    }

    /// Apply updated publisher metadata and reselect affected
    /// subscriptions.
    pub fn update_metadata(&mut self, entries: &HashMap<String, TrackMetadataEntry>, now: Instant) {
        let interval = self.send_keyframe_interval;

        for track in self.tracks.values_mut() {
            let Some(entry) = entries.get(track.info.id.as_str()) else {
                continue;
            };
            let updated = TrackMetadata::from(*entry);
            if updated != track.metadata {
                track.metadata = updated;
                Self::reselect_all(track, interval, &self.stats, now);
            }
        }
    }

    /// Cascade for a leaving participant: drop every track it owns (with
    /// all their subscriptions) and every subscription it holds elsewhere.
    pub fn remove_participant(&mut self, id: &ParticipantId) {
        let owned: Vec<TrackId> = self
            .tracks
            .iter()
            .filter(|(_, track)| track.owner == *id)
            .map(|(track_id, _)| track_id.clone())
            .collect();

        for track_id in owned {
            if let Some(track) = self.tracks.remove(&track_id) {
                Self::teardown_track(track);
            }
        }

        for track in self.tracks.values_mut() {
            if let Some(sub) = track.subscriptions.remove(id) {
                sub.release();
            }
        }
    }

    #[must_use]
    pub fn track(&self, track_id: &TrackId) -> Option<&PublishedTrack> {
        self.tracks.get(track_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// The layer currently forwarded to a subscriber, if subscribed.
    #[must_use]
    pub fn subscription_layer(
        &self,
        subscriber: &ParticipantId,
        track_id: &TrackId,
    ) -> Option<SimulcastLayer> {
        self.tracks
            .get(track_id)?
            .subscriptions
            .get(subscriber)
            .map(|sub| sub.active_layer)
    }

    fn teardown_track(track: PublishedTrack) {
        for sub in track.subscriptions.values() {
            sub.release();
        }
        if let Some(task) = track.audio_task {
            task.abort();
        }
    }

    /// Recompute every subscription's layer after the layer set or the
    /// metadata changed; request key frames for the layers that gained
    /// subscribers, coalesced per layer.
    fn reselect_all(
        track: &mut PublishedTrack,
        interval: Duration,
        stats: &ForwardingStats,
        now: Instant,
    ) {
        let kind = track.info.kind;
        let layers = track.layers.clone();
        let metadata = track.metadata;

        let mut refresh = Vec::new();
        for sub in track.subscriptions.values_mut() {
            let new_layer = select_layer(
                kind,
                &layers,
                metadata,
                sub.requested_width,
                sub.requested_height,
            );
            if new_layer != sub.active_layer {
                sub.active_layer = new_layer;
                refresh.push(new_layer);
            }
        }

        refresh.sort_unstable();
        refresh.dedup();
        for layer in refresh {
            Self::request_key_frame(track, layer, now, interval, stats);
        }
    }

    /// Forward one upstream key frame request, subject to the per-layer
    /// gate.
    fn request_key_frame(
        track: &mut PublishedTrack,
        layer: SimulcastLayer,
        now: Instant,
        interval: Duration,
        stats: &ForwardingStats,
    ) {
        if track.info.kind == TrackKind::Audio {
            return;
        }
        let Some(&ssrc) = track.layer_ssrcs.get(&layer) else {
            return;
        };

        if track.pass_keyframe_gate(layer, now, interval) {
            track
                .owner_handle
                .request_key_frame(track.info.id.clone(), ssrc);
            stats.record_keyframe_request();
        }
    }
}

/// Whether subscriber RTCP contains a key frame request (PLI or FIR).
fn wants_key_frame(packets: &[RtcpPacket]) -> bool {
    packets.iter().any(|packet| {
        packet
            .as_any()
            .downcast_ref::<PictureLossIndication>()
            .is_some()
            || packet.as_any().downcast_ref::<FullIntraRequest>().is_some()
    })
}
