//! The per-call conference actor.
//!
//! One task per conference owns the participant registry, the track
//! tracker, the stream metadata map and every mutation of them. All
//! interaction happens through the inbound message queue; the only
//! suspension points are queue sends, the keepalive timer and transport
//! commands, so no locks exist anywhere in conference state.

pub mod messages;
pub mod participant;
pub mod subscription;
pub mod track;
pub mod tracker;

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cascade_protocol::control::{ControlMessage, ControlParseError, SdpType, SessionDescription};
use cascade_protocol::metadata::{track_entries, StreamMetadataMap};

use crate::config::ConferenceConfig;
use crate::errors::SfuError;
use crate::peer::factory::PeerFactory;
use crate::peer::PeerEvent;
use crate::signaling::{MatrixRecipient, SignalingHandle};
use crate::stats::ForwardingStats;
use crate::types::{LeaveReason, ParticipantId, TrackId};

use messages::{ConferenceMessage, SignalingEvent};
use participant::{Participant, ParticipantRegistry};
use track::TrackMetadata;
use tracker::TrackTracker;

/// Notification to the router when a conference finishes.
#[derive(Debug)]
pub enum ConferenceNotice {
    Ended { conf_id: String },
}

/// Handle for delivering routed signaling into a conference.
#[derive(Clone)]
pub struct ConferenceHandle {
    sender: mpsc::Sender<ConferenceMessage>,
    cancel: CancellationToken,
    conf_id: String,
}

impl ConferenceHandle {
    #[must_use]
    pub fn conf_id(&self) -> &str {
        &self.conf_id
    }

    /// Deliver a signaling event, in bus order.
    pub async fn deliver(&self, event: SignalingEvent) -> Result<(), SfuError> {
        self.sender
            .send(ConferenceMessage::Signaling(event))
            .await
            .map_err(|_| SfuError::Channel(format!("conference {} gone", self.conf_id)))
    }

    /// Raw queue access, used by tests to inject peer events.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<ConferenceMessage> {
        self.sender.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The conference actor.
pub struct Conference {
    conf_id: String,
    config: ConferenceConfig,
    /// Our device id on the wire; `select_answer` events naming any other
    /// device mean the call went elsewhere.
    local_device_id: String,
    receiver: mpsc::Receiver<ConferenceMessage>,
    /// Sender side of our own queue, handed to every peer adapter.
    self_tx: mpsc::Sender<ConferenceMessage>,
    cancel: CancellationToken,
    factory: Arc<dyn PeerFactory>,
    signaling: SignalingHandle,
    notices: mpsc::Sender<ConferenceNotice>,
    registry: ParticipantRegistry,
    tracker: TrackTracker,
    /// Per-participant stream announcements, as last reported.
    metadata: std::collections::HashMap<ParticipantId, StreamMetadataMap>,
    stats: Arc<ForwardingStats>,
    ended: bool,
}

impl Conference {
    /// Spawn the conference task.
    pub fn spawn(
        conf_id: String,
        config: ConferenceConfig,
        local_device_id: String,
        factory: Arc<dyn PeerFactory>,
        signaling: SignalingHandle,
        notices: mpsc::Sender<ConferenceNotice>,
        cancel: CancellationToken,
    ) -> (ConferenceHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.max_event_queue_depth);
        let stats = Arc::new(ForwardingStats::new());

        let actor = Self {
            conf_id: conf_id.clone(),
            local_device_id,
            receiver: rx,
            self_tx: tx.clone(),
            cancel: cancel.clone(),
            factory,
            signaling,
            notices,
            registry: ParticipantRegistry::new(),
            tracker: TrackTracker::new(config.send_keyframe_interval(), Arc::clone(&stats)),
            metadata: std::collections::HashMap::new(),
            stats,
            config,
            ended: false,
        };

        let task = tokio::spawn(actor.run());

        (
            ConferenceHandle {
                sender: tx,
                cancel,
                conf_id,
            },
            task,
        )
    }

    async fn run(mut self) {
        info!(
            target: "sfu.conference",
            conf_id = %self.conf_id,
            "conference started"
        );

        let mut keepalive = tokio::time::interval(self.config.keepalive_ping_interval());

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.shutdown().await;
                    break;
                }

                _ = keepalive.tick() => {
                    self.handle_keepalive_tick().await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message).await,
                        None => break,
                    }
                }
            }

            if self.ended {
                break;
            }
        }

        info!(
            target: "sfu.conference",
            conf_id = %self.conf_id,
            ingest_dropped = self.stats.ingest_dropped(),
            egress_dropped = self.stats.egress_dropped(),
            "conference ended"
        );
    }

    async fn handle_message(&mut self, message: ConferenceMessage) {
        match message {
            ConferenceMessage::Signaling(event) => self.handle_signaling(event).await,
            ConferenceMessage::Peer { sender, event } => {
                self.handle_peer_event(sender, event).await;
            }
        }
    }

    async fn handle_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Invite {
                participant,
                remote_session_id,
                offer_sdp,
                stream_metadata,
                candidates,
            } => {
                self.handle_invite(
                    participant,
                    remote_session_id,
                    offer_sdp,
                    stream_metadata,
                    candidates,
                )
                .await;
            }

            SignalingEvent::Candidates {
                participant,
                candidates,
            } => {
                let Some(p) = self.registry.get(&participant) else {
                    warn!(
                        target: "sfu.conference",
                        participant = %participant,
                        "candidates for unknown participant"
                    );
                    return;
                };
                if let Err(e) = p.handle.add_ice_candidates(candidates).await {
                    warn!(
                        target: "sfu.conference",
                        participant = %participant,
                        error = %e,
                        "failed to deliver remote candidates"
                    );
                }
            }

            SignalingEvent::CandidatesEnd { participant } => {
                if let Some(p) = self.registry.get(&participant) {
                    let _ = p.handle.remote_candidates_finished().await;
                }
            }

            SignalingEvent::SelectAnswer {
                participant,
                selected_party_id,
            } => {
                if selected_party_id != self.local_device_id {
                    info!(
                        target: "sfu.conference",
                        participant = %participant,
                        selected_party_id,
                        "call answered on another device"
                    );
                    self.remove_participant(&participant, LeaveReason::AnsweredElsewhere)
                        .await;
                }
            }

            SignalingEvent::Hangup {
                participant,
                reason,
            } => {
                debug!(
                    target: "sfu.conference",
                    participant = %participant,
                    reason,
                    "hangup received"
                );
                self.remove_participant(&participant, LeaveReason::ClientLeft)
                    .await;
            }
        }
    }

    async fn handle_invite(
        &mut self,
        participant: ParticipantId,
        remote_session_id: String,
        offer_sdp: String,
        stream_metadata: StreamMetadataMap,
        candidates: Vec<cascade_protocol::signaling::CallCandidate>,
    ) {
        let existing_session = self
            .registry
            .get(&participant)
            .map(|p| p.remote_session_id.clone());
        if let Some(session) = existing_session {
            if session == remote_session_id {
                warn!(
                    target: "sfu.conference",
                    participant = %participant,
                    "duplicate invite for the same session, ignoring"
                );
                return;
            }
            info!(
                target: "sfu.conference",
                participant = %participant,
                "new session for existing participant, replacing"
            );
            self.remove_participant(&participant, LeaveReason::SessionReplaced)
                .await;
        }

        info!(
            target: "sfu.conference",
            conf_id = %self.conf_id,
            participant = %participant,
            "participant joining"
        );

        let (handle, task) = match self
            .factory
            .create_peer(
                participant.clone(),
                self.self_tx.clone(),
                self.cancel.child_token(),
                Arc::clone(&self.stats),
            )
            .await
        {
            Ok(pair) => pair,
            Err(e) => {
                error!(
                    target: "sfu.conference",
                    participant = %participant,
                    error = %e,
                    "failed to create peer"
                );
                self.teardown_if_idle();
                return;
            }
        };

        let answer = match handle.process_remote_offer(offer_sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                error!(
                    target: "sfu.conference",
                    participant = %participant,
                    error = %e,
                    "failed to process SDP offer"
                );
                handle.close().await;
                self.teardown_if_idle();
                return;
            }
        };

        if !candidates.is_empty() {
            let _ = handle.add_ice_candidates(candidates).await;
        }

        let recipient = MatrixRecipient {
            user_id: participant.user_id.clone(),
            device_id: participant.device_id.clone(),
            call_id: participant.call_id.clone(),
            conf_id: self.conf_id.clone(),
            remote_session_id: remote_session_id.clone(),
        };

        let member = Participant {
            id: participant.clone(),
            remote_session_id,
            handle,
            task,
            pong_deadline: Instant::now() + self.config.keepalive_timeout(),
            pending_offer: None,
            subscriptions: HashSet::new(),
            data_channel_open: false,
        };

        if let Err(duplicate) = self.registry.insert(member) {
            // Two live participants with one id would corrupt every index;
            // fail the conference, not the process.
            error!(
                target: "sfu.conference",
                participant = %duplicate.0,
                "duplicate participant registration, tearing down conference"
            );
            self.fatal_teardown().await;
            return;
        }

        self.apply_stream_metadata(&participant, stream_metadata);
        let streams = self.available_streams_for(&participant);
        self.signaling.send_answer(recipient, answer, streams);
    }

    async fn handle_peer_event(&mut self, sender: ParticipantId, event: PeerEvent) {
        match event {
            PeerEvent::JoinedCall => {
                info!(
                    target: "sfu.conference",
                    participant = %sender,
                    "joined the call"
                );
            }

            PeerEvent::LeftCall { reason } => {
                info!(
                    target: "sfu.conference",
                    participant = %sender,
                    reason = %reason,
                    "left the call"
                );
                self.remove_participant(&sender, reason).await;
            }

            PeerEvent::NewTrackPublished {
                info,
                layer,
                ssrc,
                output_track,
            } => {
                let Some(p) = self.registry.get(&sender) else {
                    return;
                };
                info!(
                    target: "sfu.conference",
                    participant = %sender,
                    track_id = %info.id,
                    layer = %layer,
                    "new track published"
                );

                let track_metadata = self
                    .metadata
                    .get(&sender)
                    .map(|streams| track_entries(streams))
                    .and_then(|entries| entries.get(info.id.as_str()).copied())
                    .map(TrackMetadata::from)
                    .unwrap_or_default();

                self.tracker.add_published_track(
                    sender.clone(),
                    p.handle.clone(),
                    info,
                    layer,
                    ssrc,
                    track_metadata,
                    output_track,
                    Instant::now(),
                );
                self.broadcast_metadata_except(&sender);
            }

            PeerEvent::PublishedTrackFailed { track_id } => {
                info!(
                    target: "sfu.conference",
                    participant = %sender,
                    track_id = %track_id,
                    "published track failed"
                );
                self.tracker.remove_published_track(&track_id);
                for p in self.registry.iter_mut() {
                    p.subscriptions.remove(&track_id);
                }
                self.broadcast_metadata_except(&sender);
            }

            PeerEvent::NewIceCandidate { candidate } => {
                let Some(recipient) = self.recipient_for(&sender) else {
                    return;
                };
                debug!(
                    target: "sfu.conference",
                    participant = %sender,
                    "trickling local ICE candidate"
                );
                self.signaling.send_candidates(recipient, vec![candidate]);
            }

            PeerEvent::IceGatheringComplete => {
                let Some(recipient) = self.recipient_for(&sender) else {
                    return;
                };
                debug!(
                    target: "sfu.conference",
                    participant = %sender,
                    "local ICE gathering complete"
                );
                self.signaling.send_candidates_finished(recipient);
            }

            PeerEvent::RenegotiationRequired { offer_sdp } => {
                let Some(p) = self.registry.get_mut(&sender) else {
                    return;
                };
                info!(
                    target: "sfu.conference",
                    participant = %sender,
                    "renegotiation required, sending offer"
                );
                // A newer offer supersedes any outstanding one; SDPs are
                // full-state.
                p.pending_offer = Some(offer_sdp);
                self.send_pending_offer(&sender).await;
            }

            PeerEvent::DataChannelAvailable => {
                info!(
                    target: "sfu.conference",
                    participant = %sender,
                    "data channel connected"
                );
                if let Some(p) = self.registry.get_mut(&sender) {
                    p.data_channel_open = true;
                }
                // The peer missed any metadata broadcast before the channel
                // opened; bring it up to date, then retry a pending offer.
                self.send_metadata_to(&sender).await;
                self.send_pending_offer(&sender).await;
            }

            PeerEvent::DataChannelMessage { payload } => {
                self.handle_control_message(sender, &payload).await;
            }

            PeerEvent::RtpReceived {
                info,
                layer,
                packet,
            } => {
                self.tracker.process_rtp(&info, layer, packet);
            }

            PeerEvent::RtcpReceived { track_id, packets } => {
                self.tracker
                    .process_rtcp(&sender, &track_id, &packets, Instant::now());
            }
        }
    }

    async fn handle_control_message(&mut self, sender: ParticipantId, payload: &[u8]) {
        let message = match ControlMessage::parse(payload) {
            Ok(message) => message,
            Err(ControlParseError::UnknownType(t)) => {
                warn!(
                    target: "sfu.conference",
                    participant = %sender,
                    message_type = t,
                    "control message of unknown type, ignoring"
                );
                return;
            }
            Err(ControlParseError::Malformed(e)) => {
                error!(
                    target: "sfu.conference",
                    participant = %sender,
                    error = %e,
                    "malformed control message, dropping"
                );
                return;
            }
        };

        if !self.registry.contains(&sender) {
            return;
        }

        match message {
            ControlMessage::TrackSubscription {
                subscribe,
                unsubscribe,
            } => {
                self.handle_track_subscription(&sender, subscribe, unsubscribe);
            }

            ControlMessage::Negotiate {
                description,
                stream_metadata,
            } => {
                self.apply_stream_metadata(&sender, stream_metadata);
                self.handle_negotiate(&sender, description).await;
            }

            ControlMessage::Pong => {
                if let Some(p) = self.registry.get_mut(&sender) {
                    p.pong_deadline = Instant::now() + self.config.keepalive_timeout();
                }
            }

            ControlMessage::Ping => {
                debug!(
                    target: "sfu.conference",
                    participant = %sender,
                    "unexpected ping from peer, ignoring"
                );
            }

            ControlMessage::MetadataChanged { stream_metadata } => {
                self.apply_stream_metadata(&sender, stream_metadata);
                self.broadcast_metadata_except(&sender);
            }
        }
    }

    fn handle_track_subscription(
        &mut self,
        sender: &ParticipantId,
        subscribe: Vec<cascade_protocol::control::SubscribeRequest>,
        unsubscribe: Vec<cascade_protocol::control::UnsubscribeRequest>,
    ) {
        let Some(handle) = self.registry.get(sender).map(|p| p.handle.clone()) else {
            return;
        };
        let now = Instant::now();

        // Unsubscribes first, then subscribes; one failure does not abort
        // the rest of the batch.
        for request in unsubscribe {
            let track_id = TrackId::from(request.track_id);
            debug!(
                target: "sfu.conference",
                participant = %sender,
                track_id = %track_id,
                "unsubscribing"
            );
            self.tracker.unsubscribe(sender, &track_id);
            if let Some(p) = self.registry.get_mut(sender) {
                p.subscriptions.remove(&track_id);
            }
        }

        for request in subscribe {
            let track_id = TrackId::from(request.track_id);
            match self.tracker.subscribe(
                sender,
                &handle,
                &track_id,
                request.width,
                request.height,
                now,
            ) {
                Ok(()) => {
                    debug!(
                        target: "sfu.conference",
                        participant = %sender,
                        track_id = %track_id,
                        "subscribed"
                    );
                    if let Some(p) = self.registry.get_mut(sender) {
                        p.subscriptions.insert(track_id);
                    }
                }
                Err(e) => {
                    error!(
                        target: "sfu.conference",
                        participant = %sender,
                        track_id = %track_id,
                        error = %e,
                        "failed to subscribe"
                    );
                }
            }
        }
    }

    async fn handle_negotiate(&mut self, sender: &ParticipantId, description: SessionDescription) {
        let Some(p) = self.registry.get(sender) else {
            return;
        };
        let handle = p.handle.clone();

        match description.kind {
            SdpType::Offer => {
                info!(
                    target: "sfu.conference",
                    participant = %sender,
                    "offer received over data channel"
                );
                match handle.process_remote_offer(description.sdp).await {
                    Ok(answer) => {
                        let message = ControlMessage::Negotiate {
                            description: SessionDescription {
                                kind: SdpType::Answer,
                                sdp: answer,
                            },
                            stream_metadata: self.available_streams_for(sender),
                        };
                        self.send_control_to(sender, &message).await;
                    }
                    Err(e) => {
                        error!(
                            target: "sfu.conference",
                            participant = %sender,
                            error = %e,
                            "failed to process offer"
                        );
                    }
                }
            }

            SdpType::Answer => {
                info!(
                    target: "sfu.conference",
                    participant = %sender,
                    "renegotiation answer received"
                );
                match handle.process_remote_answer(description.sdp).await {
                    Ok(()) => {
                        if let Some(p) = self.registry.get_mut(sender) {
                            p.pending_offer = None;
                        }
                    }
                    Err(e) => {
                        error!(
                            target: "sfu.conference",
                            participant = %sender,
                            error = %e,
                            "failed to apply answer"
                        );
                    }
                }
            }

            SdpType::Unknown => {
                error!(
                    target: "sfu.conference",
                    participant = %sender,
                    "unknown SDP description type"
                );
            }
        }
    }

    async fn handle_keepalive_tick(&mut self) {
        let now = Instant::now();

        let expired: Vec<ParticipantId> = self
            .registry
            .iter()
            .filter(|p| now >= p.pong_deadline)
            .map(|p| p.id.clone())
            .collect();

        for id in expired {
            warn!(
                target: "sfu.conference",
                participant = %id,
                "keepalive timed out"
            );
            self.remove_participant(&id, LeaveReason::KeepaliveTimeout)
                .await;
        }

        if let Ok(ping) = ControlMessage::Ping.encode() {
            for p in self.registry.iter() {
                if p.data_channel_open {
                    p.handle.send_control_best_effort(Bytes::from(ping.clone()));
                }
            }
        }
    }

    /// The removal cascade: registry, owned tracks and their
    /// subscriptions, foreign subscriptions, the adapter, the signaling
    /// hangup, and finally teardown when the room empties.
    async fn remove_participant(&mut self, id: &ParticipantId, reason: LeaveReason) {
        let Some(p) = self.registry.remove(id) else {
            return;
        };

        info!(
            target: "sfu.conference",
            conf_id = %self.conf_id,
            participant = %id,
            reason = %reason,
            "removing participant"
        );

        self.tracker.remove_participant(id);
        self.metadata.remove(id);

        p.handle.close().await;

        let recipient = MatrixRecipient {
            user_id: p.id.user_id.clone(),
            device_id: p.id.device_id.clone(),
            call_id: p.id.call_id.clone(),
            conf_id: self.conf_id.clone(),
            remote_session_id: p.remote_session_id.clone(),
        };
        self.signaling.send_hangup(recipient, reason.as_wire_str());

        self.broadcast_metadata_except(id);

        if self.registry.is_empty() {
            self.set_ended();
        }
    }

    /// Merge a participant's stream announcement and reselect layers.
    fn apply_stream_metadata(&mut self, sender: &ParticipantId, streams: StreamMetadataMap) {
        let entries = track_entries(&streams);
        self.metadata.insert(sender.clone(), streams);
        self.tracker.update_metadata(&entries, Instant::now());
    }

    /// Everything published by others, from this participant's point of
    /// view.
    fn available_streams_for(&self, id: &ParticipantId) -> StreamMetadataMap {
        let mut streams = StreamMetadataMap::new();
        for (owner, map) in &self.metadata {
            if owner == id {
                continue;
            }
            for (stream_id, meta) in map {
                streams.insert(stream_id.clone(), meta.clone());
            }
        }
        streams
    }

    /// Send `metadata_changed` to everyone except the originator.
    fn broadcast_metadata_except(&self, originator: &ParticipantId) {
        for p in self.registry.iter_except(originator) {
            if !p.data_channel_open {
                // They will get a fresh view when the channel opens.
                continue;
            }
            let message = ControlMessage::MetadataChanged {
                stream_metadata: self.available_streams_for(&p.id),
            };
            match message.encode() {
                Ok(payload) => p.handle.send_control_best_effort(Bytes::from(payload)),
                Err(e) => warn!(
                    target: "sfu.conference",
                    error = %e,
                    "failed to encode metadata broadcast"
                ),
            }
        }
    }

    /// Send the current metadata view to one participant, waiting for the
    /// delivery verdict.
    async fn send_metadata_to(&mut self, id: &ParticipantId) {
        let message = ControlMessage::MetadataChanged {
            stream_metadata: self.available_streams_for(id),
        };
        self.send_control_to(id, &message).await;
    }

    /// Send the pending renegotiation offer, if any. Kept pending until an
    /// answer arrives so it can be retried when the data channel opens.
    async fn send_pending_offer(&mut self, id: &ParticipantId) {
        let Some(offer) = self
            .registry
            .get(id)
            .and_then(|p| p.pending_offer.clone())
        else {
            return;
        };

        let message = ControlMessage::Negotiate {
            description: SessionDescription {
                kind: SdpType::Offer,
                sdp: offer,
            },
            stream_metadata: self.available_streams_for(id),
        };
        self.send_control_to(id, &message).await;
    }

    async fn send_control_to(&mut self, id: &ParticipantId, message: &ControlMessage) {
        let Some(handle) = self.registry.get(id).map(|p| p.handle.clone()) else {
            return;
        };

        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    target: "sfu.conference",
                    error = %e,
                    "failed to encode control message"
                );
                return;
            }
        };

        if let Err(e) = handle.send_control(Bytes::from(payload)).await {
            debug!(
                target: "sfu.conference",
                participant = %id,
                error = %e,
                "control message not delivered"
            );
        }
    }

    fn recipient_for(&self, id: &ParticipantId) -> Option<MatrixRecipient> {
        let p = self.registry.get(id)?;
        Some(MatrixRecipient {
            user_id: p.id.user_id.clone(),
            device_id: p.id.device_id.clone(),
            call_id: p.id.call_id.clone(),
            conf_id: self.conf_id.clone(),
            remote_session_id: p.remote_session_id.clone(),
        })
    }

    fn teardown_if_idle(&mut self) {
        if self.registry.is_empty() {
            self.set_ended();
        }
    }

    fn set_ended(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        let _ = self.notices.try_send(ConferenceNotice::Ended {
            conf_id: self.conf_id.clone(),
        });
    }

    /// Invariant violations fail the conference, never the process.
    async fn fatal_teardown(&mut self) {
        for id in self.registry.ids() {
            self.remove_participant(&id, LeaveReason::ConferenceEnded)
                .await;
        }
        self.set_ended();
    }

    async fn shutdown(&mut self) {
        debug!(
            target: "sfu.conference",
            conf_id = %self.conf_id,
            "conference shutting down"
        );
        for id in self.registry.ids() {
            self.remove_participant(&id, LeaveReason::ConferenceEnded)
                .await;
        }
        self.set_ended();
    }
}
