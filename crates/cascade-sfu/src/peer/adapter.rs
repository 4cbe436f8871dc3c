//! The WebRTC-backed peer adapter actor.
//!
//! One adapter per participant. Transport callbacks convert ICE, data
//! channel, state and media activity into [`PeerEvent`]s; the actor task
//! serializes [`PeerCommand`]s against the `RTCPeerConnection`. On fatal
//! transport failure the adapter emits `LeftCall` exactly once and refuses
//! further commands.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use cascade_protocol::signaling::CallCandidate;

use crate::conference::messages::ConferenceMessage;
use crate::errors::PeerError;
use crate::stats::ForwardingStats;
use crate::types::{LeaveReason, ParticipantId, SimulcastLayer, TrackId, TrackInfo, TrackKind};

use super::{PeerCommand, PeerEvent, PeerHandle, PEER_COMMAND_BUFFER};

/// Event path from transport callbacks into the conference queue.
///
/// All sends are non-blocking. Media overflow is counted silently; control
/// overflow is loud.
#[derive(Clone)]
struct EventSink {
    participant: ParticipantId,
    tx: mpsc::Sender<ConferenceMessage>,
    stats: Arc<ForwardingStats>,
}

impl EventSink {
    fn emit_control(&self, event: PeerEvent) {
        let kind = event.kind();
        if self
            .tx
            .try_send(ConferenceMessage::Peer {
                sender: self.participant.clone(),
                event,
            })
            .is_err()
        {
            warn!(
                target: "sfu.peer",
                participant = %self.participant,
                event = kind,
                "conference queue full, dropping control event"
            );
            self.stats.record_control_drop();
        }
    }

    fn emit_media(&self, event: PeerEvent) {
        if self
            .tx
            .try_send(ConferenceMessage::Peer {
                sender: self.participant.clone(),
                event,
            })
            .is_err()
        {
            self.stats.record_ingest_drop();
        }
    }
}

/// State kept for one bound egress track.
struct EgressBinding {
    sender: Arc<RTCRtpSender>,
    forwarder: Option<JoinHandle<()>>,
    rtcp_task: JoinHandle<()>,
}

/// The adapter actor. Owns the `RTCPeerConnection` lifecycle.
pub struct PeerAdapter {
    participant: ParticipantId,
    pc: Arc<RTCPeerConnection>,
    commands: mpsc::Receiver<PeerCommand>,
    cancel: CancellationToken,
    sink: EventSink,
    data_channel: Option<Arc<RTCDataChannel>>,
    egress: HashMap<TrackId, EgressBinding>,
    /// Shared with the state-change callback so `LeftCall` fires at most
    /// once, and never after a conference-initiated close.
    left: Arc<AtomicBool>,
}

impl PeerAdapter {
    /// Wire up callbacks on the peer connection and spawn the actor task.
    pub fn spawn(
        participant: ParticipantId,
        pc: Arc<RTCPeerConnection>,
        conference_tx: mpsc::Sender<ConferenceMessage>,
        cancel: CancellationToken,
        stats: Arc<ForwardingStats>,
    ) -> (PeerHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(PEER_COMMAND_BUFFER);

        let sink = EventSink {
            participant: participant.clone(),
            tx: conference_tx,
            stats,
        };

        let left = Arc::new(AtomicBool::new(false));
        register_callbacks(&pc, &sink, &cmd_tx, &left);

        let actor = Self {
            participant,
            pc,
            commands: cmd_rx,
            cancel: cancel.clone(),
            sink,
            data_channel: None,
            egress: HashMap::new(),
            left,
        };

        let task = tokio::spawn(actor.run());
        (PeerHandle::new(cmd_tx, cancel), task)
    }

    async fn run(mut self) {
        debug!(
            target: "sfu.peer",
            participant = %self.participant,
            "peer adapter started"
        );

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.graceful_close().await;
                    break;
                }

                cmd = self.commands.recv() => {
                    match cmd {
                        Some(command) => {
                            if self.handle_command(command).await {
                                break;
                            }
                        }
                        None => {
                            self.graceful_close().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.peer",
            participant = %self.participant,
            "peer adapter stopped"
        );
    }

    /// Handle one command. Returns true when the actor should exit.
    async fn handle_command(&mut self, command: PeerCommand) -> bool {
        match command {
            PeerCommand::ProcessRemoteOffer { sdp, respond_to } => {
                let result = self.apply_remote_offer(sdp).await;
                let _ = respond_to.send(result);
                false
            }

            PeerCommand::ProcessRemoteAnswer { sdp, respond_to } => {
                let result = self.apply_remote_answer(sdp).await;
                let _ = respond_to.send(result);
                false
            }

            PeerCommand::AddIceCandidates { candidates } => {
                self.add_ice_candidates(candidates).await;
                false
            }

            PeerCommand::RemoteCandidatesFinished => {
                debug!(
                    target: "sfu.peer",
                    participant = %self.participant,
                    "remote finished trickling candidates"
                );
                false
            }

            PeerCommand::BindEgress {
                track_id,
                track,
                packets,
            } => {
                self.bind_egress(track_id, track, packets).await;
                false
            }

            PeerCommand::ReleaseEgress { track_id } => {
                self.release_egress(&track_id).await;
                false
            }

            PeerCommand::SendDataChannelMessage {
                payload,
                respond_to,
            } => {
                let result = match &self.data_channel {
                    Some(dc) => dc
                        .send(&payload)
                        .await
                        .map(|_| ())
                        .map_err(|e| PeerError::Transport(e.to_string())),
                    None => Err(PeerError::DataChannelUnavailable),
                };

                match respond_to {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            debug!(
                                target: "sfu.peer",
                                participant = %self.participant,
                                error = %e,
                                "best-effort control message not delivered"
                            );
                        }
                    }
                }
                false
            }

            PeerCommand::RequestKeyFrame {
                track_id,
                media_ssrc,
            } => {
                let pli = PictureLossIndication {
                    sender_ssrc: 0,
                    media_ssrc,
                };
                if let Err(e) = self.pc.write_rtcp(&[Box::new(pli)]).await {
                    debug!(
                        target: "sfu.peer",
                        participant = %self.participant,
                        track_id = %track_id,
                        error = %e,
                        "failed to forward key frame request"
                    );
                }
                false
            }

            PeerCommand::DataChannelOpened { channel } => {
                info!(
                    target: "sfu.peer",
                    participant = %self.participant,
                    label = channel.label(),
                    "data channel open"
                );
                self.data_channel = Some(channel);
                self.sink.emit_control(PeerEvent::DataChannelAvailable);
                false
            }

            PeerCommand::Close => {
                self.graceful_close().await;
                true
            }
        }
    }

    async fn apply_remote_offer(&self, sdp: String) -> Result<String, PeerError> {
        let offer =
            RTCSessionDescription::offer(sdp).map_err(|e| PeerError::InvalidSdp(e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| PeerError::InvalidSdp(e.to_string()))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::Transport(e.to_string()))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| PeerError::Transport(e.to_string()))?;

        Ok(answer.sdp)
    }

    async fn apply_remote_answer(&self, sdp: String) -> Result<(), PeerError> {
        let answer =
            RTCSessionDescription::answer(sdp).map_err(|e| PeerError::InvalidSdp(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| PeerError::InvalidSdp(e.to_string()))
    }

    async fn add_ice_candidates(&self, candidates: Vec<CallCandidate>) {
        for candidate in candidates {
            let init = RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            };

            if let Err(e) = self.pc.add_ice_candidate(init).await {
                warn!(
                    target: "sfu.peer",
                    participant = %self.participant,
                    error = %e,
                    "failed to add remote ICE candidate"
                );
            }
        }
    }

    async fn bind_egress(
        &mut self,
        track_id: TrackId,
        track: Arc<TrackLocalStaticRTP>,
        packets: Option<mpsc::Receiver<webrtc::rtp::packet::Packet>>,
    ) {
        let rtp_sender = match self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
        {
            Ok(sender) => sender,
            Err(e) => {
                error!(
                    target: "sfu.peer",
                    participant = %self.participant,
                    track_id = %track_id,
                    error = %e,
                    "failed to attach egress track"
                );
                return;
            }
        };

        // Drain RTCP from the subscriber; PLIs feed the tracker's key frame
        // regulation.
        let rtcp_sink = self.sink.clone();
        let rtcp_sender = Arc::clone(&rtp_sender);
        let rtcp_track_id = track_id.clone();
        let rtcp_task = tokio::spawn(async move {
            loop {
                match rtcp_sender.read_rtcp().await {
                    Ok((packets, _)) => {
                        rtcp_sink.emit_media(PeerEvent::RtcpReceived {
                            track_id: rtcp_track_id.clone(),
                            packets,
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        let forwarder = packets.map(|mut rx| {
            let egress_track = Arc::clone(&track);
            tokio::spawn(async move {
                while let Some(packet) = rx.recv().await {
                    if egress_track.write_rtp(&packet).await.is_err() {
                        break;
                    }
                }
            })
        });

        self.egress.insert(
            track_id,
            EgressBinding {
                sender: rtp_sender,
                forwarder,
                rtcp_task,
            },
        );
    }

    async fn release_egress(&mut self, track_id: &TrackId) {
        let Some(binding) = self.egress.remove(track_id) else {
            return;
        };

        if let Some(task) = binding.forwarder {
            task.abort();
        }
        binding.rtcp_task.abort();

        if let Err(e) = self.pc.remove_track(&binding.sender).await {
            debug!(
                target: "sfu.peer",
                participant = %self.participant,
                track_id = %track_id,
                error = %e,
                "failed to detach egress track"
            );
        }
    }

    async fn graceful_close(&mut self) {
        // A close initiated from our side must not surface as a peer
        // failure.
        self.left.store(true, Ordering::SeqCst);

        for (_, binding) in self.egress.drain() {
            if let Some(task) = binding.forwarder {
                task.abort();
            }
            binding.rtcp_task.abort();
        }

        if let Err(e) = self.pc.close().await {
            debug!(
                target: "sfu.peer",
                participant = %self.participant,
                error = %e,
                "error closing peer connection"
            );
        }
    }
}

/// Install transport callbacks that translate into peer events.
fn register_callbacks(
    pc: &Arc<RTCPeerConnection>,
    sink: &EventSink,
    cmd_tx: &mpsc::Sender<PeerCommand>,
    left: &Arc<AtomicBool>,
) {
    // Connection lifecycle.
    {
        let sink = sink.clone();
        let left = Arc::clone(left);
        let joined = Arc::new(AtomicBool::new(false));
        let weak_pc = Arc::downgrade(pc);

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = sink.clone();
            let left = Arc::clone(&left);
            let joined = Arc::clone(&joined);
            let weak_pc = weak_pc.clone();

            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Connected => {
                        if !joined.swap(true, Ordering::SeqCst) {
                            sink.emit_control(PeerEvent::JoinedCall);
                        }
                    }
                    RTCPeerConnectionState::Failed => {
                        if !left.swap(true, Ordering::SeqCst) {
                            let reason = match weak_pc.upgrade() {
                                Some(pc)
                                    if pc.ice_connection_state()
                                        == RTCIceConnectionState::Failed =>
                                {
                                    LeaveReason::IceFailed
                                }
                                _ => LeaveReason::DtlsFailed,
                            };
                            sink.emit_control(PeerEvent::LeftCall { reason });
                        }
                    }
                    RTCPeerConnectionState::Closed => {
                        if !left.swap(true, Ordering::SeqCst) {
                            sink.emit_control(PeerEvent::LeftCall {
                                reason: LeaveReason::ClientLeft,
                            });
                        }
                    }
                    _ => {}
                }
            })
        }));
    }

    // Trickled local candidates.
    {
        let sink = sink.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(json) => sink.emit_control(PeerEvent::NewIceCandidate {
                        candidate: CallCandidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                        },
                    }),
                    Err(e) => warn!(
                        target: "sfu.peer",
                        error = %e,
                        "failed to serialize local ICE candidate"
                    ),
                }
            })
        }));
    }

    // End of local gathering.
    {
        let sink = sink.clone();
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            let sink = sink.clone();
            Box::pin(async move {
                if state == RTCIceGathererState::Complete {
                    sink.emit_control(PeerEvent::IceGatheringComplete);
                }
            })
        }));
    }

    // Renegotiation: produce the offer here, ship it over the data channel
    // from the conference.
    {
        let sink = sink.clone();
        let weak_pc = Arc::downgrade(pc);
        pc.on_negotiation_needed(Box::new(move || {
            let sink = sink.clone();
            let weak_pc = weak_pc.clone();
            Box::pin(async move {
                let Some(pc) = weak_pc.upgrade() else { return };
                if pc.signaling_state() != RTCSignalingState::Stable {
                    return;
                }

                let offer = match pc.create_offer(None).await {
                    Ok(offer) => offer,
                    Err(e) => {
                        debug!(target: "sfu.peer", error = %e, "create_offer failed");
                        return;
                    }
                };
                if let Err(e) = pc.set_local_description(offer.clone()).await {
                    debug!(target: "sfu.peer", error = %e, "set_local_description failed");
                    return;
                }

                sink.emit_control(PeerEvent::RenegotiationRequired {
                    offer_sdp: offer.sdp,
                });
            })
        }));
    }

    // Published tracks: one callback per track (and per simulcast layer).
    {
        let sink = sink.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let sink = sink.clone();
            Box::pin(async move {
                let kind = TrackKind::from(track.kind());
                let layer = match kind {
                    TrackKind::Audio => SimulcastLayer::None,
                    TrackKind::Video => SimulcastLayer::from_rid(&track.rid().to_string()),
                };

                let info = Arc::new(TrackInfo {
                    id: TrackId::from(track.id()),
                    stream_id: track.stream_id(),
                    kind,
                    codec: track.codec().capability,
                });

                // Audio gets a single shared fan-out sink all subscribers
                // attach; video is forwarded per subscription.
                let output_track = match kind {
                    TrackKind::Audio => Some(Arc::new(TrackLocalStaticRTP::new(
                        info.codec.clone(),
                        track.id(),
                        track.stream_id(),
                    ))),
                    TrackKind::Video => None,
                };

                info!(
                    target: "sfu.peer",
                    track_id = %info.id,
                    kind = %kind,
                    layer = %layer,
                    ssrc = track.ssrc(),
                    "remote track published"
                );

                sink.emit_control(PeerEvent::NewTrackPublished {
                    info: Arc::clone(&info),
                    layer,
                    ssrc: track.ssrc(),
                    output_track,
                });

                loop {
                    match track.read_rtp().await {
                        Ok((packet, _)) => {
                            sink.emit_media(PeerEvent::RtpReceived {
                                info: Arc::clone(&info),
                                layer,
                                packet,
                            });
                        }
                        Err(_) => break,
                    }
                }

                sink.emit_control(PeerEvent::PublishedTrackFailed {
                    track_id: info.id.clone(),
                });
            })
        }));
    }

    // Control data channel, created by the peer.
    {
        let cmd_tx = cmd_tx.clone();
        let sink = sink.clone();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let cmd_tx = cmd_tx.clone();
            let sink = sink.clone();
            Box::pin(async move {
                let msg_sink = sink.clone();
                channel.on_message(Box::new(move |message: DataChannelMessage| {
                    msg_sink.emit_control(PeerEvent::DataChannelMessage {
                        payload: message.data,
                    });
                    Box::pin(async {})
                }));

                if channel.ready_state() == RTCDataChannelState::Open {
                    let _ = cmd_tx.try_send(PeerCommand::DataChannelOpened {
                        channel: Arc::clone(&channel),
                    });
                    return;
                }

                let open_channel = Arc::clone(&channel);
                let open_tx = cmd_tx.clone();
                channel.on_open(Box::new(move || {
                    let _ = open_tx.try_send(PeerCommand::DataChannelOpened {
                        channel: Arc::clone(&open_channel),
                    });
                    Box::pin(async {})
                }));
            })
        }));
    }
}
