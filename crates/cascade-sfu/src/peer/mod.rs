//! Peer adapters - the per-participant wrapper over the media transport.
//!
//! Each participant owns one adapter task. The adapter converts everything
//! the transport produces (ICE, data channel, RTP, RTCP, connection state)
//! into [`PeerEvent`]s tagged with the participant id and pushed onto the
//! conference's single inbound queue, and accepts [`PeerCommand`]s through a
//! cloneable [`PeerHandle`].
//!
//! Delivery discipline: commands and events never block their producer.
//! Events are enqueued with `try_send`; a full conference queue drops RTP
//! silently (counted) and drops control events loudly. This is what makes it
//! safe for the conference task to await command responses from an adapter.

pub mod adapter;
pub mod factory;

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use webrtc::data_channel::RTCDataChannel;
use webrtc::rtp;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use cascade_protocol::signaling::CallCandidate;

use crate::errors::PeerError;
use crate::stats::ForwardingStats;
use crate::types::{LeaveReason, SimulcastLayer, TrackId, TrackInfo};

/// Command mailbox bound per adapter.
pub const PEER_COMMAND_BUFFER: usize = 64;

/// Per-subscription egress queue depth. A slow subscriber loses packets
/// once this many are in flight; other subscribers are unaffected.
pub const EGRESS_QUEUE_DEPTH: usize = 64;

/// A boxed RTCP packet as produced by the transport.
pub type RtcpPacket = Box<dyn webrtc::rtcp::packet::Packet + Send + Sync>;

/// Everything a peer adapter can tell its conference.
pub enum PeerEvent {
    /// The transport reached the connected state.
    JoinedCall,
    /// The transport failed or closed. Emitted at most once per adapter.
    LeftCall { reason: LeaveReason },
    /// The peer started sending a track (one event per simulcast layer).
    NewTrackPublished {
        info: Arc<TrackInfo>,
        layer: SimulcastLayer,
        ssrc: u32,
        /// Shared egress sink, present for audio only.
        output_track: Option<Arc<TrackLocalStaticRTP>>,
    },
    /// An ingest track stopped producing packets.
    PublishedTrackFailed { track_id: TrackId },
    /// A local ICE candidate to trickle over signaling.
    NewIceCandidate { candidate: CallCandidate },
    /// Local ICE gathering finished.
    IceGatheringComplete,
    /// The transport needs renegotiation; the offer is ready to send.
    RenegotiationRequired { offer_sdp: String },
    /// The control data channel is open.
    DataChannelAvailable,
    /// A raw control message from the peer.
    DataChannelMessage { payload: Bytes },
    /// One RTP packet from an ingest track.
    RtpReceived {
        info: Arc<TrackInfo>,
        layer: SimulcastLayer,
        packet: rtp::packet::Packet,
    },
    /// RTCP feedback from the peer about a track it subscribes to.
    RtcpReceived {
        track_id: TrackId,
        packets: Vec<RtcpPacket>,
    },
}

impl PeerEvent {
    /// Short name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            PeerEvent::JoinedCall => "joined_call",
            PeerEvent::LeftCall { .. } => "left_call",
            PeerEvent::NewTrackPublished { .. } => "new_track_published",
            PeerEvent::PublishedTrackFailed { .. } => "published_track_failed",
            PeerEvent::NewIceCandidate { .. } => "new_ice_candidate",
            PeerEvent::IceGatheringComplete => "ice_gathering_complete",
            PeerEvent::RenegotiationRequired { .. } => "renegotiation_required",
            PeerEvent::DataChannelAvailable => "data_channel_available",
            PeerEvent::DataChannelMessage { .. } => "data_channel_message",
            PeerEvent::RtpReceived { .. } => "rtp_received",
            PeerEvent::RtcpReceived { .. } => "rtcp_received",
        }
    }
}

/// Commands accepted by a peer adapter.
pub enum PeerCommand {
    /// Apply a remote offer and produce the local answer SDP.
    ProcessRemoteOffer {
        sdp: String,
        respond_to: oneshot::Sender<Result<String, PeerError>>,
    },
    /// Apply a remote answer (renegotiation completion).
    ProcessRemoteAnswer {
        sdp: String,
        respond_to: oneshot::Sender<Result<(), PeerError>>,
    },
    /// Add trickled remote ICE candidates.
    AddIceCandidates { candidates: Vec<CallCandidate> },
    /// The remote signalled the end of candidate trickling.
    RemoteCandidatesFinished,
    /// Attach an egress track for a subscription. When `packets` is `Some`
    /// the adapter forwards from that queue onto the track; when `None` the
    /// track is a shared sink written elsewhere (audio fan-out).
    BindEgress {
        track_id: TrackId,
        track: Arc<TrackLocalStaticRTP>,
        packets: Option<mpsc::Receiver<rtp::packet::Packet>>,
    },
    /// Detach a previously bound egress track.
    ReleaseEgress { track_id: TrackId },
    /// Send a control message over the data channel.
    SendDataChannelMessage {
        payload: Bytes,
        respond_to: Option<oneshot::Sender<Result<(), PeerError>>>,
    },
    /// Ask the publisher for a key frame on the given ingest SSRC.
    RequestKeyFrame { track_id: TrackId, media_ssrc: u32 },
    /// Internal: the transport announced an open data channel.
    DataChannelOpened { channel: Arc<RTCDataChannel> },
    /// Shut the adapter down and release the transport.
    Close,
}

/// Cloneable handle to a peer adapter.
///
/// Constructible from raw parts so conferences can be driven in tests
/// without a real transport behind the handle.
#[derive(Clone)]
pub struct PeerHandle {
    sender: mpsc::Sender<PeerCommand>,
    cancel: CancellationToken,
}

impl PeerHandle {
    #[must_use]
    pub fn new(sender: mpsc::Sender<PeerCommand>, cancel: CancellationToken) -> Self {
        Self { sender, cancel }
    }

    /// Apply a remote offer; resolves to the answer SDP.
    pub async fn process_remote_offer(&self, sdp: String) -> Result<String, PeerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PeerCommand::ProcessRemoteOffer {
                sdp,
                respond_to: tx,
            })
            .await
            .map_err(|_| PeerError::Closed)?;
        rx.await.map_err(|_| PeerError::Closed)?
    }

    /// Apply a remote answer.
    pub async fn process_remote_answer(&self, sdp: String) -> Result<(), PeerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PeerCommand::ProcessRemoteAnswer {
                sdp,
                respond_to: tx,
            })
            .await
            .map_err(|_| PeerError::Closed)?;
        rx.await.map_err(|_| PeerError::Closed)?
    }

    pub async fn add_ice_candidates(
        &self,
        candidates: Vec<CallCandidate>,
    ) -> Result<(), PeerError> {
        self.sender
            .send(PeerCommand::AddIceCandidates { candidates })
            .await
            .map_err(|_| PeerError::Closed)
    }

    pub async fn remote_candidates_finished(&self) -> Result<(), PeerError> {
        self.sender
            .send(PeerCommand::RemoteCandidatesFinished)
            .await
            .map_err(|_| PeerError::Closed)
    }

    /// Attach a per-subscription egress track and return its non-blocking
    /// packet sender. The returned sender drops packets when the
    /// subscriber's queue is full.
    pub fn bind_egress(
        &self,
        track_id: TrackId,
        track: Arc<TrackLocalStaticRTP>,
        stats: Arc<ForwardingStats>,
    ) -> Result<EgressSender, PeerError> {
        let (tx, rx) = mpsc::channel(EGRESS_QUEUE_DEPTH);
        self.sender
            .try_send(PeerCommand::BindEgress {
                track_id: track_id.clone(),
                track,
                packets: Some(rx),
            })
            .map_err(|_| PeerError::Closed)?;
        Ok(EgressSender {
            track_id,
            tx,
            stats,
        })
    }

    /// Attach a shared egress sink (audio fan-out track) without a
    /// forwarding queue; the sink is written by its publisher's fan-out.
    pub fn bind_shared_egress(
        &self,
        track_id: TrackId,
        track: Arc<TrackLocalStaticRTP>,
    ) -> Result<(), PeerError> {
        self.sender
            .try_send(PeerCommand::BindEgress {
                track_id,
                track,
                packets: None,
            })
            .map_err(|_| PeerError::Closed)
    }

    /// Detach an egress track. Best-effort and idempotent.
    pub fn release_egress(&self, track_id: TrackId) {
        if self
            .sender
            .try_send(PeerCommand::ReleaseEgress { track_id })
            .is_err()
        {
            // Adapter is gone or saturated; the egress dies with it.
        }
    }

    /// Send a control message and wait for the delivery verdict.
    ///
    /// Fails with [`PeerError::DataChannelUnavailable`] before the channel
    /// is open; callers decide per message kind whether to retry later.
    pub async fn send_control(&self, payload: Bytes) -> Result<(), PeerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PeerCommand::SendDataChannelMessage {
                payload,
                respond_to: Some(tx),
            })
            .await
            .map_err(|_| PeerError::Closed)?;
        rx.await.map_err(|_| PeerError::Closed)?
    }

    /// Send a control message without waiting for the outcome.
    pub fn send_control_best_effort(&self, payload: Bytes) {
        if self
            .sender
            .try_send(PeerCommand::SendDataChannelMessage {
                payload,
                respond_to: None,
            })
            .is_err()
        {
            warn!(target: "sfu.peer", "dropping control message for saturated or closed peer");
        }
    }

    /// Ask the publisher behind this handle for a key frame.
    pub fn request_key_frame(&self, track_id: TrackId, media_ssrc: u32) {
        if self
            .sender
            .try_send(PeerCommand::RequestKeyFrame {
                track_id,
                media_ssrc,
            })
            .is_err()
        {
            warn!(target: "sfu.peer", "dropping key frame request for saturated or closed peer");
        }
    }

    /// Shut the adapter down. Subsequent commands fail with `Closed`.
    pub async fn close(&self) {
        let _ = self.sender.send(PeerCommand::Close).await;
        self.cancel.cancel();
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Non-blocking packet path for one subscription.
pub struct EgressSender {
    track_id: TrackId,
    tx: mpsc::Sender<rtp::packet::Packet>,
    stats: Arc<ForwardingStats>,
}

impl EgressSender {
    #[must_use]
    pub fn new(
        track_id: TrackId,
        tx: mpsc::Sender<rtp::packet::Packet>,
        stats: Arc<ForwardingStats>,
    ) -> Self {
        Self {
            track_id,
            tx,
            stats,
        }
    }

    /// Forward one packet; drops (and counts) on a full or closed queue.
    pub fn forward(&self, packet: rtp::packet::Packet) {
        if self.tx.try_send(packet).is_err() {
            self.stats.record_egress_drop();
        }
    }

    #[must_use]
    pub fn track_id(&self) -> &TrackId {
        &self.track_id
    }
}
