//! Shared harness for conference integration tests.
//!
//! Conferences are driven without any real transport: a stub peer factory
//! hands out channel-backed peer handles whose commands are auto-answered
//! and captured for assertions, and a capture transport records outbound
//! signaling.

// Each test binary uses a different slice of the harness.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use webrtc::rtp;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use cascade_protocol::control::ControlMessage;
use cascade_protocol::metadata::StreamMetadataMap;

use cascade_sfu::conference::messages::{ConferenceMessage, SignalingEvent};
use cascade_sfu::conference::{Conference, ConferenceHandle, ConferenceNotice};
use cascade_sfu::config::ConferenceConfig;
use cascade_sfu::errors::{PeerError, SfuError};
use cascade_sfu::peer::factory::PeerFactory;
use cascade_sfu::peer::{PeerCommand, PeerEvent, PeerHandle};
use cascade_sfu::signaling::{SignalingTransport, SignalingWorker};
use cascade_sfu::stats::ForwardingStats;
use cascade_sfu::types::{ParticipantId, SimulcastLayer, TrackId, TrackInfo, TrackKind};

pub const WAIT: Duration = Duration::from_secs(5);

/// One outbound signaling event as seen by the homeserver.
#[derive(Debug, Clone)]
pub struct SentEvent {
    pub user_id: String,
    pub device_id: String,
    pub event_type: String,
    pub content: serde_json::Value,
}

#[derive(Default)]
pub struct CaptureTransport {
    pub sent: Mutex<Vec<SentEvent>>,
}

#[async_trait]
impl SignalingTransport for CaptureTransport {
    async fn send_to_device(
        &self,
        user_id: &str,
        device_id: &str,
        event_type: &str,
        content: serde_json::Value,
    ) -> Result<(), SfuError> {
        self.sent.lock().unwrap().push(SentEvent {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            event_type: event_type.to_owned(),
            content,
        });
        Ok(())
    }
}

impl CaptureTransport {
    /// Wait for an event of the given type addressed to the given user.
    pub async fn wait_for(&self, event_type: &str, user_id: &str) -> SentEvent {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if let Some(event) = self
                .sent
                .lock()
                .unwrap()
                .iter()
                .find(|e| e.event_type == event_type && e.user_id == user_id)
                .cloned()
            {
                return event;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no {event_type} sent to {user_id}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// What the stub peer saw, as captured command descriptors.
pub enum StubCommand {
    Offer(String),
    Answer(String),
    Candidates(usize),
    CandidatesFinished,
    BindEgress {
        track_id: TrackId,
        track: Arc<TrackLocalStaticRTP>,
        packets: Option<mpsc::Receiver<rtp::packet::Packet>>,
    },
    ReleaseEgress(TrackId),
    Control(ControlMessage),
    KeyFrame {
        track_id: TrackId,
        media_ssrc: u32,
    },
    Close,
}

/// Test-side view of one stubbed peer.
pub struct PeerProbe {
    pub id: ParticipantId,
    pub commands: mpsc::UnboundedReceiver<StubCommand>,
    /// Controls whether the stub accepts data-channel sends.
    pub dc_open: Arc<AtomicBool>,
}

impl PeerProbe {
    pub async fn next_command(&mut self) -> StubCommand {
        tokio::time::timeout(WAIT, self.commands.recv())
            .await
            .expect("timed out waiting for a peer command")
            .expect("stub peer closed")
    }

    /// Skip ahead to the next delivered control message.
    pub async fn next_control(&mut self) -> ControlMessage {
        loop {
            if let StubCommand::Control(message) = self.next_command().await {
                return message;
            }
        }
    }

    /// Skip ahead to the next dedicated egress binding.
    pub async fn next_egress(&mut self) -> (TrackId, mpsc::Receiver<rtp::packet::Packet>) {
        loop {
            if let StubCommand::BindEgress {
                track_id,
                packets: Some(packets),
                ..
            } = self.next_command().await
            {
                return (track_id, packets);
            }
        }
    }

    /// Skip ahead to the next shared (audio) egress binding.
    pub async fn next_shared_egress(&mut self) -> (TrackId, Arc<TrackLocalStaticRTP>) {
        loop {
            if let StubCommand::BindEgress {
                track_id,
                packets: None,
                track,
            } = self.next_command().await
            {
                return (track_id, track);
            }
        }
    }

    /// Everything captured so far, without waiting.
    pub fn drain(&mut self) -> Vec<StubCommand> {
        let mut commands = Vec::new();
        while let Ok(command) = self.commands.try_recv() {
            commands.push(command);
        }
        commands
    }

    pub fn drain_keyframe_ssrcs(&mut self) -> Vec<u32> {
        self.drain()
            .into_iter()
            .filter_map(|command| match command {
                StubCommand::KeyFrame { media_ssrc, .. } => Some(media_ssrc),
                _ => None,
            })
            .collect()
    }
}

async fn run_stub(
    mut commands: mpsc::Receiver<PeerCommand>,
    capture: mpsc::UnboundedSender<StubCommand>,
    dc_open: Arc<AtomicBool>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            PeerCommand::ProcessRemoteOffer { sdp, respond_to } => {
                let _ = respond_to.send(Ok("v=0\r\ns=answer\r\n".to_owned()));
                let _ = capture.send(StubCommand::Offer(sdp));
            }
            PeerCommand::ProcessRemoteAnswer { sdp, respond_to } => {
                let _ = respond_to.send(Ok(()));
                let _ = capture.send(StubCommand::Answer(sdp));
            }
            PeerCommand::AddIceCandidates { candidates } => {
                let _ = capture.send(StubCommand::Candidates(candidates.len()));
            }
            PeerCommand::RemoteCandidatesFinished => {
                let _ = capture.send(StubCommand::CandidatesFinished);
            }
            PeerCommand::BindEgress {
                track_id,
                track,
                packets,
            } => {
                let _ = capture.send(StubCommand::BindEgress {
                    track_id,
                    track,
                    packets,
                });
            }
            PeerCommand::ReleaseEgress { track_id } => {
                let _ = capture.send(StubCommand::ReleaseEgress(track_id));
            }
            PeerCommand::SendDataChannelMessage {
                payload,
                respond_to,
            } => {
                let open = dc_open.load(Ordering::SeqCst);
                let result = if open {
                    Ok(())
                } else {
                    Err(PeerError::DataChannelUnavailable)
                };
                if let Some(tx) = respond_to {
                    let _ = tx.send(result);
                }
                if open {
                    if let Ok(message) = ControlMessage::parse(&payload) {
                        let _ = capture.send(StubCommand::Control(message));
                    }
                }
            }
            PeerCommand::RequestKeyFrame {
                track_id,
                media_ssrc,
            } => {
                let _ = capture.send(StubCommand::KeyFrame {
                    track_id,
                    media_ssrc,
                });
            }
            PeerCommand::DataChannelOpened { .. } => {}
            PeerCommand::Close => {
                let _ = capture.send(StubCommand::Close);
                break;
            }
        }
    }
}

/// Peer factory handing out stubbed peers.
pub struct StubFactory {
    created: Mutex<VecDeque<PeerProbe>>,
    dc_open_default: bool,
}

impl StubFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            created: Mutex::new(VecDeque::new()),
            dc_open_default: true,
        })
    }

    /// Peers start with the data channel closed; tests open it by flipping
    /// the probe's flag and injecting `DataChannelAvailable`.
    pub fn with_closed_data_channels() -> Arc<Self> {
        Arc::new(Self {
            created: Mutex::new(VecDeque::new()),
            dc_open_default: false,
        })
    }

    /// How many created peers have not been claimed by the test yet.
    pub fn pending_probes(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub async fn take_probe(&self) -> PeerProbe {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if let Some(probe) = self.created.lock().unwrap().pop_front() {
                return probe;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no peer was created"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl PeerFactory for StubFactory {
    async fn create_peer(
        &self,
        participant: ParticipantId,
        _conference_tx: mpsc::Sender<ConferenceMessage>,
        cancel: CancellationToken,
        _stats: Arc<ForwardingStats>,
    ) -> Result<(PeerHandle, JoinHandle<()>), PeerError> {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let dc_open = Arc::new(AtomicBool::new(self.dc_open_default));

        let task = tokio::spawn(run_stub(cmd_rx, capture_tx, Arc::clone(&dc_open)));

        self.created.lock().unwrap().push_back(PeerProbe {
            id: participant,
            commands: capture_rx,
            dc_open,
        });

        Ok((PeerHandle::new(cmd_tx, cancel), task))
    }
}

/// A conference under test plus its probes.
pub struct TestConference {
    pub handle: ConferenceHandle,
    pub factory: Arc<StubFactory>,
    pub transport: Arc<CaptureTransport>,
    pub notices: mpsc::Receiver<ConferenceNotice>,
    pub task: JoinHandle<()>,
}

pub fn test_config() -> ConferenceConfig {
    ConferenceConfig {
        keepalive_ping_interval_secs: 60,
        keepalive_timeout_secs: 60,
        send_keyframe_interval_ms: 50,
        max_event_queue_depth: 256,
    }
}

pub fn start_conference(config: ConferenceConfig, factory: Arc<StubFactory>) -> TestConference {
    let transport = Arc::new(CaptureTransport::default());
    let (signaling, _signaling_task) = SignalingWorker::spawn(
        Arc::clone(&transport) as Arc<dyn SignalingTransport>,
        "SFUDEV".to_owned(),
        "sfu-session".to_owned(),
        CancellationToken::new(),
    );

    let (notices_tx, notices_rx) = mpsc::channel(8);

    let (handle, task) = Conference::spawn(
        "conf-1".to_owned(),
        config,
        "SFUDEV".to_owned(),
        Arc::clone(&factory) as Arc<dyn PeerFactory>,
        signaling,
        notices_tx,
        CancellationToken::new(),
    );

    TestConference {
        handle,
        factory,
        transport,
        notices: notices_rx,
        task,
    }
}

pub fn participant(user: &str) -> ParticipantId {
    ParticipantId {
        user_id: user.to_owned(),
        device_id: format!("DEV-{user}"),
        call_id: format!("call-{user}"),
    }
}

/// Invite a participant and hand back their stub probe (with the initial
/// offer already consumed).
pub async fn join(
    conference: &TestConference,
    user: &str,
    streams: StreamMetadataMap,
) -> (ParticipantId, PeerProbe) {
    let id = participant(user);
    conference
        .handle
        .deliver(SignalingEvent::Invite {
            participant: id.clone(),
            remote_session_id: format!("sess-{user}"),
            offer_sdp: "v=0\r\ns=offer\r\n".to_owned(),
            stream_metadata: streams,
            candidates: Vec::new(),
        })
        .await
        .expect("conference gone");

    let mut probe = conference.factory.take_probe().await;
    match probe.next_command().await {
        StubCommand::Offer(_) => {}
        _ => panic!("expected the initial offer first"),
    }
    (id, probe)
}

/// Inject a peer event as if the participant's adapter emitted it.
pub async fn peer_event(conference: &TestConference, sender: &ParticipantId, event: PeerEvent) {
    conference
        .handle
        .sender()
        .send(ConferenceMessage::Peer {
            sender: sender.clone(),
            event,
        })
        .await
        .expect("conference gone");
}

/// Open the participant's data channel from the conference's perspective
/// and swallow the metadata refresh it triggers.
pub async fn open_data_channel(
    conference: &TestConference,
    id: &ParticipantId,
    probe: &mut PeerProbe,
) {
    probe.dc_open.store(true, Ordering::SeqCst);
    peer_event(conference, id, PeerEvent::DataChannelAvailable).await;
    loop {
        if let ControlMessage::MetadataChanged { .. } = probe.next_control().await {
            break;
        }
    }
}

pub fn video_info(id: &str) -> Arc<TrackInfo> {
    Arc::new(TrackInfo {
        id: TrackId::from(id),
        stream_id: format!("stream-{id}"),
        kind: TrackKind::Video,
        codec: RTCRtpCodecCapability::default(),
    })
}

pub fn audio_info(id: &str) -> Arc<TrackInfo> {
    Arc::new(TrackInfo {
        id: TrackId::from(id),
        stream_id: format!("stream-{id}"),
        kind: TrackKind::Audio,
        codec: RTCRtpCodecCapability::default(),
    })
}

/// Publish a three-layer simulcast video track from `publisher`.
pub async fn publish_simulcast(
    conference: &TestConference,
    publisher: &ParticipantId,
    info: &Arc<TrackInfo>,
) {
    for (layer, ssrc) in [
        (SimulcastLayer::Low, 101),
        (SimulcastLayer::Medium, 102),
        (SimulcastLayer::High, 103),
    ] {
        peer_event(
            conference,
            publisher,
            PeerEvent::NewTrackPublished {
                info: Arc::clone(info),
                layer,
                ssrc,
                output_track: None,
            },
        )
        .await;
    }
}

/// Build the raw `track_subscription` control payload.
pub fn subscription_payload(subscribe: &[(&str, u32, u32)], unsubscribe: &[&str]) -> bytes::Bytes {
    let subscribe: Vec<serde_json::Value> = subscribe
        .iter()
        .map(|(track_id, width, height)| {
            serde_json::json!({"trackId": track_id, "width": width, "height": height})
        })
        .collect();
    let unsubscribe: Vec<serde_json::Value> = unsubscribe
        .iter()
        .map(|track_id| serde_json::json!({"trackId": track_id}))
        .collect();

    let message = serde_json::json!({
        "type": "track_subscription",
        "subscribe": subscribe,
        "unsubscribe": unsubscribe,
    });
    bytes::Bytes::from(serde_json::to_vec(&message).expect("valid json"))
}

/// Stream metadata announcing one video track at the given size.
pub fn video_stream_metadata(stream_id: &str, track_id: &str, width: u32, height: u32) -> StreamMetadataMap {
    serde_json::from_value(serde_json::json!({
        stream_id: {
            "purpose": "m.usermedia",
            "tracks": { track_id: { "width": width, "height": height } }
        }
    }))
    .expect("valid metadata")
}

/// An RTP packet with a recognizable sequence number.
pub fn rtp_packet(seq: u16) -> rtp::packet::Packet {
    let mut packet = rtp::packet::Packet::default();
    packet.header.sequence_number = seq;
    packet
}
