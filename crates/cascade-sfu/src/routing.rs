//! The router: demultiplexes inbound signaling to conferences.
//!
//! One task owns the conference table. The first invite for a conference id
//! creates the conference; a notice from the conference when its last
//! participant leaves removes it. Everything else is forwarded in bus
//! order.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cascade_protocol::control::SdpType;
use cascade_protocol::signaling::CallEvent;

use crate::conference::messages::SignalingEvent;
use crate::conference::{Conference, ConferenceHandle, ConferenceNotice};
use crate::config::ConferenceConfig;
use crate::peer::factory::PeerFactory;
use crate::signaling::client::InboundSignal;
use crate::signaling::SignalingHandle;
use crate::types::ParticipantId;

/// Bound on conference-ended notices; reaping is cheap and prompt.
const NOTICE_QUEUE_DEPTH: usize = 64;

struct ManagedConference {
    handle: ConferenceHandle,
    task: JoinHandle<()>,
}

pub struct Router {
    conference_config: ConferenceConfig,
    local_user_id: String,
    local_device_id: String,
    factory: Arc<dyn PeerFactory>,
    signaling: SignalingHandle,
    inbound: mpsc::Receiver<InboundSignal>,
    notices_tx: mpsc::Sender<ConferenceNotice>,
    notices_rx: mpsc::Receiver<ConferenceNotice>,
    conferences: HashMap<String, ManagedConference>,
    cancel: CancellationToken,
}

impl Router {
    /// Spawn the router task over a stream of inbound signaling.
    pub fn spawn(
        conference_config: ConferenceConfig,
        local_user_id: String,
        local_device_id: String,
        factory: Arc<dyn PeerFactory>,
        signaling: SignalingHandle,
        inbound: mpsc::Receiver<InboundSignal>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let (notices_tx, notices_rx) = mpsc::channel(NOTICE_QUEUE_DEPTH);

        let router = Self {
            conference_config,
            local_user_id,
            local_device_id,
            factory,
            signaling,
            inbound,
            notices_tx,
            notices_rx,
            conferences: HashMap::new(),
            cancel,
        };

        tokio::spawn(router.run())
    }

    async fn run(mut self) {
        info!(target: "sfu.router", "router started");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.shutdown();
                    break;
                }

                notice = self.notices_rx.recv() => {
                    if let Some(ConferenceNotice::Ended { conf_id }) = notice {
                        info!(target: "sfu.router", conf_id, "conference ended");
                        self.conferences.remove(&conf_id);
                    }
                }

                signal = self.inbound.recv() => {
                    match signal {
                        Some(signal) => self.route(signal).await,
                        None => {
                            info!(target: "sfu.router", "signaling stream closed");
                            self.shutdown();
                            break;
                        }
                    }
                }
            }
        }

        info!(target: "sfu.router", "router stopped");
    }

    async fn route(&mut self, signal: InboundSignal) {
        let event = match CallEvent::parse(&signal.event_type, signal.content) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                warn!(
                    target: "sfu.router",
                    event_type = %signal.event_type,
                    error = %e,
                    "malformed call event, dropping"
                );
                return;
            }
        };

        let conf_id = event.conf_id().to_owned();
        let Some((participant, translated)) = self.translate(signal.sender, event) else {
            return;
        };

        let is_invite = matches!(translated, SignalingEvent::Invite { .. });

        if !self.conferences.contains_key(&conf_id) {
            if !is_invite {
                debug!(
                    target: "sfu.router",
                    conf_id,
                    participant = %participant,
                    "event for unknown conference, ignoring"
                );
                return;
            }

            info!(target: "sfu.router", conf_id, "creating conference");
            let (handle, task) = Conference::spawn(
                conf_id.clone(),
                self.conference_config.clone(),
                self.local_device_id.clone(),
                Arc::clone(&self.factory),
                self.signaling.clone(),
                self.notices_tx.clone(),
                self.cancel.child_token(),
            );
            self.conferences
                .insert(conf_id.clone(), ManagedConference { handle, task });
        }

        let Some(conference) = self.conferences.get(&conf_id) else {
            return;
        };

        if let Err(e) = conference.handle.deliver(translated).await {
            warn!(
                target: "sfu.router",
                conf_id,
                error = %e,
                "failed to deliver signaling event"
            );
            self.conferences.remove(&conf_id);
        }
    }

    /// Translate a wire event into a conference message, or drop it.
    fn translate(
        &self,
        sender: String,
        event: CallEvent,
    ) -> Option<(ParticipantId, SignalingEvent)> {
        // Our own outbound events echo through sync; never route them.
        if sender == self.local_user_id {
            return None;
        }

        match event {
            CallEvent::Invite(content) => {
                if content.offer.kind != SdpType::Offer {
                    warn!(
                        target: "sfu.router",
                        call_id = %content.call_id,
                        "invite without an offer description, dropping"
                    );
                    return None;
                }
                let participant = ParticipantId {
                    user_id: sender,
                    device_id: content.party_id,
                    call_id: content.call_id,
                };
                let event = SignalingEvent::Invite {
                    participant: participant.clone(),
                    remote_session_id: content.sender_session_id,
                    offer_sdp: content.offer.sdp,
                    stream_metadata: content.sdp_stream_metadata,
                    candidates: content.candidates,
                };
                Some((participant, event))
            }

            CallEvent::Candidates(content) => {
                let participant = ParticipantId {
                    user_id: sender,
                    device_id: content.party_id,
                    call_id: content.call_id,
                };
                // An empty list is the end-of-candidates marker.
                let event = if content.candidates.is_empty() {
                    SignalingEvent::CandidatesEnd {
                        participant: participant.clone(),
                    }
                } else {
                    SignalingEvent::Candidates {
                        participant: participant.clone(),
                        candidates: content.candidates,
                    }
                };
                Some((participant, event))
            }

            CallEvent::SelectAnswer(content) => {
                let participant = ParticipantId {
                    user_id: sender,
                    device_id: content.party_id,
                    call_id: content.call_id,
                };
                let event = SignalingEvent::SelectAnswer {
                    participant: participant.clone(),
                    selected_party_id: content.selected_party_id,
                };
                Some((participant, event))
            }

            CallEvent::Hangup(content) => {
                let participant = ParticipantId {
                    user_id: sender,
                    device_id: content.party_id,
                    call_id: content.call_id,
                };
                let event = SignalingEvent::Hangup {
                    participant: participant.clone(),
                    reason: content.reason,
                };
                Some((participant, event))
            }
        }
    }

    fn shutdown(&mut self) {
        // Cancellation lets each conference drain: participants removed,
        // hangups sent, adapters closed.
        for (conf_id, conference) in self.conferences.drain() {
            debug!(target: "sfu.router", conf_id, "cancelling conference");
            conference.handle.cancel();
            drop(conference.task);
        }
    }
}
