//! Outbound signaling: the path from conferences back onto the Matrix bus.
//!
//! Conferences enqueue semantic messages on the [`SignalingHandle`]; a
//! single worker task renders them into wire payloads (echoing the
//! participant's identifiers and session token verbatim) and pushes them
//! through the pluggable [`SignalingTransport`]. Tests substitute a
//! transport that captures the payloads.

pub mod client;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cascade_protocol::control::{SdpType, SessionDescription};
use cascade_protocol::metadata::StreamMetadataMap;
use cascade_protocol::signaling::{
    wire_version, AnswerContent, CallCandidate, CandidatesContent, HangupContent, CALL_ANSWER,
    CALL_CANDIDATES, CALL_HANGUP,
};

use crate::errors::SfuError;

/// Queue bound for outbound signaling.
const SIGNALING_QUEUE_DEPTH: usize = 256;

/// Where an outbound event goes and which identifiers it must echo.
#[derive(Debug, Clone)]
pub struct MatrixRecipient {
    pub user_id: String,
    pub device_id: String,
    pub call_id: String,
    pub conf_id: String,
    /// The session token the recipient sent us; echoed as
    /// `dest_session_id`.
    pub remote_session_id: String,
}

/// Semantic outbound messages, rendered to wire payloads by the worker.
#[derive(Debug)]
pub enum OutboundSignal {
    Answer {
        recipient: MatrixRecipient,
        sdp: String,
        streams: StreamMetadataMap,
    },
    Candidates {
        recipient: MatrixRecipient,
        candidates: Vec<CallCandidate>,
    },
    /// Encoded on the wire as an empty candidates list.
    CandidatesFinished { recipient: MatrixRecipient },
    Hangup {
        recipient: MatrixRecipient,
        reason: String,
    },
}

/// The transport the worker pushes rendered events through.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send_to_device(
        &self,
        user_id: &str,
        device_id: &str,
        event_type: &str,
        content: serde_json::Value,
    ) -> Result<(), SfuError>;
}

/// Cloneable handle used by conferences. Sends never block the conference
/// task; on a saturated queue the event is dropped with a loud warning.
#[derive(Clone)]
pub struct SignalingHandle {
    tx: mpsc::Sender<OutboundSignal>,
}

impl SignalingHandle {
    pub fn send_answer(
        &self,
        recipient: MatrixRecipient,
        sdp: String,
        streams: StreamMetadataMap,
    ) {
        self.enqueue(OutboundSignal::Answer {
            recipient,
            sdp,
            streams,
        });
    }

    pub fn send_candidates(&self, recipient: MatrixRecipient, candidates: Vec<CallCandidate>) {
        self.enqueue(OutboundSignal::Candidates {
            recipient,
            candidates,
        });
    }

    pub fn send_candidates_finished(&self, recipient: MatrixRecipient) {
        self.enqueue(OutboundSignal::CandidatesFinished { recipient });
    }

    pub fn send_hangup(&self, recipient: MatrixRecipient, reason: &str) {
        self.enqueue(OutboundSignal::Hangup {
            recipient,
            reason: reason.to_owned(),
        });
    }

    fn enqueue(&self, signal: OutboundSignal) {
        if self.tx.try_send(signal).is_err() {
            warn!(
                target: "sfu.signaling",
                "outbound signaling queue saturated, dropping event"
            );
        }
    }
}

/// The outbound worker task.
pub struct SignalingWorker {
    rx: mpsc::Receiver<OutboundSignal>,
    transport: Arc<dyn SignalingTransport>,
    /// Our `party_id` on the wire.
    device_id: String,
    /// Our session token, stamped as `sender_session_id`.
    session_id: String,
    cancel: CancellationToken,
}

impl SignalingWorker {
    /// Spawn the worker and return the conference-facing handle.
    pub fn spawn(
        transport: Arc<dyn SignalingTransport>,
        device_id: String,
        session_id: String,
        cancel: CancellationToken,
    ) -> (SignalingHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(SIGNALING_QUEUE_DEPTH);
        let worker = Self {
            rx,
            transport,
            device_id,
            session_id,
            cancel,
        };
        let task = tokio::spawn(worker.run());
        (SignalingHandle { tx }, task)
    }

    async fn run(mut self) {
        info!(target: "sfu.signaling", "signaling worker started");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,

                signal = self.rx.recv() => {
                    match signal {
                        Some(signal) => self.dispatch(signal).await,
                        None => break,
                    }
                }
            }
        }

        info!(target: "sfu.signaling", "signaling worker stopped");
    }

    async fn dispatch(&self, signal: OutboundSignal) {
        let (recipient, event_type, content) = match self.render(signal) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(target: "sfu.signaling", error = %e, "failed to render outbound event");
                return;
            }
        };

        debug!(
            target: "sfu.signaling",
            user_id = %recipient.user_id,
            device_id = %recipient.device_id,
            event_type,
            "sending signaling event"
        );

        if let Err(e) = self
            .transport
            .send_to_device(&recipient.user_id, &recipient.device_id, event_type, content)
            .await
        {
            warn!(
                target: "sfu.signaling",
                user_id = %recipient.user_id,
                event_type,
                error = %e,
                "failed to send signaling event"
            );
        }
    }

    fn render(
        &self,
        signal: OutboundSignal,
    ) -> Result<(MatrixRecipient, &'static str, serde_json::Value), serde_json::Error> {
        match signal {
            OutboundSignal::Answer {
                recipient,
                sdp,
                streams,
            } => {
                let content = AnswerContent {
                    call_id: recipient.call_id.clone(),
                    conf_id: recipient.conf_id.clone(),
                    party_id: self.device_id.clone(),
                    version: wire_version(),
                    answer: SessionDescription {
                        kind: SdpType::Answer,
                        sdp,
                    },
                    sdp_stream_metadata: streams,
                    sender_session_id: self.session_id.clone(),
                    dest_session_id: Some(recipient.remote_session_id.clone()),
                };
                Ok((recipient, CALL_ANSWER, serde_json::to_value(content)?))
            }

            OutboundSignal::Candidates {
                recipient,
                candidates,
            } => {
                let content = self.candidates_content(&recipient, candidates);
                Ok((recipient, CALL_CANDIDATES, serde_json::to_value(content)?))
            }

            OutboundSignal::CandidatesFinished { recipient } => {
                let content = self.candidates_content(&recipient, Vec::new());
                Ok((recipient, CALL_CANDIDATES, serde_json::to_value(content)?))
            }

            OutboundSignal::Hangup { recipient, reason } => {
                let content = HangupContent {
                    call_id: recipient.call_id.clone(),
                    conf_id: recipient.conf_id.clone(),
                    party_id: self.device_id.clone(),
                    version: wire_version(),
                    reason,
                };
                Ok((recipient, CALL_HANGUP, serde_json::to_value(content)?))
            }
        }
    }

    fn candidates_content(
        &self,
        recipient: &MatrixRecipient,
        candidates: Vec<CallCandidate>,
    ) -> CandidatesContent {
        CandidatesContent {
            call_id: recipient.call_id.clone(),
            conf_id: recipient.conf_id.clone(),
            party_id: self.device_id.clone(),
            version: wire_version(),
            candidates,
            sender_session_id: self.session_id.clone(),
            dest_session_id: Some(recipient.remote_session_id.clone()),
        }
    }
}
