//! Peer construction.
//!
//! The conference only knows the [`PeerFactory`] trait; the WebRTC-backed
//! implementation builds a shared `API` once (media engine, interceptors,
//! setting engine) and stamps out configured peer connections from it.
//! Tests substitute a factory that hands back channel-backed handles.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::conference::messages::ConferenceMessage;
use crate::config::WebRtcConfig;
use crate::errors::{PeerError, SfuError};
use crate::stats::ForwardingStats;
use crate::types::ParticipantId;

use super::adapter::PeerAdapter;
use super::PeerHandle;

/// Creates a peer adapter for a joining participant.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create_peer(
        &self,
        participant: ParticipantId,
        conference_tx: mpsc::Sender<ConferenceMessage>,
        cancel: CancellationToken,
        stats: Arc<ForwardingStats>,
    ) -> Result<(PeerHandle, JoinHandle<()>), PeerError>;
}

/// The production factory over webrtc-rs.
pub struct WebRtcPeerFactory {
    api: API,
    rtc_config: RTCConfiguration,
}

impl WebRtcPeerFactory {
    /// Build the shared API from configuration.
    pub fn new(config: &WebRtcConfig) -> Result<Self, SfuError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| SfuError::Config(format!("media engine: {e}")))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| SfuError::Config(format!("interceptors: {e}")))?;

        let mut setting_engine = SettingEngine::default();
        if config.udp_port_min > 0 && config.udp_port_max > 0 {
            let ephemeral = EphemeralUDP::new(config.udp_port_min, config.udp_port_max)
                .map_err(|e| SfuError::Config(format!("invalid UDP port range: {e}")))?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }

        if config.dtls_cert_path.is_some() || config.dtls_key_path.is_some() {
            // The transport generates a per-process certificate; file-based
            // DTLS identities are accepted in configuration but not loaded
            // by this build.
            warn!(
                target: "sfu.peer",
                "dtls_cert_path/dtls_key_path configured but unsupported; using generated certificate"
            );
        }

        let ice_servers = config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        Ok(Self {
            api,
            rtc_config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        })
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create_peer(
        &self,
        participant: ParticipantId,
        conference_tx: mpsc::Sender<ConferenceMessage>,
        cancel: CancellationToken,
        stats: Arc<ForwardingStats>,
    ) -> Result<(PeerHandle, JoinHandle<()>), PeerError> {
        let pc = self
            .api
            .new_peer_connection(self.rtc_config.clone())
            .await
            .map_err(|e| PeerError::Transport(e.to_string()))?;

        Ok(PeerAdapter::spawn(
            participant,
            Arc::new(pc),
            conference_tx,
            cancel,
            stats,
        ))
    }
}
