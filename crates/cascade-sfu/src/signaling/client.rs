//! Minimal Matrix client-server shim.
//!
//! The SFU only needs two verbs from the homeserver: long-polling `/sync`
//! for to-device call events, and `sendToDevice` for outbound signaling.
//! Everything else about the signaling substrate stays outside this
//! process.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MatrixConfig;
use crate::errors::SfuError;

use super::SignalingTransport;

/// Long-poll window requested from the homeserver.
const SYNC_TIMEOUT_MS: u64 = 30_000;

/// Backoff between failed sync attempts.
const SYNC_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A raw inbound to-device event, before call-event parsing.
#[derive(Debug, Clone)]
pub struct InboundSignal {
    pub event_type: String,
    pub sender: String,
    pub content: serde_json::Value,
}

pub struct MatrixClient {
    http: reqwest::Client,
    homeserver_url: String,
    access_token: String,
}

impl MatrixClient {
    pub fn new(config: &MatrixConfig) -> Result<Self, SfuError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(SYNC_TIMEOUT_MS + 10_000))
            .build()
            .map_err(|e| SfuError::Signaling(e.to_string()))?;

        Ok(Self {
            http,
            homeserver_url: config.homeserver_url.trim_end_matches('/').to_owned(),
            access_token: config.access_token.clone(),
        })
    }

    /// Long-poll `/sync` and feed to-device events into `inbound` until
    /// cancelled. Transient failures back off and retry; the stream itself
    /// never gives up.
    pub async fn run_sync(
        &self,
        inbound: mpsc::Sender<InboundSignal>,
        cancel: CancellationToken,
    ) -> Result<(), SfuError> {
        info!(target: "sfu.signaling", homeserver = %self.homeserver_url, "matrix sync started");

        let mut since: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let response = tokio::select! {
                () = cancel.cancelled() => break,
                response = self.sync_once(since.as_deref()) => response,
            };

            let body = match response {
                Ok(body) => body,
                Err(e) => {
                    warn!(target: "sfu.signaling", error = %e, "sync failed, retrying");
                    tokio::time::sleep(SYNC_RETRY_DELAY).await;
                    continue;
                }
            };

            if let Some(next_batch) = body.get("next_batch").and_then(|v| v.as_str()) {
                since = Some(next_batch.to_owned());
            }

            let events = body
                .pointer("/to_device/events")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();

            for event in events {
                let Some(event_type) = event.get("type").and_then(|v| v.as_str()) else {
                    continue;
                };
                let sender = event
                    .get("sender")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let content = event.get("content").cloned().unwrap_or_default();

                let signal = InboundSignal {
                    event_type: event_type.to_owned(),
                    sender: sender.to_owned(),
                    content,
                };

                // Signaling order matters; block here rather than drop.
                if inbound.send(signal).await.is_err() {
                    info!(target: "sfu.signaling", "router gone, stopping sync");
                    return Ok(());
                }
            }
        }

        info!(target: "sfu.signaling", "matrix sync stopped");
        Ok(())
    }

    async fn sync_once(&self, since: Option<&str>) -> Result<serde_json::Value, SfuError> {
        let url = format!("{}/_matrix/client/v3/sync", self.homeserver_url);

        let mut query: Vec<(&str, String)> = vec![
            ("timeout", SYNC_TIMEOUT_MS.to_string()),
            ("set_presence", "offline".to_owned()),
        ];
        if let Some(since) = since {
            query.push(("since", since.to_owned()));
        }

        let response = self
            .http
            .get(url)
            .query(&query)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| SfuError::Signaling(e.to_string()))?
            .error_for_status()
            .map_err(|e| SfuError::Signaling(e.to_string()))?;

        response
            .json()
            .await
            .map_err(|e| SfuError::Signaling(e.to_string()))
    }
}

#[async_trait]
impl SignalingTransport for MatrixClient {
    async fn send_to_device(
        &self,
        user_id: &str,
        device_id: &str,
        event_type: &str,
        content: serde_json::Value,
    ) -> Result<(), SfuError> {
        let txn_id = uuid::Uuid::new_v4();
        let url = format!(
            "{}/_matrix/client/v3/sendToDevice/{}/{}",
            self.homeserver_url, event_type, txn_id
        );

        let body = serde_json::json!({
            "messages": {
                user_id: { device_id: content }
            }
        });

        debug!(
            target: "sfu.signaling",
            user_id,
            device_id,
            event_type,
            "sendToDevice"
        );

        self.http
            .put(url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| SfuError::Signaling(e.to_string()))?
            .error_for_status()
            .map_err(|e| SfuError::Signaling(e.to_string()))?;

        Ok(())
    }
}
