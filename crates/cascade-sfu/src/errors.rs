//! SFU error types.
//!
//! The taxonomy separates fatal boot errors (the process exits), per-peer
//! transport errors (the offending participant is removed, the conference
//! continues), and per-message protocol errors (logged and discarded).

use thiserror::Error;

/// Service-level error type.
#[derive(Debug, Error)]
pub enum SfuError {
    /// Configuration could not be loaded or was invalid. Fatal at boot.
    #[error("configuration error: {0}")]
    Config(String),

    /// The signaling substrate failed (HTTP transport, sync stream).
    #[error("signaling error: {0}")]
    Signaling(String),

    /// A peer transport operation failed. Isolated to that participant.
    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    /// A subscription request could not be satisfied. Never fatal.
    #[error("subscription error: {0}")]
    Subscription(#[from] SubscribeError),

    /// An actor mailbox was closed or full when a message had to be
    /// delivered.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Errors surfaced by a peer adapter.
#[derive(Debug, Error)]
pub enum PeerError {
    /// The media transport rejected an SDP description.
    #[error("invalid session description: {0}")]
    InvalidSdp(String),

    /// A transport-level operation failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The control data channel is not open yet (or has closed).
    #[error("data channel unavailable")]
    DataChannelUnavailable,

    /// The adapter has shut down and refuses further commands.
    #[error("peer is closed")]
    Closed,
}

/// Errors from the track tracker's subscribe path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscribeError {
    /// The requested track is not (or no longer) published.
    #[error("track not found: {0}")]
    NotFound(String),

    /// The participant already subscribes to this track.
    #[error("already subscribed to track: {0}")]
    AlreadySubscribed(String),

    /// A participant asked to subscribe to its own track.
    #[error("cannot subscribe to own track: {0}")]
    OwnTrack(String),
}
