//! Wire contracts for the Cascade SFU.
//!
//! This crate defines the two protocol surfaces the SFU speaks, as plain
//! serde types with no I/O:
//!
//! - [`control`] - the JSON control protocol exchanged with each peer over
//!   the WebRTC data channel (track subscriptions, renegotiation, keepalive,
//!   stream metadata updates).
//! - [`signaling`] - the Matrix to-device call event payloads used for call
//!   setup (invite/answer, ICE candidates, hangup).
//!
//! Both surfaces are versionless JSON discriminated by a `type` field;
//! unrecognized message types must be ignored by receivers so that newer
//! peers can talk to older ones.

#![warn(clippy::pedantic)]

pub mod control;
pub mod metadata;
pub mod signaling;
