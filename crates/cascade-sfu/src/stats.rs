//! Drop and forwarding counters.
//!
//! Packet-level overflow is silent apart from these counters; control-level
//! overflow logs loudly at the recording site. One instance is shared per
//! conference.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for a single conference's forwarding plane.
#[derive(Debug, Default)]
pub struct ForwardingStats {
    /// RTP packets dropped because the conference queue was full.
    ingest_dropped: AtomicU64,
    /// RTP packets dropped because a subscriber's egress queue was full.
    egress_dropped: AtomicU64,
    /// Control messages dropped because a mailbox was full.
    control_dropped: AtomicU64,
    /// Upstream key frame requests actually forwarded to publishers.
    keyframe_requests: AtomicU64,
}

impl ForwardingStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ingest_drop(&self) {
        self.ingest_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_egress_drop(&self) {
        self.egress_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_control_drop(&self) {
        self.control_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_keyframe_request(&self) {
        self.keyframe_requests.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn ingest_dropped(&self) -> u64 {
        self.ingest_dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn egress_dropped(&self) -> u64 {
        self.egress_dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn control_dropped(&self) -> u64 {
        self.control_dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn keyframe_requests(&self) -> u64 {
        self.keyframe_requests.load(Ordering::Relaxed)
    }
}
