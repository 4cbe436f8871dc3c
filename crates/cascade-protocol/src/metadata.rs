//! SDP stream metadata carried on signaling and data-channel messages.
//!
//! Every publishing peer announces the streams it sources as a map of
//! stream id to [`StreamMetadata`]; each stream lists its tracks with the
//! maximum resolution the publisher produces for them. The SFU merges the
//! per-peer maps and hands every participant a view of all streams except
//! their own.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-peer stream announcement: stream id to metadata.
pub type StreamMetadataMap = HashMap<String, StreamMetadata>;

/// What a single media stream is for and which tracks it carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Stream purpose, e.g. `m.usermedia` or `m.screenshare`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub purpose: String,
    /// Per-track resolution hints, keyed by track id.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tracks: HashMap<String, TrackMetadataEntry>,
}

/// Maximum resolution a publisher produces for one track.
///
/// Only meaningful for video; audio tracks carry zeros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetadataEntry {
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

/// Flatten a stream metadata map into per-track resolution entries.
///
/// The conference keys its published-track catalog by track id, so the
/// stream level is collapsed here.
#[must_use]
pub fn track_entries(streams: &StreamMetadataMap) -> HashMap<String, TrackMetadataEntry> {
    streams
        .values()
        .flat_map(|stream| stream.tracks.iter())
        .map(|(track_id, entry)| (track_id.clone(), *entry))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_track_entries_flattens_streams() {
        let json = serde_json::json!({
            "stream-a": {
                "purpose": "m.usermedia",
                "tracks": {
                    "v1": { "width": 1920, "height": 1080 },
                    "a1": {}
                }
            },
            "stream-b": {
                "purpose": "m.screenshare",
                "tracks": {
                    "s1": { "width": 2560, "height": 1440 }
                }
            }
        });

        let streams: StreamMetadataMap = serde_json::from_value(json).unwrap();
        let entries = track_entries(&streams);

        assert_eq!(entries.len(), 3);
        assert_eq!(entries["v1"].width, 1920);
        assert_eq!(entries["a1"], TrackMetadataEntry::default());
        assert_eq!(entries["s1"].height, 1440);
    }

    #[test]
    fn test_missing_resolution_defaults_to_zero() {
        let entry: TrackMetadataEntry = serde_json::from_str("{}").unwrap();
        assert_eq!(entry.width, 0);
        assert_eq!(entry.height, 0);
    }

    #[test]
    fn test_empty_fields_omitted_on_serialize() {
        let meta = StreamMetadata::default();
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json, serde_json::json!({}));
    }
}
