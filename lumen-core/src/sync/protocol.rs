//! Replicated Sync Protocol
//!
//! The compact authoritative record an owner publishes to every other
//! participant: track identity, play/pause intent, and the time anchor
//! remotes reconcile their position against.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Generation step applied when the owner starts a new load.
pub const GENERATION_STEP_OWNER: u32 = 1;
/// Generation step applied when a non-owner requested the load, so that
/// near-simultaneous owner and remote requests never land on equal values.
pub const GENERATION_STEP_REMOTE: u32 = 2;

/// An opaque media URL.
///
/// The core never fetches the URL itself; it only validates that a track
/// reference is non-empty before handing it to the media backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaUrl(String);

impl MediaUrl {
    pub fn new(url: impl Into<String>) -> Self {
        MediaUrl(url.into())
    }

    /// An empty reference, used when a session has no current track.
    pub fn empty() -> Self {
        MediaUrl(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A reference is playable only if it has visible content.
    pub fn is_valid(&self) -> bool {
        !self.0.trim().is_empty()
    }

    /// Extract a start time from YouTube-style links carrying `t=` or
    /// `start=` query parameters. Returns 0 for everything else.
    pub fn start_time(&self) -> f64 {
        if !self.0.contains("youtube.com/watch") && !self.0.contains("youtu.be/") {
            return 0.0;
        }

        for key in ["?t=", "&t=", "?start=", "&start="] {
            if let Some(idx) = self.0.find(key) {
                let digits: String = self.0[idx + key.len()..]
                    .chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect();
                return digits.parse::<u32>().map(f64::from).unwrap_or(0.0);
            }
        }

        0.0
    }
}

impl fmt::Display for MediaUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A track reference: the URL plus a monotonically increasing load
/// generation. Participants reload only when an incoming generation differs
/// from the one they last loaded, which deduplicates redelivered snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackRef {
    pub url: MediaUrl,
    pub generation: u32,
}

impl TrackRef {
    pub fn new(url: MediaUrl, generation: u32) -> Self {
        Self { url, generation }
    }
}

/// The replicated authoritative state. Only the participant holding
/// authority may publish it; everyone else treats it as read-only truth.
///
/// `start_anchor` is recomputed whenever playback starts, pauses, or seeks
/// so that `network_now - start_anchor` always equals the position playback
/// should currently be at. `None` means the owner has not started playing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub track: TrackRef,
    pub owner_playing: bool,
    pub owner_paused: bool,
    pub start_anchor: Option<f64>,
    pub locked: bool,
    pub repeat_playlist: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_validity() {
        assert!(MediaUrl::new("https://example.com/video.mp4").is_valid());
        assert!(!MediaUrl::empty().is_valid());
        assert!(!MediaUrl::new("   ").is_valid());
    }

    #[test]
    fn test_start_time_parsing() {
        let url = MediaUrl::new("https://www.youtube.com/watch?v=abc&t=90");
        assert_eq!(url.start_time(), 90.0);

        let url = MediaUrl::new("https://youtu.be/abc?start=125");
        assert_eq!(url.start_time(), 125.0);

        // Non-YouTube URLs never carry a parsed start time
        let url = MediaUrl::new("https://example.com/video.mp4?t=90");
        assert_eq!(url.start_time(), 0.0);

        // Missing or non-numeric values fall back to zero
        let url = MediaUrl::new("https://www.youtube.com/watch?v=abc&t=");
        assert_eq!(url.start_time(), 0.0);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let snapshot = SyncSnapshot {
            track: TrackRef::new(MediaUrl::new("https://example.com/a.mp4"), 7),
            owner_playing: true,
            owner_paused: false,
            start_anchor: Some(1234.5),
            locked: true,
            repeat_playlist: false,
        };

        let bytes = serde_json::to_vec(&snapshot).unwrap();
        let decoded: SyncSnapshot = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn test_unset_anchor_roundtrip() {
        let snapshot = SyncSnapshot::default();
        let bytes = serde_json::to_vec(&snapshot).unwrap();
        let decoded: SyncSnapshot = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.start_anchor, None);
    }
}
