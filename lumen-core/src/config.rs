//! Player Configuration

use crate::sync::MediaUrl;

/// Default delay before an errored track is reloaded, in seconds.
const DEFAULT_RETRY_DELAY: f64 = 6.0;

/// Default owner heartbeat / remote reconciliation cadence, in seconds.
const DEFAULT_SYNC_INTERVAL: f64 = 5.0;

/// Default position drift tolerated before a corrective seek, in seconds.
/// Wide enough to avoid seek-thrashing under network-time jitter, tight
/// enough to still feel synchronized.
const DEFAULT_DRIFT_THRESHOLD: f64 = 1.0;

/// Tunables injected at engine construction.
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// Optional track the initial owner starts playing at session start.
    pub default_track: Option<MediaUrl>,
    /// Whether transport commands start locked to privileged actors.
    pub default_locked: bool,
    /// Whether the current track repeats when it finishes.
    pub repeat_playlist: bool,
    /// Whether a failed load is retried automatically.
    pub retry_on_error: bool,
    /// Seconds to wait before reloading after a backend error.
    pub retry_delay: f64,
    /// Seconds between owner heartbeats and reconciliation passes.
    pub sync_interval: f64,
    /// Maximum position drift tolerated before a corrective seek.
    pub drift_threshold: f64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            default_track: None,
            default_locked: false,
            repeat_playlist: false,
            retry_on_error: true,
            retry_delay: DEFAULT_RETRY_DELAY,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            drift_threshold: DEFAULT_DRIFT_THRESHOLD,
        }
    }
}
