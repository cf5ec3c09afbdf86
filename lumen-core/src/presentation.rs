//! Presentation Interface
//!
//! One-way notifications toward screen and audio collaborators. The core
//! emits; it never queries these back.

use crate::backend::MediaError;
use crate::sync::PlaybackState;

/// What the visual surface should currently show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenMode {
    Normal,
    Logo,
    Loading,
    Error,
}

/// Observer of playback presentation. All methods default to no-ops so a
/// sink implements only what it renders.
pub trait PresentationSink: Send {
    fn screen_mode(&self, _mode: ScreenMode) {}
    fn video_error(&self, _error: MediaError) {}
    fn video_start(&self) {}
    fn video_stop(&self) {}
    fn state_changed(&self, _state: PlaybackState) {}
}
