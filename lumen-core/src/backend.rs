//! Media Backend Interface
//!
//! The opaque playback engine the core drives. Implementations wrap a real
//! player; the core only issues transport commands and reacts to lifecycle
//! events delivered through [`BackendEvent`].

use thiserror::Error;

use crate::sync::MediaUrl;

/// Error codes a backend can report for a failed or aborted load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("unknown playback error")]
    Unknown,
    #[error("invalid or unresolvable URL")]
    InvalidUrl,
    #[error("access to the media source was denied")]
    AccessDenied,
    #[error("the player failed internally")]
    PlayerError,
    #[error("rate limited by the media host")]
    RateLimited,
}

/// A seekable or live playback engine.
///
/// Position and duration are in seconds. A live stream reports an infinite
/// or unknown duration and may ignore `seek`.
pub trait MediaBackend: Send {
    fn load(&mut self, url: &MediaUrl);
    fn play(&mut self);
    fn pause(&mut self);
    fn stop(&mut self);
    fn seek(&mut self, position: f64);
    fn position(&self) -> f64;
    fn duration(&self) -> f64;
    fn is_playing(&self) -> bool;
}

/// Lifecycle callbacks from the backend, injected into the engine on the
/// session's event loop.
///
/// `Started` fires on every transition into playing, including a resume
/// after `pause`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEvent {
    /// The loaded media is ready; duration is queryable.
    Ready,
    /// Playback began (or resumed).
    Started,
    /// Playback reached the end of the media.
    Ended,
    /// The load or playback failed.
    Error(MediaError),
}
