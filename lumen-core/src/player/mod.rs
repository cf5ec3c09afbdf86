//! Playback Engine
//!
//! The playback state machine and its delayed-action scheduler.

mod engine;
mod pending;

pub use engine::{CommandOutcome, PlayerEngine};
