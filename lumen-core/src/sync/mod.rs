//! Sync State
//!
//! Replicated snapshot types and the local playback state they drive.

mod protocol;
mod state;

pub use protocol::*;
pub use state::*;
