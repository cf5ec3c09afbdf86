//! Snapshot Replication Channel
//!
//! The opaque transport that carries the authoritative snapshot to every
//! participant and arbitrates who holds write authority. Delivery is
//! at-least-once and tolerant of reordering; the latest snapshot wins by
//! generation and anchor freshness, not by sequence number.

mod hub;

pub use hub::{HubTransport, ParticipantId, SnapshotHub};

use thiserror::Error;

use crate::sync::SyncSnapshot;

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("participant does not hold authority")]
    NotAuthoritative,

    #[error("snapshot encoding failed: {0}")]
    Encoding(String),

    #[error("transport channel closed")]
    ChannelClosed,
}

/// Inbound events from the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An authoritative snapshot arrived.
    Snapshot(SyncSnapshot),
    /// Outcome of a previously issued authority request.
    Authority { granted: bool },
}

/// A participant's handle onto the replication channel.
///
/// Authority is a capability, not replicated data: `is_owner` reflects the
/// transport's current notion of who may publish, and `request_authority`
/// asks for a transfer whose outcome arrives asynchronously as
/// [`TransportEvent::Authority`]. A transport serializes racing requests so
/// exactly one writer wins.
pub trait SnapshotTransport: Send {
    /// Replicate a snapshot to all other participants. Fails when the
    /// caller does not currently hold authority.
    fn publish(&self, snapshot: &SyncSnapshot) -> Result<(), TransportError>;

    /// Ask to become the authoritative writer.
    fn request_authority(&self);

    /// Whether this participant currently holds authority.
    fn is_owner(&self) -> bool;
}
