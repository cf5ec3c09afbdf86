//! In-Process Snapshot Hub
//!
//! Reference implementation of the replication channel for tests, local
//! simulation, and embedders that run every participant in one process.
//! Snapshots cross the hub as serialized bytes so the wire boundary stays
//! honest, and authority requests are serialized by the hub lock so racing
//! writers resolve to exactly one owner.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{SnapshotTransport, TransportError, TransportEvent};
use crate::sync::SyncSnapshot;

/// Characters used in participant ids (unambiguous, uppercase).
const ID_ALPHABET: &[u8] = b"346789ABCDEFGHJKMNPQRTUVWXY";

/// Participant id length.
const ID_LENGTH: usize = 8;

/// Opaque identity of a participant on the hub.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParticipantId(String);

impl ParticipantId {
    fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        let mut id = String::with_capacity(ID_LENGTH);
        for _ in 0..ID_LENGTH {
            let idx = rng.gen_range(0..ID_ALPHABET.len());
            id.push(ID_ALPHABET[idx] as char);
        }
        ParticipantId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct HubInner {
    owner: Option<ParticipantId>,
    /// Last published snapshot, replayed to late joiners.
    latest: Option<Vec<u8>>,
    peers: HashMap<ParticipantId, mpsc::UnboundedSender<TransportEvent>>,
}

/// The shared hub all participants join.
#[derive(Clone)]
pub struct SnapshotHub {
    inner: Arc<Mutex<HubInner>>,
}

impl SnapshotHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                owner: None,
                latest: None,
                peers: HashMap::new(),
            })),
        }
    }

    /// Register a participant. The first joiner becomes the initial owner;
    /// later joiners get the latest snapshot replayed so they converge
    /// without waiting for the next heartbeat.
    pub fn join(&self) -> (HubTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let id = ParticipantId::random();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut inner = self.inner.lock();
        if inner.owner.is_none() {
            debug!(participant = %id, "first joiner takes initial authority");
            inner.owner = Some(id.clone());
        } else if let Some(bytes) = &inner.latest {
            match serde_json::from_slice::<SyncSnapshot>(bytes) {
                Ok(snapshot) => {
                    let _ = tx.send(TransportEvent::Snapshot(snapshot));
                }
                Err(e) => warn!(error = %e, "stored snapshot failed to decode"),
            }
        }
        inner.peers.insert(id.clone(), tx);

        let transport = HubTransport {
            id,
            inner: Arc::clone(&self.inner),
        };
        (transport, rx)
    }
}

impl Default for SnapshotHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A single participant's handle onto a [`SnapshotHub`].
pub struct HubTransport {
    id: ParticipantId,
    inner: Arc<Mutex<HubInner>>,
}

impl HubTransport {
    pub fn participant_id(&self) -> &ParticipantId {
        &self.id
    }
}

impl SnapshotTransport for HubTransport {
    fn publish(&self, snapshot: &SyncSnapshot) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if inner.owner.as_ref() != Some(&self.id) {
            return Err(TransportError::NotAuthoritative);
        }

        let bytes =
            serde_json::to_vec(snapshot).map_err(|e| TransportError::Encoding(e.to_string()))?;
        inner.latest = Some(bytes.clone());

        for (peer, tx) in &inner.peers {
            if *peer == self.id {
                continue;
            }
            match serde_json::from_slice::<SyncSnapshot>(&bytes) {
                Ok(decoded) => {
                    let _ = tx.send(TransportEvent::Snapshot(decoded));
                }
                Err(e) => warn!(error = %e, "snapshot failed to decode for delivery"),
            }
        }
        Ok(())
    }

    fn request_authority(&self) {
        let mut inner = self.inner.lock();
        debug!(participant = %self.id, "authority transfer requested");
        inner.owner = Some(self.id.clone());
        if let Some(tx) = inner.peers.get(&self.id) {
            let _ = tx.send(TransportEvent::Authority { granted: true });
        }
    }

    fn is_owner(&self) -> bool {
        self.inner.lock().owner.as_ref() == Some(&self.id)
    }
}

impl Drop for HubTransport {
    fn drop(&mut self) {
        self.inner.lock().peers.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{MediaUrl, TrackRef};

    fn snapshot(generation: u32) -> SyncSnapshot {
        SyncSnapshot {
            track: TrackRef::new(MediaUrl::new("https://example.com/a.mp4"), generation),
            owner_playing: true,
            ..SyncSnapshot::default()
        }
    }

    #[tokio::test]
    async fn test_first_joiner_holds_authority() {
        let hub = SnapshotHub::new();
        let (first, _rx1) = hub.join();
        let (second, _rx2) = hub.join();

        assert!(first.is_owner());
        assert!(!second.is_owner());
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_other_participants() {
        let hub = SnapshotHub::new();
        let (owner, mut owner_rx) = hub.join();
        let (_remote, mut remote_rx) = hub.join();

        owner.publish(&snapshot(3)).unwrap();

        let event = remote_rx.recv().await.unwrap();
        match event {
            TransportEvent::Snapshot(s) => assert_eq!(s.track.generation, 3),
            other => panic!("unexpected event: {:?}", other),
        }
        // The publisher never hears its own snapshot back
        assert!(owner_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_non_owner_publish_is_rejected() {
        let hub = SnapshotHub::new();
        let (_owner, _rx1) = hub.join();
        let (remote, _rx2) = hub.join();

        let err = remote.publish(&snapshot(1)).unwrap_err();
        assert!(matches!(err, TransportError::NotAuthoritative));
    }

    #[tokio::test]
    async fn test_authority_transfer() {
        let hub = SnapshotHub::new();
        let (first, _rx1) = hub.join();
        let (second, mut rx2) = hub.join();

        second.request_authority();

        let event = rx2.recv().await.unwrap();
        assert!(matches!(event, TransportEvent::Authority { granted: true }));
        assert!(second.is_owner());
        assert!(!first.is_owner());
        assert!(second.publish(&snapshot(2)).is_ok());
    }

    #[tokio::test]
    async fn test_late_joiner_receives_latest_snapshot() {
        let hub = SnapshotHub::new();
        let (owner, _rx1) = hub.join();
        owner.publish(&snapshot(5)).unwrap();

        let (_late, mut late_rx) = hub.join();
        let event = late_rx.recv().await.unwrap();
        match event {
            TransportEvent::Snapshot(s) => assert_eq!(s.track.generation, 5),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
