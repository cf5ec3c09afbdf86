//! Player Session
//!
//! Wires a [`PlayerEngine`] onto one logical event loop per participant.
//! Session commands, transport events, backend callbacks, and the scheduler
//! tick are multiplexed onto a single task, so session state is never
//! mutated in parallel and a published snapshot always reflects a mutation
//! the publisher already committed to.

use std::sync::Once;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::backend::BackendEvent;
use crate::player::PlayerEngine;
use crate::sync::MediaUrl;
use crate::transport::TransportEvent;

/// Scheduler tick period driving delayed actions and reconciliation.
const TICK_PERIOD: Duration = Duration::from_millis(100);

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Commands accepted by a running session.
#[derive(Debug)]
pub enum SessionCommand {
    Play(MediaUrl),
    Stop,
    TogglePause,
    ToggleLock,
    ToggleRepeat,
    Seek(f64),
    SetQueuedTrack(Option<MediaUrl>),
    ForceResync,
    Shutdown,
}

/// Session-level failures.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session loop has shut down")]
    Closed,
}

/// Handle for issuing commands to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn play(&self, url: MediaUrl) -> Result<(), SessionError> {
        self.send(SessionCommand::Play(url))
    }

    pub fn stop(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Stop)
    }

    pub fn toggle_pause(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::TogglePause)
    }

    pub fn toggle_lock(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::ToggleLock)
    }

    pub fn toggle_repeat(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::ToggleRepeat)
    }

    pub fn seek(&self, position: f64) -> Result<(), SessionError> {
        self.send(SessionCommand::Seek(position))
    }

    pub fn set_queued_track(&self, url: Option<MediaUrl>) -> Result<(), SessionError> {
        self.send(SessionCommand::SetQueuedTrack(url))
    }

    pub fn force_resync(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::ForceResync)
    }

    pub fn shutdown(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Shutdown)
    }

    fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.command_tx
            .send(command)
            .map_err(|_| SessionError::Closed)
    }
}

/// Spawn the event loop for one participant. The engine's collaborators
/// feed their callbacks through the two event channels.
pub fn spawn(
    mut engine: PlayerEngine,
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    mut backend_events: mpsc::UnboundedReceiver<BackendEvent>,
) -> SessionHandle {
    init_tracing();

    let (command_tx, mut command_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        engine.start();
        let mut ticker = tokio::time::interval(TICK_PERIOD);

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => dispatch(&mut engine, command),
                },
                event = transport_events.recv() => match event {
                    Some(event) => engine.handle_transport_event(event),
                    None => break,
                },
                event = backend_events.recv() => match event {
                    Some(event) => engine.handle_backend_event(event),
                    None => break,
                },
                _ = ticker.tick() => engine.tick(),
            }
        }

        info!("session loop ended");
    });

    SessionHandle { command_tx }
}

fn dispatch(engine: &mut PlayerEngine, command: SessionCommand) {
    debug!(?command, "session command");
    match command {
        SessionCommand::Play(url) => {
            engine.play(url);
        }
        SessionCommand::Stop => {
            engine.stop();
        }
        SessionCommand::TogglePause => {
            engine.toggle_pause();
        }
        SessionCommand::ToggleLock => {
            engine.toggle_lock();
        }
        SessionCommand::ToggleRepeat => {
            engine.toggle_repeat();
        }
        SessionCommand::Seek(position) => {
            engine.seek(position);
        }
        SessionCommand::SetQueuedTrack(url) => {
            engine.set_queued_track(url);
        }
        SessionCommand::ForceResync => engine.force_resync(),
        // Handled by the loop itself
        SessionCommand::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::LocalActor;
    use crate::backend::MediaBackend;
    use crate::clock::{NetworkClock, SystemClock};
    use crate::config::PlayerConfig;
    use crate::presentation::PresentationSink;
    use crate::sync::PlaybackState;
    use crate::transport::{SnapshotHub, SnapshotTransport};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct RecordingBackend {
        loads: Arc<Mutex<Vec<String>>>,
    }

    impl MediaBackend for RecordingBackend {
        fn load(&mut self, url: &MediaUrl) {
            self.loads.lock().push(url.as_str().to_string());
        }

        fn play(&mut self) {}
        fn pause(&mut self) {}
        fn stop(&mut self) {}
        fn seek(&mut self, _position: f64) {}

        fn position(&self) -> f64 {
            0.0
        }

        fn duration(&self) -> f64 {
            300.0
        }

        fn is_playing(&self) -> bool {
            false
        }
    }

    #[derive(Clone, Default)]
    struct StateRecorder(Arc<Mutex<Vec<PlaybackState>>>);

    impl PresentationSink for StateRecorder {
        fn state_changed(&self, state: PlaybackState) {
            self.0.lock().push(state);
        }
    }

    fn engine(
        backend: RecordingBackend,
        transport: Box<dyn SnapshotTransport>,
    ) -> PlayerEngine {
        PlayerEngine::new(
            PlayerConfig::default(),
            LocalActor::default(),
            Box::new(backend),
            transport,
            Arc::new(SystemClock) as Arc<dyn NetworkClock>,
        )
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached within timeout");
    }

    #[tokio::test]
    async fn test_remote_follows_owner_over_the_hub() {
        let hub = SnapshotHub::new();
        let (owner_transport, owner_events) = hub.join();
        let (remote_transport, remote_events) = hub.join();

        let owner_backend = RecordingBackend::default();
        let remote_backend = RecordingBackend::default();
        let remote_states = StateRecorder::default();

        let owner_engine = engine(owner_backend.clone(), Box::new(owner_transport));
        let mut remote_engine = engine(remote_backend.clone(), Box::new(remote_transport));
        remote_engine.add_sink(Box::new(remote_states.clone()));

        let (owner_backend_tx, owner_backend_rx) = mpsc::unbounded_channel();
        let (remote_backend_tx, remote_backend_rx) = mpsc::unbounded_channel();

        let owner = spawn(owner_engine, owner_events, owner_backend_rx);
        let remote = spawn(remote_engine, remote_events, remote_backend_rx);

        owner
            .play(MediaUrl::new("https://example.com/movie.mp4"))
            .unwrap();
        owner_backend_tx.send(BackendEvent::Ready).unwrap();
        owner_backend_tx.send(BackendEvent::Started).unwrap();

        // The published snapshot reaches the remote and starts its load
        wait_for(|| !remote_backend.loads.lock().is_empty()).await;

        // Remote's backend comes up under an already-playing owner, so it
        // goes straight to playing
        remote_backend_tx.send(BackendEvent::Ready).unwrap();
        remote_backend_tx.send(BackendEvent::Started).unwrap();
        wait_for(|| remote_states.0.lock().contains(&PlaybackState::Playing)).await;

        owner.shutdown().unwrap();
        remote.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_remote_play_takes_authority_and_old_owner_follows() {
        let hub = SnapshotHub::new();
        let (owner_transport, owner_events) = hub.join();
        let (remote_transport, remote_events) = hub.join();

        let owner_backend = RecordingBackend::default();
        let remote_backend = RecordingBackend::default();

        let owner_engine = engine(owner_backend.clone(), Box::new(owner_transport));
        let remote_engine = engine(remote_backend.clone(), Box::new(remote_transport));

        let (_owner_backend_tx, owner_backend_rx) = mpsc::unbounded_channel();
        let (_remote_backend_tx, remote_backend_rx) = mpsc::unbounded_channel();

        let owner = spawn(owner_engine, owner_events, owner_backend_rx);
        let remote = spawn(remote_engine, remote_events, remote_backend_rx);

        remote
            .play(MediaUrl::new("https://example.com/other.mp4"))
            .unwrap();

        // Authority transfers to the remote; its snapshot then drives the
        // previous owner into loading the new track
        wait_for(|| !remote_backend.loads.lock().is_empty()).await;
        wait_for(|| !owner_backend.loads.lock().is_empty()).await;

        owner.shutdown().unwrap();
        remote.shutdown().unwrap();
    }
}
