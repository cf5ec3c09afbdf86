//! Playback Engine
//!
//! The authority-based playback state machine. One participant (the owner)
//! drives canonical playback and publishes the authoritative snapshot;
//! every other participant follows the snapshot, reconciling its own
//! backend against the owner's time anchor. All methods run on a single
//! logical event loop per participant: commands, backend callbacks,
//! transport events, and the scheduler tick never interleave.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::access::{AccessControl, LocalActor};
use crate::backend::{BackendEvent, MediaBackend, MediaError};
use crate::clock::NetworkClock;
use crate::config::PlayerConfig;
use crate::presentation::{PresentationSink, ScreenMode};
use crate::sync::{
    MediaUrl, PlaybackState, SyncSnapshot, GENERATION_STEP_OWNER, GENERATION_STEP_REMOTE,
};
use crate::transport::{SnapshotTransport, TransportEvent};

use super::pending::DelayedAction;

/// Window after a start during which an end event on a non-seekable source
/// is treated as a spurious completion report from the stream.
const SPURIOUS_END_WINDOW: f64 = 1.0;

/// Slack kept from the end of a track: corrective seeks are skipped once
/// playback is this close to the end, and a track switch no longer stops
/// the outgoing source inside it.
const END_SLACK: f64 = 2.0;

/// A seek landing within this margin of the duration promotes to the
/// queued track, the repeat loop, or clamps short of the end.
const SEEK_END_MARGIN: f64 = 1.0;

/// Non-error outcome of pushing a command through the gate. Rejections are
/// deliberate no-ops, not faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The command mutated state (and published, where applicable).
    Applied,
    /// The command is parked until the transport confirms authority.
    Deferred,
    /// The session is locked and the actor is not privileged.
    RejectedLocked,
    /// The track reference was empty or malformed.
    RejectedInvalid,
    /// The command does not apply in the current playback state.
    RejectedState,
}

/// Why the engine is holding back instead of driving playback.
#[derive(Debug)]
enum WaitState {
    Idle,
    /// Remote: backend is ready but the owner has not started playing yet.
    OwnerStart,
    /// A command is parked until the transport answers an authority
    /// transfer request.
    Authority(PendingCommand),
}

/// A gated command captured at issue time. `generation_step` records
/// whether the issuer held authority when the command was accepted, so a
/// load started after an authority transfer still advances the generation
/// by the non-owner step.
#[derive(Debug, Clone)]
enum PendingCommand {
    Play { url: MediaUrl, generation_step: u32 },
    Stop,
    PauseToggle,
    LockToggle,
    RepeatToggle,
    Seek { position: f64 },
    SetQueued { url: Option<MediaUrl> },
}

/// The synchronized player for one participant.
pub struct PlayerEngine {
    config: PlayerConfig,
    actor: LocalActor,
    backend: Box<dyn MediaBackend>,
    transport: Box<dyn SnapshotTransport>,
    clock: Arc<dyn NetworkClock>,
    access: Option<Box<dyn AccessControl>>,
    sinks: Vec<Box<dyn PresentationSink>>,

    /// Local copy of the replicated state. On the owner this is the
    /// publication source; on a remote it mirrors the last snapshot.
    sync: SyncSnapshot,
    /// Generation of the track this participant last started loading.
    loaded_generation: u32,
    /// Next track consumed when the current one ends, local to the
    /// participant that set it.
    queued_url: Option<MediaUrl>,

    state: PlaybackState,
    last_error: Option<MediaError>,
    wait: WaitState,

    seekable: bool,
    track_duration: f64,
    track_position: f64,
    /// Position a fresh or resynced load starts playing from.
    target_position: f64,
    current_url: MediaUrl,
    last_url: MediaUrl,

    pending_load: DelayedAction,
    pending_play: DelayedAction,
    pending_play_url: Option<MediaUrl>,
    play_started_at: f64,
    last_sync_at: f64,
}

impl PlayerEngine {
    pub fn new(
        config: PlayerConfig,
        actor: LocalActor,
        backend: Box<dyn MediaBackend>,
        transport: Box<dyn SnapshotTransport>,
        clock: Arc<dyn NetworkClock>,
    ) -> Self {
        Self {
            config,
            actor,
            backend,
            transport,
            clock,
            access: None,
            sinks: Vec::new(),
            sync: SyncSnapshot::default(),
            loaded_generation: 0,
            queued_url: None,
            state: PlaybackState::Stopped,
            last_error: None,
            wait: WaitState::Idle,
            seekable: false,
            track_duration: 0.0,
            track_position: 0.0,
            target_position: 0.0,
            current_url: MediaUrl::empty(),
            last_url: MediaUrl::empty(),
            pending_load: DelayedAction::default(),
            pending_play: DelayedAction::default(),
            pending_play_url: None,
            play_started_at: 0.0,
            last_sync_at: 0.0,
        }
    }

    /// Wire in the external access-control collaborator.
    pub fn with_access_control(mut self, access: Box<dyn AccessControl>) -> Self {
        self.access = Some(access);
        self
    }

    /// Register a presentation observer.
    pub fn add_sink(&mut self, sink: Box<dyn PresentationSink>) {
        self.sinks.push(sink);
    }

    /// Session start. The initial owner publishes its configured lock and
    /// repeat flags and autoplays the default track if one is set.
    pub fn start(&mut self) {
        self.backend.stop();
        self.set_state(PlaybackState::Stopped);
        self.screen_mode(ScreenMode::Logo);

        if self.transport.is_owner() {
            self.sync.locked = self.config.default_locked;
            self.sync.repeat_playlist = self.config.repeat_playlist;
            self.publish();

            // The configured default is session policy, not an actor
            // command, so it skips the lock gate.
            if let Some(url) = self.config.default_track.clone() {
                self.start_play(url, GENERATION_STEP_OWNER);
            }
        }
    }

    // === Commands ===

    /// Start playing a new track. Clears any queued track.
    pub fn play(&mut self, url: MediaUrl) -> CommandOutcome {
        if !url.is_valid() {
            debug!(url = %url, "rejecting play: invalid track reference");
            return CommandOutcome::RejectedInvalid;
        }
        if !self.can_act() {
            debug!("rejecting play: session locked");
            return CommandOutcome::RejectedLocked;
        }

        self.queued_url = None;
        let generation_step = self.local_generation_step();
        self.route(PendingCommand::Play {
            url,
            generation_step,
        })
    }

    /// Halt playback and clear the current track.
    pub fn stop(&mut self) -> CommandOutcome {
        if !self.can_act() {
            debug!("rejecting stop: session locked");
            return CommandOutcome::RejectedLocked;
        }
        self.route(PendingCommand::Stop)
    }

    /// Toggle between playing and paused. Only meaningful on a seekable
    /// source that is currently active.
    pub fn toggle_pause(&mut self) -> CommandOutcome {
        if !self.can_act() {
            debug!("rejecting pause toggle: session locked");
            return CommandOutcome::RejectedLocked;
        }
        if !self.seekable || !self.state.is_active() {
            return CommandOutcome::RejectedState;
        }
        self.route(PendingCommand::PauseToggle)
    }

    /// Toggle the session lock. Requires full privilege regardless of the
    /// current lock state.
    pub fn toggle_lock(&mut self) -> CommandOutcome {
        if !self.is_admin() {
            debug!("rejecting lock toggle: not privileged");
            return CommandOutcome::RejectedLocked;
        }
        self.route(PendingCommand::LockToggle)
    }

    /// Toggle repeat-playlist mode.
    pub fn toggle_repeat(&mut self) -> CommandOutcome {
        if !self.can_act() {
            debug!("rejecting repeat toggle: session locked");
            return CommandOutcome::RejectedLocked;
        }
        self.route(PendingCommand::RepeatToggle)
    }

    /// Seek to an absolute position on the current track.
    pub fn seek(&mut self, position: f64) -> CommandOutcome {
        if !self.can_act() {
            debug!("rejecting seek: session locked");
            return CommandOutcome::RejectedLocked;
        }
        if !self.seekable || !self.state.is_active() {
            return CommandOutcome::RejectedState;
        }
        self.route(PendingCommand::Seek { position })
    }

    /// Set or clear the track consumed when the current one ends.
    pub fn set_queued_track(&mut self, url: Option<MediaUrl>) -> CommandOutcome {
        if !self.can_act() {
            debug!("rejecting queued-track update: session locked");
            return CommandOutcome::RejectedLocked;
        }
        if url.as_ref().is_some_and(|u| !u.is_valid()) {
            return CommandOutcome::RejectedInvalid;
        }
        self.route(PendingCommand::SetQueued { url })
    }

    /// Reload the current track. On the owner the live position is captured
    /// and playback resumes there; a remote stops and reloads only if the
    /// owner is currently playing.
    pub fn force_resync(&mut self) {
        if self.transport.is_owner() {
            if self.seekable {
                let resume = if self.backend.is_playing() {
                    self.backend.position()
                } else {
                    self.target_position
                };
                info!(resume, "forced resync, reloading current track");
                self.begin_load();
                self.target_position = resume;
            }
            return;
        }

        debug!("forced resync on remote");
        self.backend.stop();
        if self.sync.owner_playing {
            self.begin_load();
        }
    }

    // === Gate plumbing ===

    fn can_act(&self) -> bool {
        if let Some(access) = &self.access {
            return !self.sync.locked || access.local_has_access();
        }
        self.actor.privileged() || !self.sync.locked
    }

    fn is_admin(&self) -> bool {
        if let Some(access) = &self.access {
            return access.local_has_access();
        }
        self.actor.privileged()
    }

    fn local_generation_step(&self) -> u32 {
        if self.transport.is_owner() {
            GENERATION_STEP_OWNER
        } else {
            GENERATION_STEP_REMOTE
        }
    }

    /// Apply a gated command directly when this participant already holds
    /// authority, otherwise park it and ask the transport for a transfer.
    fn route(&mut self, command: PendingCommand) -> CommandOutcome {
        if self.transport.is_owner() {
            self.apply(command);
            return CommandOutcome::Applied;
        }

        debug!(?command, "parking command, requesting authority");
        self.wait = WaitState::Authority(command);
        self.transport.request_authority();
        CommandOutcome::Deferred
    }

    fn apply(&mut self, command: PendingCommand) {
        match command {
            PendingCommand::Play {
                url,
                generation_step,
            } => self.start_play(url, generation_step),
            PendingCommand::Stop => self.stop_playback(),
            PendingCommand::PauseToggle => self.apply_pause_toggle(),
            PendingCommand::LockToggle => {
                self.sync.locked = !self.sync.locked;
                info!(locked = self.sync.locked, "lock toggled");
                self.publish();
            }
            PendingCommand::RepeatToggle => {
                self.sync.repeat_playlist = !self.sync.repeat_playlist;
                debug!(repeat = self.sync.repeat_playlist, "repeat toggled");
                self.publish();
            }
            PendingCommand::Seek { position } => self.apply_seek(position),
            PendingCommand::SetQueued { url } => {
                debug!(url = ?url, "queued track updated");
                self.queued_url = url;
            }
        }
    }

    // === Mutations (authority held) ===

    fn start_play(&mut self, url: MediaUrl, generation_step: u32) {
        self.pending_play.cancel();
        self.pending_play_url = None;

        if !url.is_valid() {
            return;
        }
        info!(url = %url, "playing new track");

        self.sync.track.generation += generation_step;
        self.sync.track.url = url;
        self.loaded_generation = self.sync.track.generation;
        self.sync.owner_playing = false;
        self.sync.owner_paused = false;
        self.sync.start_anchor = None;
        self.publish();

        self.target_position = self.sync.track.url.start_time();
        self.update_track_urls();

        // Switching away from a source near its end piles the new load onto
        // a backend already tearing down; stop it only with slack left.
        if self.state.is_active() && self.backend.is_playing() && self.seekable {
            let remaining = self.backend.duration() - self.backend.position();
            if remaining > END_SLACK {
                self.backend.stop();
            }
        }

        self.begin_load();
    }

    fn begin_load(&mut self) {
        self.pending_load.cancel();
        if !self.sync.track.url.is_valid() {
            return;
        }

        debug!(url = %self.sync.track.url, "starting media load");
        self.set_state(PlaybackState::Loading);
        self.screen_mode(ScreenMode::Loading);
        self.backend.load(&self.sync.track.url);
    }

    fn stop_playback(&mut self) {
        debug!("stopping playback");

        self.set_state(PlaybackState::Stopped);
        self.screen_mode(ScreenMode::Logo);

        self.backend.stop();
        self.target_position = 0.0;
        self.pending_play.cancel();
        self.pending_play_url = None;
        self.pending_load.cancel();
        self.play_started_at = 0.0;

        if self.transport.is_owner() {
            self.sync.start_anchor = None;
            self.sync.owner_playing = false;
            self.sync.owner_paused = false;
            self.sync.track.url = MediaUrl::empty();
            self.publish();
        }
    }

    fn apply_pause_toggle(&mut self) {
        self.sync.owner_paused = !self.sync.owner_paused;

        if self.sync.owner_paused {
            self.sync.start_anchor = Some(self.clock.now() - self.backend.position());
            self.backend.pause();
            self.set_state(PlaybackState::Paused);
        } else {
            // The backend reports the resume through `Started`, which
            // recomputes the anchor from the live position.
            self.backend.play();
        }

        self.publish();
    }

    fn apply_seek(&mut self, mut position: f64) {
        let duration = self.backend.duration();

        // A seek into the final second promotes to whatever follows the
        // track instead of parking the backend on its end.
        if duration - position < SEEK_END_MARGIN {
            if self.queued_url.as_ref().is_some_and(MediaUrl::is_valid) {
                self.schedule_queued_play();
                return;
            }
            if self.sync.repeat_playlist {
                self.schedule_loop_play();
                return;
            }
            position = duration - SEEK_END_MARGIN;
        }

        debug!(position, "seeking");
        self.sync.start_anchor = Some(self.clock.now() - position);
        self.reconcile();
        self.publish();
    }

    /// Consume the queued track on the next scheduler tick.
    fn schedule_queued_play(&mut self) {
        self.pending_play_url = self.queued_url.take();
        self.pending_play.schedule(self.clock.now());
    }

    /// Replay the current track on the next scheduler tick.
    fn schedule_loop_play(&mut self) {
        self.pending_play_url = Some(self.sync.track.url.clone());
        self.pending_play.schedule(self.clock.now());
    }

    // === Backend callbacks ===

    pub fn handle_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Ready => self.handle_ready(),
            BackendEvent::Started => self.handle_started(),
            BackendEvent::Ended => self.handle_ended(),
            BackendEvent::Error(code) => self.handle_error(code),
        }
    }

    fn handle_ready(&mut self) {
        let duration = self.backend.duration();
        debug!(duration, "media ready");

        self.video_start();

        // A seekable source reports a positive finite duration; anything
        // else is treated as a live stream.
        self.seekable = duration.is_finite() && duration > 1.0;

        if self.transport.is_owner() || self.sync.owner_playing {
            self.backend.play();
        } else if matches!(self.wait, WaitState::Idle) {
            self.wait = WaitState::OwnerStart;
        }
    }

    fn handle_started(&mut self) {
        debug!("media started");
        let now = self.clock.now();

        if self.transport.is_owner() {
            let resumed_from_pause = self.state == PlaybackState::Paused;
            self.sync.start_anchor = if resumed_from_pause {
                Some(now - self.backend.position())
            } else {
                Some(now - self.target_position)
            };

            self.set_state(PlaybackState::Playing);
            self.screen_mode(ScreenMode::Normal);
            self.play_started_at = now;

            self.sync.owner_playing = true;
            self.sync.owner_paused = false;
            self.publish();

            if !resumed_from_pause {
                self.backend.seek(self.target_position);
            }
        } else if !self.sync.owner_playing || self.sync.owner_paused {
            // Started ahead of the owner: hold until the snapshot says go.
            self.backend.pause();
            if matches!(self.wait, WaitState::Idle) {
                self.wait = WaitState::OwnerStart;
            }
            if self.sync.owner_paused {
                self.set_state(PlaybackState::Paused);
            }
        } else {
            self.set_state(PlaybackState::Playing);
            self.screen_mode(ScreenMode::Normal);
            self.play_started_at = now;
            self.reconcile();
        }
    }

    fn handle_ended(&mut self) {
        let now = self.clock.now();
        if !self.seekable && now - self.play_started_at < SPURIOUS_END_WINDOW {
            debug!("end event at start of stream, ignoring");
            return;
        }

        debug!("media ended");
        self.seekable = false;
        self.set_state(PlaybackState::Stopped);
        self.screen_mode(ScreenMode::Logo);
        self.video_stop();

        if self.transport.is_owner() {
            if self.queued_url.as_ref().is_some_and(MediaUrl::is_valid) {
                self.schedule_queued_play();
            } else if self.sync.repeat_playlist {
                self.schedule_loop_play();
            } else {
                self.sync.start_anchor = None;
                self.sync.owner_playing = false;
                self.publish();
            }
        }
    }

    fn handle_error(&mut self, code: MediaError) {
        self.backend.stop();
        warn!(url = %self.sync.track.url, error = %code, "media load failed");

        self.set_state(PlaybackState::Error);
        self.last_error = Some(code);
        self.video_error(code);
        self.screen_mode(ScreenMode::Error);
        self.video_stop();

        let now = self.clock.now();
        if self.transport.is_owner() {
            if self.config.retry_on_error {
                self.pending_load.schedule(now + self.config.retry_delay);
            } else {
                self.sync.start_anchor = None;
                self.target_position = 0.0;
                self.sync.owner_playing = false;
                self.publish();
            }
        } else {
            // A remote cannot assume the owner will recover it.
            self.pending_load.schedule(now + self.config.retry_delay);
        }
    }

    // === Transport events ===

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Snapshot(snapshot) => self.handle_snapshot(snapshot),
            TransportEvent::Authority { granted } => self.handle_authority(granted),
        }
    }

    fn handle_authority(&mut self, granted: bool) {
        match std::mem::replace(&mut self.wait, WaitState::Idle) {
            WaitState::Authority(command) => {
                if granted {
                    debug!("authority granted, applying parked command");
                    self.apply(command);
                } else {
                    warn!("authority transfer denied, dropping command");
                }
            }
            other => {
                debug!("authority outcome with no parked command");
                self.wait = other;
            }
        }
    }

    fn handle_snapshot(&mut self, snapshot: SyncSnapshot) {
        if self.transport.is_owner() {
            return;
        }

        // Delivery is unordered; anything older than what we already loaded
        // is stale and dropped wholesale.
        if snapshot.track.generation < self.loaded_generation {
            debug!(
                generation = snapshot.track.generation,
                loaded = self.loaded_generation,
                "stale snapshot, ignoring"
            );
            return;
        }

        debug!(generation = snapshot.track.generation, "snapshot received");
        self.sync = snapshot;

        if self.sync.track.generation == self.loaded_generation {
            self.follow_owner_state();
            return;
        }

        self.loaded_generation = self.sync.track.generation;
        self.update_track_urls();
        debug!("starting load from snapshot");
        self.begin_load();
    }

    /// Same-generation snapshot: align local play/pause/stop state with the
    /// owner's, and take the chance to reconcile position.
    fn follow_owner_state(&mut self) {
        let active = self.state.is_active();

        if active && !self.sync.owner_playing {
            debug!("owner stopped, following");
            self.clear_owner_wait();
            self.stop_playback();
        } else if self.state == PlaybackState::Paused && !self.sync.owner_paused {
            debug!("owner resumed, unpausing");
            self.clear_owner_wait();
            self.backend.play();
            self.set_state(PlaybackState::Playing);
        } else if self.state == PlaybackState::Playing && self.sync.owner_paused {
            debug!("owner paused, pausing");
            self.backend.pause();
            self.set_state(PlaybackState::Paused);
        } else if active {
            self.reconcile();
        }
    }

    fn clear_owner_wait(&mut self) {
        if matches!(self.wait, WaitState::OwnerStart) {
            self.wait = WaitState::Idle;
        }
    }

    // === Scheduler tick ===

    /// One pass of the cooperative scheduler: fire due delayed actions (at
    /// most one per kind), refresh realtime fields, keep the paused anchor
    /// current, heartbeat, and reconcile.
    pub fn tick(&mut self) {
        let now = self.clock.now();

        if self.pending_play.fire_if_due(now) {
            if let Some(url) = self.pending_play_url.take() {
                let step = self.local_generation_step();
                self.start_play(url, step);
            }
        }
        if self.pending_load.fire_if_due(now) {
            self.begin_load();
        }

        if self.seekable && self.state.is_active() {
            self.track_duration = self.backend.duration();
            self.track_position = self.backend.position();
        }

        // While paused the anchor keeps tracking the frozen position so an
        // unpause resumes in place everywhere.
        if self.transport.is_owner() && self.seekable && self.sync.owner_paused {
            self.sync.start_anchor = Some(now - self.backend.position());
        }

        if matches!(self.wait, WaitState::OwnerStart) {
            if self.sync.owner_playing && !self.sync.owner_paused {
                debug!("owner started, beginning playback");
                self.wait = WaitState::Idle;
                self.set_state(PlaybackState::Playing);
                self.screen_mode(ScreenMode::Normal);
                self.play_started_at = now;
                self.backend.play();
                self.reconcile();
            }
            return;
        }

        if now - self.last_sync_at > self.config.sync_interval {
            self.last_sync_at = now;
            if self.transport.is_owner() && self.state == PlaybackState::Playing {
                self.publish();
            }
            self.reconcile();
        }
    }

    /// Corrective seek against the anchor. Live streams never reconcile
    /// position; only play/pause/stop state is synchronized for them.
    fn reconcile(&mut self) {
        if !self.seekable {
            return;
        }
        let Some(anchor) = self.sync.start_anchor else {
            return;
        };

        let duration = self.backend.duration();
        let position = self.backend.position();
        let target = (self.clock.now() - anchor).clamp(0.0, duration);

        if (position - target).abs() > self.config.drift_threshold
            && duration - position > END_SLACK
        {
            debug!(position, target, "correcting drift");
            self.backend.seek(target);
        }
    }

    // === Publication and notification ===

    fn publish(&mut self) {
        if let Err(e) = self.transport.publish(&self.sync) {
            warn!(error = %e, "snapshot publication failed");
        }
    }

    fn update_track_urls(&mut self) {
        if self.sync.track.url == self.current_url {
            return;
        }
        self.last_url = std::mem::replace(&mut self.current_url, self.sync.track.url.clone());
    }

    fn set_state(&mut self, state: PlaybackState) {
        self.state = state;
        for sink in &self.sinks {
            sink.state_changed(state);
        }
    }

    fn screen_mode(&self, mode: ScreenMode) {
        for sink in &self.sinks {
            sink.screen_mode(mode);
        }
    }

    fn video_error(&self, error: MediaError) {
        for sink in &self.sinks {
            sink.video_error(error);
        }
    }

    fn video_start(&self) {
        for sink in &self.sinks {
            sink.video_start();
        }
    }

    fn video_stop(&self) {
        for sink in &self.sinks {
            sink.video_stop();
        }
    }

    // === Observable session fields ===

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn last_error(&self) -> Option<MediaError> {
        self.last_error
    }

    pub fn current_url(&self) -> &MediaUrl {
        &self.current_url
    }

    pub fn last_url(&self) -> &MediaUrl {
        &self.last_url
    }

    pub fn locked(&self) -> bool {
        self.sync.locked
    }

    pub fn repeat_playlist(&self) -> bool {
        self.sync.repeat_playlist
    }

    pub fn seekable(&self) -> bool {
        self.seekable
    }

    pub fn duration(&self) -> f64 {
        self.track_duration
    }

    pub fn position(&self) -> f64 {
        self.track_position
    }

    pub fn queued_track(&self) -> Option<&MediaUrl> {
        self.queued_url.as_ref()
    }

    pub fn is_owner(&self) -> bool {
        self.transport.is_owner()
    }

    #[cfg(test)]
    fn pending_load_due_at(&self) -> Option<f64> {
        self.pending_load.due_at()
    }
}
