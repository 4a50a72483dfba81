//! Live sessions, keyed by screen name.
//!
//! [`SessionManager`] turns a playback request into either an in-band
//! session (a [`RenderScheduler`] streaming tile updates through the hub)
//! or an out-of-band session (a handshake, then a `Start` control message
//! that tells the producer to stream to the map server directly). It also
//! hands every session its own tile-id range so that no two live sessions
//! address the same tile.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::broadcast::{BLACKOUT_COLOR, TileBroadcaster};
use crate::error::TilecastError;
use crate::grid::{GridSpec, compute_grid};
use crate::handshake::{Authorization, HandshakeConfig, HandshakeCoordinator, MapServerEndpoint};
use crate::hub::ReceiverHub;
use crate::scheduler::{RenderScheduler, RenderStrategy, SchedulerConfig, SessionPhase};
use crate::source::{ControlMessage, FrameEngine, OpenOptions, SourceHandle, VideoInfo};

// ── Configuration ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    InBand,
    OutOfBand,
}

/// What to do when the out-of-band handshake falls short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumFallback {
    #[default]
    Abort,
    InBand,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub scheduler: SchedulerConfig,
    pub handshake: HandshakeConfig,
    pub map_server: MapServerEndpoint,
    pub pipelining: bool,
    pub blackout_color: u8,
    /// First tile id handed out.
    pub base_tile_id: u32,
    /// Tile ids reserved per session.
    pub tile_id_span: u32,
    pub fallback: QuorumFallback,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            handshake: HandshakeConfig::default(),
            map_server: MapServerEndpoint {
                ip: "127.0.0.1".into(),
                port: 8099,
            },
            pipelining: true,
            blackout_color: BLACKOUT_COLOR,
            base_tile_id: 1_000_000,
            tile_id_span: 4096,
            fallback: QuorumFallback::default(),
        }
    }
}

// ── Tile id ranges ───────────────────────────────────────────────

/// `span` consecutive tile ids starting at `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileIdRange {
    pub base: u32,
    pub span: u32,
}

impl TileIdRange {
    pub fn contains(&self, id: u32) -> bool {
        id >= self.base && id - self.base < self.span
    }

    fn overlaps(&self, other: &TileIdRange) -> bool {
        self.base < other.base.saturating_add(other.span) && other.base < self.base.saturating_add(self.span)
    }
}

/// Hands out fixed-size, non-overlapping tile id ranges.
#[derive(Debug, Clone)]
pub struct TileIdAllocator {
    base: u32,
    span: u32,
    taken: BTreeSet<u32>,
}

impl TileIdAllocator {
    pub fn new(base: u32, span: u32) -> Self {
        Self {
            base,
            span,
            taken: BTreeSet::new(),
        }
    }

    fn slot_range(&self, slot: u32) -> Option<TileIdRange> {
        let base = slot.checked_mul(self.span)?.checked_add(self.base)?;
        base.checked_add(self.span)?;
        Some(TileIdRange {
            base,
            span: self.span,
        })
    }

    /// Reserve the lowest free range able to address `tiles` tiles.
    pub fn allocate(&mut self, tiles: usize) -> Result<TileIdRange, TilecastError> {
        if self.span == 0 || tiles > self.span as usize {
            return Err(TilecastError::TileIdsExhausted);
        }
        let mut slot = 0;
        loop {
            let range = self.slot_range(slot).ok_or(TilecastError::TileIdsExhausted)?;
            if self.taken.insert(slot) {
                return Ok(range);
            }
            slot += 1;
        }
    }

    pub fn release(&mut self, range: TileIdRange) {
        if let Some(offset) = range.base.checked_sub(self.base) {
            self.taken.remove(&(offset / self.span.max(1)));
        }
    }

    pub fn in_use(&self) -> usize {
        self.taken.len()
    }
}

// ── Out-of-band session ──────────────────────────────────────────

/// Producer streams straight to the map server; the host only relays
/// control.
pub struct OutOfBandSession {
    name: String,
    engine: Arc<dyn FrameEngine>,
    handle: Option<SourceHandle>,
    info: VideoInfo,
    authorization: Authorization,
    phase: SessionPhase,
}

impl OutOfBandSession {
    /// Send `Start` to the producer. Requires a completed handshake.
    pub fn start(
        name: impl Into<String>,
        engine: Arc<dyn FrameEngine>,
        handle: SourceHandle,
        info: VideoInfo,
        authorization: Authorization,
    ) -> Result<Self, TilecastError> {
        let name = name.into();
        if let Err(e) = engine.control(&handle, ControlMessage::Start { fps: info.fps }) {
            if let Err(close_err) = engine.close(handle) {
                warn!(session = %name, error = %close_err, "failed to close source");
            }
            return Err(e);
        }

        let mut phase = SessionPhase::Idle;
        phase.start()?;
        info!(
            session = %name,
            fps = info.fps,
            receivers = authorization.receivers().len(),
            "out-of-band stream started"
        );
        Ok(Self {
            name,
            engine,
            handle: Some(handle),
            info,
            authorization,
            phase,
        })
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase.clone()
    }

    pub fn authorization(&self) -> &Authorization {
        &self.authorization
    }

    fn handle(&self) -> Result<&SourceHandle, TilecastError> {
        self.handle.as_ref().ok_or(TilecastError::UseAfterKill)
    }

    pub fn toggle_pause(&mut self) -> Result<(), TilecastError> {
        let message = match self.phase {
            SessionPhase::Paused => ControlMessage::Start { fps: self.info.fps },
            _ => ControlMessage::Stop,
        };
        let mut next = self.phase.clone();
        match message {
            ControlMessage::Stop => next.pause()?,
            _ => next.resume()?,
        }
        self.engine.control(self.handle()?, message)?;
        self.phase = next;
        Ok(())
    }

    pub fn seek(&mut self, second: u32) -> Result<(), TilecastError> {
        self.engine.control(self.handle()?, ControlMessage::Seek { second })
    }

    pub fn kill(&mut self) -> Result<(), TilecastError> {
        self.phase.kill()?;
        let handle = self.handle.take().ok_or(TilecastError::UseAfterKill)?;
        if let Err(e) = self.engine.control(&handle, ControlMessage::Stop) {
            warn!(session = %self.name, error = %e, "stop rejected by producer");
        }
        self.engine.close(handle)
    }
}

impl Drop for OutOfBandSession {
    fn drop(&mut self) {
        if self.phase != SessionPhase::Killed {
            if let Err(e) = self.kill() {
                warn!(session = %self.name, error = %e, "kill on drop failed");
            }
        }
    }
}

// ── SessionManager ───────────────────────────────────────────────

/// A request to play `identifier` on `screen`.
pub struct PlaybackRequest {
    pub screen: String,
    pub identifier: String,
    pub mode: DeliveryMode,
    /// Defaults to a passive strategy with the configured pipelining.
    pub strategy: Option<RenderStrategy>,
}

impl PlaybackRequest {
    pub fn new(screen: impl Into<String>, identifier: impl Into<String>, mode: DeliveryMode) -> Self {
        Self {
            screen: screen.into(),
            identifier: identifier.into(),
            mode,
            strategy: None,
        }
    }

    pub fn with_strategy(mut self, strategy: RenderStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

enum Session {
    InBand(RenderScheduler),
    OutOfBand(OutOfBandSession),
}

struct Entry {
    session: Session,
    tile_ids: TileIdRange,
}

/// Snapshot of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub screen: String,
    pub mode: DeliveryMode,
    pub phase: SessionPhase,
    pub tile_ids: TileIdRange,
    /// In-band sessions only.
    pub frames_rendered: Option<u64>,
}

pub struct SessionManager {
    engine: Arc<dyn FrameEngine>,
    hub: Arc<dyn ReceiverHub>,
    coordinator: Arc<HandshakeCoordinator>,
    config: SessionConfig,
    sessions: HashMap<String, Entry>,
    tile_ids: TileIdAllocator,
}

impl SessionManager {
    pub fn new(engine: Arc<dyn FrameEngine>, hub: Arc<dyn ReceiverHub>, config: SessionConfig) -> Self {
        let coordinator = Arc::new(HandshakeCoordinator::new(Arc::clone(&hub), config.handshake));
        let tile_ids = TileIdAllocator::new(config.base_tile_id, config.tile_id_span);
        Self {
            engine,
            hub,
            coordinator,
            config,
            sessions: HashMap::new(),
            tile_ids,
        }
    }

    /// The coordinator to register for handshake replies.
    pub fn handshake_coordinator(&self) -> Arc<HandshakeCoordinator> {
        Arc::clone(&self.coordinator)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open the source, validate its geometry and start streaming.
    ///
    /// Returns the delivery mode actually used, which differs from the
    /// requested one when an out-of-band start falls back to in-band.
    pub async fn start_playback(&mut self, request: PlaybackRequest) -> Result<DeliveryMode, TilecastError> {
        if self.sessions.contains_key(&request.screen) {
            return Err(TilecastError::SessionExists(request.screen));
        }

        let options = OpenOptions {
            layout: self.config.scheduler.layout,
            grid: self.config.scheduler.grid,
        };
        let handle = self.engine.open(&request.identifier, &options)?;

        let prepared = self.engine.info(&handle).and_then(|info| {
            let spec = compute_grid(info.width, info.height, self.config.scheduler.grid)?;
            let range = self.tile_ids.allocate(spec.tile_count())?;
            Ok((info, spec, range))
        });
        let (info, spec, range) = match prepared {
            Ok(v) => v,
            Err(e) => {
                close_source(self.engine.as_ref(), handle, &request.screen);
                return Err(e);
            }
        };

        let screen = request.screen.clone();
        let launcher = Launcher {
            engine: &self.engine,
            hub: &self.hub,
            coordinator: &self.coordinator,
            config: &self.config,
        };
        match launcher.launch(request, handle, info, &spec, range).await {
            Ok((session, mode)) => {
                info!(
                    session = %screen,
                    ?mode,
                    base_tile_id = range.base,
                    tiles = spec.tile_count(),
                    "playback started"
                );
                self.sessions.insert(
                    screen,
                    Entry {
                        session,
                        tile_ids: range,
                    },
                );
                Ok(mode)
            }
            Err(e) => {
                self.tile_ids.release(range);
                Err(e)
            }
        }
    }

    fn entry_mut(&mut self, screen: &str) -> Result<&mut Entry, TilecastError> {
        self.sessions
            .get_mut(screen)
            .ok_or_else(|| TilecastError::UnknownSession(screen.to_string()))
    }

    /// Pause a running session, resume a paused one.
    pub fn toggle_pause(&mut self, screen: &str) -> Result<(), TilecastError> {
        match &mut self.entry_mut(screen)?.session {
            Session::InBand(s) => s.toggle_pause(),
            Session::OutOfBand(s) => s.toggle_pause(),
        }
    }

    pub fn seek(&mut self, screen: &str, second: u32) -> Result<(), TilecastError> {
        match &mut self.entry_mut(screen)?.session {
            Session::InBand(s) => s.seek(second),
            Session::OutOfBand(s) => s.seek(second),
        }
    }

    /// Kill a session, release its source and free its tile ids.
    ///
    /// For an in-band session this joins the render thread and so blocks
    /// the caller; see [`RenderScheduler::kill`].
    pub fn kill(&mut self, screen: &str) -> Result<(), TilecastError> {
        let mut entry = self
            .sessions
            .remove(screen)
            .ok_or_else(|| TilecastError::UnknownSession(screen.to_string()))?;
        self.tile_ids.release(entry.tile_ids);
        match &mut entry.session {
            Session::InBand(s) => s.kill(),
            Session::OutOfBand(s) => s.kill(),
        }
    }

    pub fn status(&self, screen: &str) -> Result<SessionStatus, TilecastError> {
        let entry = self
            .sessions
            .get(screen)
            .ok_or_else(|| TilecastError::UnknownSession(screen.to_string()))?;
        let (mode, phase, frames_rendered) = match &entry.session {
            Session::InBand(s) => (DeliveryMode::InBand, s.phase(), Some(s.frames_rendered())),
            Session::OutOfBand(s) => (DeliveryMode::OutOfBand, s.phase(), None),
        };
        Ok(SessionStatus {
            screen: screen.to_string(),
            mode,
            phase,
            tile_ids: entry.tile_ids,
            frames_rendered,
        })
    }

    pub fn screens(&self) -> Vec<String> {
        let mut screens: Vec<String> = self.sessions.keys().cloned().collect();
        screens.sort();
        screens
    }

    /// Kill every session.
    pub fn shutdown(&mut self) {
        for screen in self.screens() {
            if let Err(e) = self.kill(&screen) {
                warn!(session = %screen, error = %e, "kill during shutdown failed");
            }
        }
    }

    /// Whether any two live sessions share a tile id.
    pub fn has_overlapping_tile_ids(&self) -> bool {
        let ranges: Vec<TileIdRange> = self.sessions.values().map(|e| e.tile_ids).collect();
        ranges
            .iter()
            .enumerate()
            .any(|(i, a)| ranges[i + 1..].iter().any(|b| a.overlaps(b)))
    }
}

/// Borrowed pieces of a [`SessionManager`] needed to start a session.
struct Launcher<'a> {
    engine: &'a Arc<dyn FrameEngine>,
    hub: &'a Arc<dyn ReceiverHub>,
    coordinator: &'a HandshakeCoordinator,
    config: &'a SessionConfig,
}

impl Launcher<'_> {
    async fn launch(
        &self,
        request: PlaybackRequest,
        handle: SourceHandle,
        info: VideoInfo,
        spec: &GridSpec,
        range: TileIdRange,
    ) -> Result<(Session, DeliveryMode), TilecastError> {
        let PlaybackRequest {
            screen,
            mode,
            strategy,
            ..
        } = request;

        if mode == DeliveryMode::OutOfBand {
            match self.coordinator.run(spec, &self.config.map_server, range.base).await {
                Ok(authorization) => {
                    let session =
                        OutOfBandSession::start(&screen, Arc::clone(self.engine), handle, info, authorization)?;
                    return Ok((Session::OutOfBand(session), DeliveryMode::OutOfBand));
                }
                Err(
                    e @ (TilecastError::HandshakeQuorumTimeout { .. }
                    | TilecastError::NoCompatibleReceivers),
                ) if self.config.fallback == QuorumFallback::InBand => {
                    warn!(session = %screen, error = %e, "falling back to in-band delivery");
                }
                Err(e) => {
                    close_source(self.engine.as_ref(), handle, &screen);
                    return Err(e);
                }
            }
        }

        let strategy =
            strategy.unwrap_or_else(|| RenderStrategy::passive().pipelining(self.config.pipelining));
        let broadcaster = TileBroadcaster::new(Arc::clone(self.hub), range.base)
            .with_blackout_color(self.config.blackout_color);
        let mut scheduler = RenderScheduler::new(
            &screen,
            Arc::clone(self.engine),
            handle,
            Arc::clone(self.hub),
            Box::new(broadcaster),
            strategy,
            self.config.scheduler,
        )?;
        scheduler.start()?;
        Ok((Session::InBand(scheduler), DeliveryMode::InBand))
    }
}

fn close_source(engine: &dyn FrameEngine, handle: SourceHandle, screen: &str) {
    if let Err(e) = engine.close(handle) {
        warn!(session = %screen, error = %e, "failed to close source");
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
