//! Render scheduler.
//!
//! Each session gets one dedicated OS thread that runs:
//!
//! 1. Wait while paused, exit if stopping.
//! 2. Forward queued control messages to the frame source.
//! 3. Run the iteration hook, if any.
//! 4. Take the prefetched frame, or read one now.
//! 5. Tile it and broadcast it.
//! 6. Prefetch the next frame (pipelined strategies only).
//! 7. Sleep until the next frame deadline.
//!
//! The render thread is the only caller into the frame source while the
//! session is live. Pause, resume, seek and kill are requests posted to a
//! shared control block and observed between iterations; the source handle
//! is released by [`RenderScheduler::kill`] after the thread has exited.
//!
//! ```text
//!  Idle ──► Running ◄──► Paused
//!   │          │            │
//!   │          ▼            ▼
//!   │        Ended ◄────────┘   (end of stream / source failure)
//!   │          │
//!   ▼          ▼
//!  Killed ◄────┘
//! ```

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::broadcast::Broadcaster;
use crate::error::TilecastError;
use crate::grid::{GridConfig, GridSpec, TileGrid};
use crate::hub::ReceiverHub;
use crate::source::{ControlMessage, FrameEngine, FrameRead, SourceHandle, VideoInfo};
use crate::tiler::{FrameLayout, FrameTiler};

/// Longest the render thread sleeps before rechecking its control block.
pub const PAUSE_POLL: Duration = Duration::from_millis(50);

/// An iteration hook slower than this is logged.
pub const HOOK_BUDGET: Duration = Duration::from_millis(5);

// ── SchedulerConfig ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub grid: GridConfig,
    pub layout: FrameLayout,
    pub pause_poll: Duration,
    pub hook_budget: Duration,
    /// Render thread stack size. `None` uses the platform default.
    pub stack_size: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            grid: GridConfig::default(),
            layout: FrameLayout::default(),
            pause_poll: PAUSE_POLL,
            hook_budget: HOOK_BUDGET,
            stack_size: None,
        }
    }
}

// ── Pacer ────────────────────────────────────────────────────────

/// Deadline-based frame pacing.
///
/// Each iteration is scheduled one interval after the previous one was
/// scheduled, not after it actually started, so per-iteration jitter does
/// not accumulate. An iteration that starts more than one interval late
/// re-anchors the schedule instead of bursting to catch up.
#[derive(Debug, Clone)]
pub struct Pacer {
    interval: Duration,
    anchor: Option<Instant>,
    deadline: Option<Instant>,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            anchor: None,
            deadline: None,
        }
    }

    pub fn from_fps(fps: u32) -> Self {
        Self::new(Duration::from_secs(1) / fps.max(1))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Mark the start of an iteration.
    pub fn begin(&mut self, now: Instant) {
        let anchor = match self.deadline {
            Some(deadline) if now <= deadline + self.interval => deadline,
            _ => now,
        };
        self.anchor = Some(anchor);
    }

    /// How long to sleep before the next iteration.
    pub fn delay(&mut self, now: Instant) -> Duration {
        let deadline = self.anchor.unwrap_or(now) + self.interval;
        self.deadline = Some(deadline);
        deadline.saturating_duration_since(now)
    }
}

// ── SessionPhase ─────────────────────────────────────────────────

/// Why a render loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    EndOfStream,
    SourceError(String),
    SizeMismatch { expected: usize, actual: usize },
    /// Stopped by a kill request.
    Stopped,
}

impl fmt::Display for LoopExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndOfStream => write!(f, "end of stream"),
            Self::SourceError(e) => write!(f, "frame source error: {e}"),
            Self::SizeMismatch { expected, actual } => {
                write!(f, "frame size mismatch: expected {expected}, got {actual}")
            }
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    Running,
    Paused,
    /// The loop exited on its own. The source is still open until kill.
    Ended(LoopExit),
    Killed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Running => write!(f, "Running"),
            Self::Paused => write!(f, "Paused"),
            Self::Ended(_) => write!(f, "Ended"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

impl SessionPhase {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Valid from: `Idle`.
    pub fn start(&mut self) -> Result<(), TilecastError> {
        match self {
            Self::Idle => {
                *self = Self::Running;
                Ok(())
            }
            Self::Killed => Err(TilecastError::UseAfterKill),
            _ => Err(TilecastError::InvalidTransition("cannot start: already started")),
        }
    }

    /// Valid from: `Running`.
    pub fn pause(&mut self) -> Result<(), TilecastError> {
        match self {
            Self::Running => {
                *self = Self::Paused;
                Ok(())
            }
            Self::Paused => Err(TilecastError::InvalidTransition("cannot pause: already paused")),
            other => Err(other.not_live("cannot pause: loop has ended")),
        }
    }

    /// Valid from: `Paused`.
    pub fn resume(&mut self) -> Result<(), TilecastError> {
        match self {
            Self::Paused => {
                *self = Self::Running;
                Ok(())
            }
            Self::Running => Err(TilecastError::InvalidTransition("cannot resume: not paused")),
            other => Err(other.not_live("cannot resume: loop has ended")),
        }
    }

    /// Valid from: `Running`, `Paused`. Other phases are left alone.
    pub fn finish(&mut self, exit: LoopExit) {
        if self.is_live() {
            *self = Self::Ended(exit);
        }
    }

    /// Valid from anything but `Killed`.
    pub fn kill(&mut self) -> Result<(), TilecastError> {
        match self {
            Self::Killed => Err(TilecastError::UseAfterKill),
            _ => {
                *self = Self::Killed;
                Ok(())
            }
        }
    }

    fn not_live(&self, ended: &'static str) -> TilecastError {
        match self {
            Self::Idle => TilecastError::NotStarted,
            Self::Killed => TilecastError::UseAfterKill,
            _ => TilecastError::InvalidTransition(ended),
        }
    }
}

// ── Control block ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Paused,
    Stopping,
}

#[derive(Debug)]
struct ControlState {
    run: RunState,
    pending: Vec<ControlMessage>,
    frames: u64,
    exit: Option<LoopExit>,
}

/// State shared between a [`RenderScheduler`] and its render thread.
#[derive(Debug)]
struct Control {
    state: Mutex<ControlState>,
    wake: Condvar,
}

impl Control {
    fn new() -> Self {
        Self {
            state: Mutex::new(ControlState {
                run: RunState::Running,
                pending: Vec::new(),
                frames: 0,
                exit: None,
            }),
            wake: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, run: RunState) {
        self.lock().run = run;
        self.wake.notify_all();
    }

    fn push(&self, message: ControlMessage) {
        self.lock().pending.push(message);
        self.wake.notify_all();
    }

    fn frames(&self) -> u64 {
        self.lock().frames
    }

    fn exit(&self) -> Option<LoopExit> {
        self.lock().exit.clone()
    }

    /// Block while paused. `None` means stop; otherwise the queued
    /// control messages.
    fn gate(&self, slice: Duration) -> Option<Vec<ControlMessage>> {
        let mut state = self.lock();
        loop {
            match state.run {
                RunState::Stopping => return None,
                RunState::Running => return Some(std::mem::take(&mut state.pending)),
                RunState::Paused => {
                    state = match self.wake.wait_timeout(state, slice) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
            }
        }
    }

    /// Sleep for `duration` in slices. Returns `false` if a stop was
    /// requested meanwhile.
    fn sleep(&self, duration: Duration, slice: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut state = self.lock();
        loop {
            if state.run == RunState::Stopping {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let wait = (deadline - now).min(slice);
            state = match self.wake.wait_timeout(state, wait) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn frame_done(&self) {
        self.lock().frames += 1;
    }

    fn finish(&self, exit: LoopExit) {
        self.lock().exit = Some(exit);
    }
}

// ── RenderStrategy ───────────────────────────────────────────────

/// What the iteration hook gets to see.
pub struct SourceContext<'a> {
    session: &'a str,
    engine: &'a dyn FrameEngine,
    handle: &'a SourceHandle,
}

impl SourceContext<'_> {
    pub fn session(&self) -> &str {
        self.session
    }

    pub fn handle_id(&self) -> u64 {
        self.handle.raw()
    }

    /// Push a control message into the frame source.
    pub fn control(&self, message: ControlMessage) -> Result<(), TilecastError> {
        self.engine.control(self.handle, message)
    }
}

/// Runs once per iteration before the frame is consumed.
pub type IterationHook = Box<dyn FnMut(&SourceContext<'_>) + Send>;

/// How the loop pulls frames.
pub struct RenderStrategy {
    pub pipelining: bool,
    pub hook: Option<IterationHook>,
}

impl RenderStrategy {
    /// Plain video playback: prefetch the next frame while this one is
    /// on the wire.
    pub fn passive() -> Self {
        Self {
            pipelining: true,
            hook: None,
        }
    }

    /// Input-driven playback. The frame must reflect input pushed by the
    /// hook, so frames are read on demand after it runs.
    pub fn with_hook(hook: IterationHook) -> Self {
        Self {
            pipelining: false,
            hook: Some(hook),
        }
    }

    pub fn pipelining(mut self, enabled: bool) -> Self {
        self.pipelining = enabled;
        self
    }
}

impl Default for RenderStrategy {
    fn default() -> Self {
        Self::passive()
    }
}

impl fmt::Debug for RenderStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderStrategy")
            .field("pipelining", &self.pipelining)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

// ── RenderScheduler ──────────────────────────────────────────────

/// Everything the render thread owns while it runs.
struct LoopParts {
    handle: SourceHandle,
    grid: TileGrid,
    hub: Arc<dyn ReceiverHub>,
    broadcaster: Box<dyn Broadcaster>,
    strategy: RenderStrategy,
}

struct LoopSettings {
    name: String,
    interval: Duration,
    pause_poll: Duration,
    hook_budget: Duration,
    tiler: FrameTiler,
}

/// One render session.
pub struct RenderScheduler {
    name: String,
    engine: Arc<dyn FrameEngine>,
    config: SchedulerConfig,
    info: VideoInfo,
    spec: GridSpec,
    phase: SessionPhase,
    control: Arc<Control>,
    parts: Option<LoopParts>,
    worker: Option<JoinHandle<Option<LoopParts>>>,
}

impl RenderScheduler {
    /// Validate the stream and allocate the tile grid.
    ///
    /// Takes ownership of `handle`. If the stream cannot be tiled the
    /// handle is closed before the error is returned.
    pub fn new(
        name: impl Into<String>,
        engine: Arc<dyn FrameEngine>,
        handle: SourceHandle,
        hub: Arc<dyn ReceiverHub>,
        broadcaster: Box<dyn Broadcaster>,
        strategy: RenderStrategy,
        config: SchedulerConfig,
    ) -> Result<Self, TilecastError> {
        let name = name.into();
        let prepared = engine.info(&handle).and_then(|info| {
            if info.fps == 0 {
                return Err(TilecastError::FrameSource("frame rate must be positive".into()));
            }
            let grid = TileGrid::for_frame(info.width, info.height, config.grid)?;
            Ok((info, grid))
        });

        let (info, grid) = match prepared {
            Ok(v) => v,
            Err(e) => {
                if let Err(close_err) = engine.close(handle) {
                    warn!(session = %name, error = %close_err, "failed to close rejected source");
                }
                return Err(e);
            }
        };

        debug!(
            session = %name,
            width = info.width,
            height = info.height,
            fps = info.fps,
            tiles = grid.len(),
            "render session prepared"
        );

        Ok(Self {
            name,
            engine,
            config,
            info,
            spec: grid.spec().clone(),
            phase: SessionPhase::Idle,
            control: Arc::new(Control::new()),
            parts: Some(LoopParts {
                handle,
                grid,
                hub,
                broadcaster,
                strategy,
            }),
            worker: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> VideoInfo {
        self.info
    }

    pub fn grid_spec(&self) -> &GridSpec {
        &self.spec
    }

    /// Frames broadcast so far.
    pub fn frames_rendered(&self) -> u64 {
        self.control.frames()
    }

    /// Current phase, including an exit the loop took on its own.
    pub fn phase(&self) -> SessionPhase {
        let mut phase = self.phase.clone();
        if let Some(exit) = self.control.exit() {
            phase.finish(exit);
        }
        phase
    }

    fn refresh(&mut self) {
        if let Some(exit) = self.control.exit() {
            self.phase.finish(exit);
        }
    }

    /// Spawn the render thread.
    pub fn start(&mut self) -> Result<(), TilecastError> {
        let mut next = self.phase.clone();
        next.start()?;
        let parts = self.parts.take().ok_or(TilecastError::InvalidTransition(
            "cannot start: session resources already taken",
        ))?;

        let settings = LoopSettings {
            name: self.name.clone(),
            interval: Duration::from_secs(1) / self.info.fps,
            pause_poll: self.config.pause_poll,
            hook_budget: self.config.hook_budget,
            tiler: FrameTiler::new(self.config.layout),
        };
        let engine = Arc::clone(&self.engine);
        let control = Arc::clone(&self.control);

        // Held in a slot so a failed spawn hands the source back.
        let slot = Arc::new(Mutex::new(Some(parts)));
        let loop_slot = Arc::clone(&slot);
        let mut builder = thread::Builder::new().name(format!("render-{}", self.name));
        if let Some(size) = self.config.stack_size {
            builder = builder.stack_size(size);
        }
        let spawned = builder.spawn(move || {
            let parts = loop_slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            parts.map(|parts| render_loop(parts, engine, control, settings))
        });
        let worker = match spawned {
            Ok(worker) => worker,
            Err(e) => {
                self.parts = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
                error!(session = %self.name, error = %e, "failed to spawn render thread");
                return Err(e.into());
            }
        };
        self.worker = Some(worker);
        self.phase = next;

        info!(session = %self.name, fps = self.info.fps, "rendering started");
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), TilecastError> {
        self.refresh();
        self.phase.pause()?;
        self.control.set(RunState::Paused);
        info!(session = %self.name, "rendering paused");
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), TilecastError> {
        self.refresh();
        self.phase.resume()?;
        self.control.set(RunState::Running);
        info!(session = %self.name, "rendering resumed");
        Ok(())
    }

    /// Pause if running, resume if paused.
    pub fn toggle_pause(&mut self) -> Result<(), TilecastError> {
        self.refresh();
        match self.phase {
            SessionPhase::Paused => self.resume(),
            _ => self.pause(),
        }
    }

    /// Queue a message for the frame source. It is delivered by the
    /// render thread at the start of its next iteration.
    pub fn control(&mut self, message: ControlMessage) -> Result<(), TilecastError> {
        self.refresh();
        match &self.phase {
            SessionPhase::Killed => Err(TilecastError::UseAfterKill),
            SessionPhase::Ended(_) => {
                Err(TilecastError::InvalidTransition("cannot send control: loop has ended"))
            }
            _ => {
                self.control.push(message);
                Ok(())
            }
        }
    }

    pub fn seek(&mut self, second: u32) -> Result<(), TilecastError> {
        self.control(ControlMessage::Seek { second })
    }

    /// Stop the thread, clear the receivers and release the source.
    ///
    /// Blocks until the render thread has exited, which takes at most one
    /// iteration or one `pause_poll` slice. Async callers should run it
    /// where blocking is allowed.
    ///
    /// A second call fails with [`TilecastError::UseAfterKill`].
    pub fn kill(&mut self) -> Result<(), TilecastError> {
        self.refresh();
        self.phase.kill()?;
        self.control.set(RunState::Stopping);

        let parts = match self.worker.take() {
            Some(worker) => match worker.join() {
                Ok(Some(mut parts)) => {
                    let receivers = parts.hub.receivers();
                    parts.broadcaster.blackout(&parts.grid, &receivers);
                    Some(parts)
                }
                Ok(None) => None,
                Err(_) => {
                    error!(session = %self.name, "render thread panicked");
                    None
                }
            },
            None => self.parts.take(),
        };

        let result = match parts {
            Some(parts) => self.engine.close(parts.handle),
            None => Ok(()),
        };
        info!(
            session = %self.name,
            frames = self.control.frames(),
            "render session killed"
        );
        result
    }
}

impl Drop for RenderScheduler {
    fn drop(&mut self) {
        if self.phase != SessionPhase::Killed {
            if let Err(e) = self.kill() {
                warn!(session = %self.name, error = %e, "kill on drop failed");
            }
        }
    }
}

// ── Render loop ──────────────────────────────────────────────────

fn render_loop(
    mut parts: LoopParts,
    engine: Arc<dyn FrameEngine>,
    control: Arc<Control>,
    settings: LoopSettings,
) -> LoopParts {
    let exit = run_iterations(&mut parts, engine.as_ref(), &control, &settings);
    match &exit {
        LoopExit::EndOfStream => info!(session = %settings.name, "end of stream"),
        LoopExit::Stopped => debug!(session = %settings.name, "render loop stopped"),
        LoopExit::SourceError(e) => {
            error!(session = %settings.name, error = %e, "frame source failed")
        }
        LoopExit::SizeMismatch { expected, actual } => {
            error!(session = %settings.name, expected, actual, "frame does not match tile grid")
        }
    }
    control.finish(exit);
    parts
}

fn read_frame(
    engine: &dyn FrameEngine,
    handle: &SourceHandle,
    buf: &mut Vec<u8>,
) -> Result<(), LoopExit> {
    match engine.next_frame(handle, buf) {
        Ok(FrameRead::Frame) => Ok(()),
        Ok(FrameRead::EndOfStream) | Err(TilecastError::FrameSourceExhausted) => {
            Err(LoopExit::EndOfStream)
        }
        Err(e) => Err(LoopExit::SourceError(e.to_string())),
    }
}

fn run_iterations(
    parts: &mut LoopParts,
    engine: &dyn FrameEngine,
    control: &Control,
    settings: &LoopSettings,
) -> LoopExit {
    let LoopParts {
        handle,
        grid,
        hub,
        broadcaster,
        strategy,
    } = parts;
    let handle: &SourceHandle = handle;

    let receivers = hub.receivers();
    broadcaster.init(&receivers);
    broadcaster.blackout(grid, &receivers);

    let mut pacer = Pacer::new(settings.interval);
    let capacity = grid.spec().total_bytes();
    let mut current = Vec::with_capacity(capacity);
    let mut next = Vec::with_capacity(capacity);
    let mut prefetched = false;
    let mut deferred: Option<LoopExit> = None;

    loop {
        let Some(pending) = control.gate(settings.pause_poll) else {
            return LoopExit::Stopped;
        };
        pacer.begin(Instant::now());

        for message in pending {
            if let Err(e) = engine.control(handle, message) {
                warn!(session = %settings.name, error = %e, "control message rejected");
            }
        }

        if let Some(hook) = strategy.hook.as_mut() {
            let started = Instant::now();
            hook(&SourceContext {
                session: &settings.name,
                engine,
                handle,
            });
            let took = started.elapsed();
            if took > settings.hook_budget {
                warn!(session = %settings.name, ?took, "iteration hook over budget");
            }
        }

        if prefetched {
            std::mem::swap(&mut current, &mut next);
            prefetched = false;
        } else if let Err(exit) = read_frame(engine, handle, &mut current) {
            return exit;
        }

        if let Err(e) = settings.tiler.fill(grid, &current) {
            return match e {
                TilecastError::SizeMismatch { expected, actual } => {
                    LoopExit::SizeMismatch { expected, actual }
                }
                other => LoopExit::SourceError(other.to_string()),
            };
        }
        let receivers = hub.receivers();
        broadcaster.send(grid, &receivers);
        control.frame_done();

        if strategy.pipelining {
            match read_frame(engine, handle, &mut next) {
                Ok(()) => prefetched = true,
                Err(exit) => deferred = Some(exit),
            }
        }

        let delay = pacer.delay(Instant::now());
        if !control.sleep(delay, settings.pause_poll) {
            return LoopExit::Stopped;
        }
        if let Some(exit) = deferred.take() {
            return exit;
        }
    }
}
