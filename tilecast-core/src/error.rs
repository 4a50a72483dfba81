//! Domain-specific error types for tile streaming.
//!
//! All fallible operations return `Result<T, TilecastError>`.
//! Geometry and wire errors fail the call that produced them; render-loop
//! errors are logged and reported through the session's exit reason.

use thiserror::Error;

/// The canonical error type for tilecast.
#[derive(Debug, Error)]
pub enum TilecastError {
    // ── Geometry / Tiling ────────────────────────────────────────
    /// Width or height is odd (or zero). Only even dimensions tile.
    #[error("invalid dimensions {width}x{height}: width and height must be even and non-zero")]
    InvalidDimensions { width: u32, height: u32 },

    /// The tile edge must be non-zero.
    #[error("invalid tile edge: {0}")]
    InvalidTileEdge(u32),

    /// The frame length disagrees with the grid's total tile bytes.
    #[error("frame size mismatch: grid expects {expected} bytes, frame has {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    // ── Frame Source ─────────────────────────────────────────────
    /// The frame source has no more frames.
    #[error("frame source exhausted")]
    FrameSourceExhausted,

    /// The frame source failed to open or decode.
    #[error("frame source error: {0}")]
    FrameSource(String),

    // ── Handshake ────────────────────────────────────────────────
    /// Fewer receivers completed the handshake than acknowledged it.
    #[error("handshake quorum not reached: {completed}/{required} receivers completed")]
    HandshakeQuorumTimeout { completed: usize, required: usize },

    /// No connected receiver acknowledged the out-of-band protocol.
    #[error("no compatible receivers acknowledged the protocol")]
    NoCompatibleReceivers,

    // ── Session ──────────────────────────────────────────────────
    /// Operation invoked on a session that has already been killed.
    #[error("session has been killed")]
    UseAfterKill,

    /// Operation requires a started session.
    #[error("session has not been started")]
    NotStarted,

    /// A lifecycle transition was requested from the wrong state.
    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),

    /// No session is registered under this name.
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// A session is already registered under this name.
    #[error("session already exists: {0}")]
    SessionExists(String),

    /// No free tile-id range is left for a new session.
    #[error("tile id space exhausted")]
    TileIdsExhausted,

    // ── Wire ─────────────────────────────────────────────────────
    /// A message body could not be decoded.
    #[error("decode error: {0}")]
    Decode(&'static str),

    /// UTF-8 conversion failed.
    #[error("invalid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    // ── Transport ────────────────────────────────────────────────
    /// The receiver transport refused a message.
    #[error("transport error: {0}")]
    Transport(String),

    /// An internal channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// The IO layer reported an error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for TilecastError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        TilecastError::ChannelClosed
    }
}

// ── PlaybackOutcome ───────────────────────────────────────────────

/// Operator-facing result of a playback request.
///
/// Callers that report to a human get this small enum instead of the
/// raw error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackOutcome {
    Success,
    NotEnoughClients,
    InvalidDimensions,
    DecodeFailed,
}

impl PlaybackOutcome {
    /// Collapse a playback result into an outcome.
    pub fn from_result<T>(result: &Result<T, TilecastError>) -> Self {
        match result {
            Ok(_) => PlaybackOutcome::Success,
            Err(e) => PlaybackOutcome::from(e),
        }
    }
}

impl From<&TilecastError> for PlaybackOutcome {
    fn from(e: &TilecastError) -> Self {
        match e {
            TilecastError::InvalidDimensions { .. } | TilecastError::SizeMismatch { .. } => {
                PlaybackOutcome::InvalidDimensions
            }
            TilecastError::HandshakeQuorumTimeout { .. } | TilecastError::NoCompatibleReceivers => {
                PlaybackOutcome::NotEnoughClients
            }
            _ => PlaybackOutcome::DecodeFailed,
        }
    }
}

impl std::fmt::Display for PlaybackOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackOutcome::Success => write!(f, "playback started"),
            PlaybackOutcome::NotEnoughClients => write!(f, "not enough clients completed the handshake"),
            PlaybackOutcome::InvalidDimensions => write!(f, "video dimensions are not supported"),
            PlaybackOutcome::DecodeFailed => write!(f, "video could not be decoded"),
        }
    }
}
