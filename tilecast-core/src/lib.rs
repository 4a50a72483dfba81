//! # tilecast-core
//!
//! Streams decoded video frames to a wall of fixed-size tiles held by
//! remote receivers.
//!
//! ```text
//! FrameEngine ──► FrameTiler ──► TileGrid ──► Broadcaster ──► ReceiverHub
//!      ▲                                                           │
//!      └───────────── RenderScheduler (pacing, pause, kill) ───────┘
//!
//! out-of-band: HandshakeCoordinator ──► receivers pull from a map server
//! ```
//!
//! ## Modules
//!
//! | Module      | Purpose                                              |
//! |-------------|------------------------------------------------------|
//! | `grid`      | Tile geometry: counts, margins, byte offsets         |
//! | `tiler`     | Copying decoded frames into per-tile buffers         |
//! | `wire`      | Varint-based message encodings for every channel     |
//! | `codec`     | Length-prefixed channel framing for `tokio_util`     |
//! | `source`    | `FrameEngine` trait over the decoding backend        |
//! | `hub`       | `ReceiverHub` trait over connected receivers         |
//! | `broadcast` | Tile fan-out and blackout                            |
//! | `scheduler` | Per-session render thread and its lifecycle          |
//! | `handshake` | Two-phase receiver negotiation for out-of-band mode  |
//! | `session`   | Screens, tile-id ranges and delivery-mode selection  |
//! | `error`     | `TilecastError` and the user-facing outcome          |

pub mod broadcast;
pub mod codec;
pub mod error;
pub mod grid;
pub mod handshake;
pub mod hub;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod tiler;
pub mod wire;

// ── Re-exports ───────────────────────────────────────────────────

pub use broadcast::{BLACKOUT_COLOR, BroadcastStats, Broadcaster, TileBroadcaster};
pub use codec::{ChannelCodec, ChannelMessage, MAX_FRAME_SIZE};
pub use error::{PlaybackOutcome, TilecastError};
pub use grid::{GridConfig, GridSpec, MarginPolicy, TILE_EDGE, Tile, TileBuffer, TileGrid, compute_grid};
pub use handshake::{
    Authorization, HandshakeConfig, HandshakeCoordinator, HandshakeReport, MapServerEndpoint,
};
pub use hub::{MemoryHub, MessageHandler, ReceiverHub, ReceiverId};
pub use scheduler::{
    LoopExit, Pacer, RenderScheduler, RenderStrategy, SchedulerConfig, SessionPhase, SourceContext,
};
pub use session::{
    DeliveryMode, OutOfBandSession, PlaybackRequest, QuorumFallback, SessionConfig, SessionManager,
    SessionStatus, TileIdAllocator, TileIdRange,
};
pub use source::{
    ControlMessage, FrameEngine, FrameRead, MemoryEngine, OpenOptions, SourceHandle, VideoInfo,
};
pub use tiler::{FrameLayout, FrameTiler};
