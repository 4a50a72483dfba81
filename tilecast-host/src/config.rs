//! Host configuration, loaded from TOML.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tilecast_core::grid::{GridConfig, MarginPolicy, TILE_EDGE};
use tilecast_core::handshake::{HandshakeConfig, MapServerEndpoint};
use tilecast_core::scheduler::SchedulerConfig;
use tilecast_core::session::{QuorumFallback, SessionConfig};
use tilecast_core::tiler::FrameLayout;
use tilecast_core::wire::PROTOCOL_VERSION;
use tilecast_core::BLACKOUT_COLOR;

use crate::hub::DEFAULT_QUEUE_DEPTH;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub network: NetworkConfig,
    pub render: RenderConfig,
    pub handshake: HandshakeSection,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the receiver hub listens on.
    pub listen_addr: String,
    /// Map server advertised to receivers in out-of-band mode.
    pub map_server_ip: String,
    pub map_server_port: u16,
    /// Outbound messages queued per receiver. A receiver that falls this
    /// far behind is disconnected.
    pub send_queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Tile edge in pixels.
    pub tile_edge: u32,
    pub margin_policy: MarginPolicy,
    /// Byte order the render loop expects from the frame engine.
    pub frame_layout: FrameLayout,
    pub pause_poll_ms: u64,
    /// Read the next frame while the current one is on the wire.
    pub pipelining: bool,
    pub blackout_color: u8,
    pub base_tile_id: u32,
    /// Tile ids reserved for each session.
    pub tile_id_span: u32,
    pub hook_budget_ms: u64,
    /// Render thread stack in KiB. 0 keeps the platform default.
    pub thread_stack_kib: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeSection {
    pub protocol_version: u32,
    pub ack_grace_ms: u64,
    pub poll_tick_ms: u64,
    pub poll_ticks: u32,
    /// What to do when too few receivers complete the handshake.
    pub fallback: QuorumFallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8098".into(),
            map_server_ip: "127.0.0.1".into(),
            map_server_port: 8099,
            send_queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            tile_edge: TILE_EDGE,
            margin_policy: MarginPolicy::default(),
            frame_layout: FrameLayout::default(),
            pause_poll_ms: 50,
            pipelining: true,
            blackout_color: BLACKOUT_COLOR,
            base_tile_id: 1_000_000,
            tile_id_span: 4096,
            hook_budget_ms: 5,
            thread_stack_kib: 0,
        }
    }
}

impl Default for HandshakeSection {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            ack_grace_ms: 500,
            poll_tick_ms: 5,
            poll_ticks: 300,
            fallback: QuorumFallback::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl HostConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Core session settings. A zero tile edge or span is replaced by the
    /// default rather than producing an unusable grid.
    pub fn to_session_config(&self) -> SessionConfig {
        let render = &self.render;
        let defaults = RenderConfig::default();
        let grid = GridConfig {
            tile_edge: if render.tile_edge == 0 { defaults.tile_edge } else { render.tile_edge },
            margin_policy: render.margin_policy,
        };

        SessionConfig {
            scheduler: SchedulerConfig {
                grid,
                layout: render.frame_layout,
                pause_poll: Duration::from_millis(render.pause_poll_ms.max(1)),
                hook_budget: Duration::from_millis(render.hook_budget_ms),
                stack_size: match render.thread_stack_kib {
                    0 => None,
                    kib => Some(kib.saturating_mul(1024)),
                },
            },
            handshake: HandshakeConfig {
                protocol_version: self.handshake.protocol_version,
                ack_grace: Duration::from_millis(self.handshake.ack_grace_ms),
                poll_tick: Duration::from_millis(self.handshake.poll_tick_ms.max(1)),
                poll_ticks: self.handshake.poll_ticks,
            },
            map_server: MapServerEndpoint {
                ip: self.network.map_server_ip.clone(),
                port: self.network.map_server_port,
            },
            pipelining: render.pipelining,
            blackout_color: render.blackout_color,
            base_tile_id: render.base_tile_id,
            tile_id_span: if render.tile_id_span == 0 { defaults.tile_id_span } else { render.tile_id_span },
            fallback: self.handshake.fallback,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
