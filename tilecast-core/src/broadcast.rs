//! Tile fan-out.
//!
//! Every tile of a grid becomes one [`TileUpdate`] addressed by
//! `base_tile_id + index`. Each update is encoded once and the same
//! [`Bytes`] is handed to every receiver.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::grid::{GridSpec, TileGrid};
use crate::hub::{ReceiverHub, ReceiverId};
use crate::wire::{TILE_CHANNEL, TileUpdate, WireMessage};

/// Palette index used to clear surfaces.
pub const BLACKOUT_COLOR: u8 = 119;

/// Delivery counters for one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub delivered: usize,
    pub failed: usize,
}

impl BroadcastStats {
    fn record(&mut self, ok: bool) {
        if ok {
            self.delivered += 1;
        } else {
            self.failed += 1;
        }
    }
}

pub trait Broadcaster: Send {
    /// Called once before the first frame of a session.
    fn init(&mut self, receivers: &[ReceiverId]);

    fn send(&mut self, grid: &TileGrid, receivers: &[ReceiverId]) -> BroadcastStats;

    /// Paint every tile with the blackout colour.
    fn blackout(&mut self, grid: &TileGrid, receivers: &[ReceiverId]) -> BroadcastStats;
}

// ── Message construction ─────────────────────────────────────────

/// One encoded [`TileUpdate`] per tile carrying the tile's current pixels.
/// Pixels are copied once, from the tile buffer into the message.
pub fn encode_frame(grid: &TileGrid, base_tile_id: u32) -> Vec<Bytes> {
    grid.buffers()
        .iter()
        .enumerate()
        .map(|(index, buffer)| {
            TileUpdate::encode_tile(base_tile_id.wrapping_add(index as u32), buffer.tile(), buffer.data())
        })
        .collect()
}

/// Full-surface updates in `color`, one per tile, at zero offset.
pub fn blackout_updates(spec: &GridSpec, base_tile_id: u32, color: u8) -> Vec<TileUpdate> {
    let edge = spec.tile_edge();
    let payload = Bytes::from(vec![color; edge as usize * edge as usize]);
    (0..spec.tile_count())
        .map(|index| TileUpdate {
            tile_id: base_tile_id.wrapping_add(index as u32),
            origin_x: 0,
            origin_y: 0,
            width: edge,
            height: edge,
            payload: payload.clone(),
        })
        .collect()
}

// ── TileBroadcaster ──────────────────────────────────────────────

/// Pushes tile updates through a [`ReceiverHub`].
pub struct TileBroadcaster {
    hub: Arc<dyn ReceiverHub>,
    base_tile_id: u32,
    blackout_color: u8,
    /// Encoded blackout set, built on first use.
    blackout: Option<Vec<Bytes>>,
}

impl TileBroadcaster {
    pub fn new(hub: Arc<dyn ReceiverHub>, base_tile_id: u32) -> Self {
        Self {
            hub,
            base_tile_id,
            blackout_color: BLACKOUT_COLOR,
            blackout: None,
        }
    }

    pub fn with_blackout_color(mut self, color: u8) -> Self {
        self.blackout_color = color;
        self.blackout = None;
        self
    }

    pub fn base_tile_id(&self) -> u32 {
        self.base_tile_id
    }

    fn fan_out(&self, messages: &[Bytes], receivers: &[ReceiverId]) -> BroadcastStats {
        let mut stats = BroadcastStats::default();
        for &receiver in receivers {
            for payload in messages {
                let result = self.hub.send(receiver, TILE_CHANNEL, payload.clone());
                if let Err(e) = &result {
                    debug!(%receiver, error = %e, "tile delivery failed");
                }
                stats.record(result.is_ok());
            }
        }
        stats
    }
}

impl Broadcaster for TileBroadcaster {
    fn init(&mut self, receivers: &[ReceiverId]) {
        debug!(
            base_tile_id = self.base_tile_id,
            receivers = receivers.len(),
            "broadcaster ready"
        );
    }

    fn send(&mut self, grid: &TileGrid, receivers: &[ReceiverId]) -> BroadcastStats {
        let messages = encode_frame(grid, self.base_tile_id);
        let stats = self.fan_out(&messages, receivers);
        trace!(tiles = messages.len(), delivered = stats.delivered, "frame sent");
        stats
    }

    fn blackout(&mut self, grid: &TileGrid, receivers: &[ReceiverId]) -> BroadcastStats {
        let messages = self
            .blackout
            .get_or_insert_with(|| {
                blackout_updates(grid.spec(), self.base_tile_id, self.blackout_color)
                    .iter()
                    .map(TileUpdate::to_bytes)
                    .collect()
            })
            .clone();
        self.fan_out(&messages, receivers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridConfig;
    use crate::hub::MemoryHub;
    use crate::tiler::fill_raster;

    fn grid(w: u32, h: u32) -> TileGrid {
        let mut grid = TileGrid::for_frame(w, h, GridConfig::default()).unwrap();
        let frame: Vec<u8> = (0..w * h).map(|i| (i % 200) as u8).collect();
        fill_raster(&mut grid, &frame).unwrap();
        grid
    }

    #[test]
    fn one_update_per_tile_per_receiver() {
        let hub = Arc::new(MemoryHub::with_receivers(3));
        let mut broadcaster = TileBroadcaster::new(hub.clone(), 1000);
        let grid = grid(300, 200);

        let stats = broadcaster.send(&grid, &hub.receivers());
        assert_eq!(grid.len(), 6);
        assert_eq!(stats.delivered, 18);

        let sent = hub.sent_on(TILE_CHANNEL);
        let ids: Vec<u32> = sent
            .iter()
            .filter(|m| m.receiver == ReceiverId(1))
            .map(|m| TileUpdate::from_slice(&m.payload).unwrap().tile_id)
            .collect();
        assert_eq!(ids, (1000..1006).collect::<Vec<_>>());
    }

    #[test]
    fn update_carries_tile_geometry() {
        let grid = grid(130, 128);
        let updates: Vec<TileUpdate> = encode_frame(&grid, 0)
            .iter()
            .map(|m| TileUpdate::from_slice(m).unwrap())
            .collect();
        assert_eq!(updates.len(), 2);
        assert_eq!((updates[0].origin_x, updates[0].width), (63, 65));
        assert_eq!(&updates[1].payload[..], grid.buffers()[1].data());
    }

    #[test]
    fn frame_encoding_matches_owned_updates() {
        let grid = grid(300, 200);
        let encoded = encode_frame(&grid, 7);
        for (index, (bytes, buffer)) in encoded.iter().zip(grid.buffers()).enumerate() {
            let tile = buffer.tile();
            let owned = TileUpdate {
                tile_id: 7 + index as u32,
                origin_x: tile.origin_x,
                origin_y: tile.origin_y,
                width: tile.width,
                height: tile.height,
                payload: Bytes::copy_from_slice(buffer.data()),
            };
            assert_eq!(bytes, &owned.to_bytes());
        }
    }

    #[test]
    fn blackout_is_uniform_and_idempotent() {
        let grid = grid(300, 200);
        let first = blackout_updates(grid.spec(), 40, BLACKOUT_COLOR);
        let second = blackout_updates(grid.spec(), 40, BLACKOUT_COLOR);
        assert_eq!(first, second);
        for update in &first {
            assert_eq!((update.origin_x, update.origin_y), (0, 0));
            assert_eq!(update.payload.len(), 128 * 128);
            assert!(update.payload.iter().all(|&b| b == BLACKOUT_COLOR));
        }
    }

    #[test]
    fn repeated_blackout_sends_identical_bytes() {
        let hub = Arc::new(MemoryHub::with_receivers(2));
        let mut broadcaster = TileBroadcaster::new(hub.clone(), 500);
        let grid = grid(300, 200);
        let receivers = hub.receivers();

        let first = broadcaster.blackout(&grid, &receivers);
        let second = broadcaster.blackout(&grid, &receivers);
        assert_eq!(first, second);
        assert_eq!(first.delivered, 2 * grid.len());

        let sent = hub.sent_on(TILE_CHANNEL);
        assert_eq!(sent.len(), 2 * 2 * grid.len());
        let (a, b) = sent.split_at(sent.len() / 2);
        for (x, y) in a.iter().zip(b) {
            assert_eq!(x.receiver, y.receiver);
            assert_eq!(x.payload, y.payload);
        }

        let expected = blackout_updates(grid.spec(), 500, BLACKOUT_COLOR);
        let per_receiver: Vec<TileUpdate> = a
            .iter()
            .filter(|m| m.receiver == receivers[0])
            .map(|m| TileUpdate::from_slice(&m.payload).unwrap())
            .collect();
        assert_eq!(per_receiver, expected);
    }

    #[test]
    fn failed_receiver_does_not_stop_fan_out() {
        let hub = Arc::new(MemoryHub::with_receivers(3));
        hub.set_unreachable(ReceiverId(0));
        let mut broadcaster = TileBroadcaster::new(hub.clone(), 0).with_blackout_color(0);
        let grid = grid(128, 128);

        let stats = broadcaster.blackout(&grid, &hub.receivers());
        assert_eq!(stats, BroadcastStats { delivered: 2, failed: 1 });
        let update = TileUpdate::from_slice(&hub.sent()[0].payload).unwrap();
        assert!(update.payload.iter().all(|&b| b == 0));
    }
}
