//! Tile geometry.
//!
//! Partitions a `width × height` raster into a grid of tiles no larger
//! than `tile_edge × tile_edge` (128 for map surfaces). Tiles are indexed
//! row-major: the outer loop walks rows, the inner loop walks columns.
//!
//! ```text
//!   margin_x ─┐
//!   ┌────────┬┴───────┬────────┐
//!   │ (0,0)  │ (1,0)  │ (2,0)  │  ◄── only the first row/column carry
//!   ├────────┼────────┼────────┤      a leading margin; the last tile
//!   │ (0,1)  │ (1,1)  │ (2,1)  │      of an axis absorbs the rest
//!   └────────┴────────┴────────┘
//! ```
//!
//! A tile's `origin_x/origin_y` is where its pixels start inside the
//! receiver's surface; `source_x/source_y` is where they start in the
//! full frame.

use serde::{Deserialize, Serialize};

use crate::error::TilecastError;

/// Edge length of a map surface in pixels.
pub const TILE_EDGE: u32 = 128;

// ── MarginPolicy ─────────────────────────────────────────────────

/// Where the unused part of a non-multiple axis goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarginPolicy {
    /// Half the margin on the leading tile, the other half left empty on
    /// the trailing tile. Recentres the image on the surface wall.
    #[default]
    Centered,
    /// The whole margin on the leading tile; every other tile is full.
    Leading,
}

/// Grid construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridConfig {
    pub tile_edge: u32,
    pub margin_policy: MarginPolicy,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            tile_edge: TILE_EDGE,
            margin_policy: MarginPolicy::default(),
        }
    }
}

// ── Tile ─────────────────────────────────────────────────────────

/// Immutable geometry of one grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tile {
    pub column: u32,
    pub row: u32,
    /// Left edge of the patch on the receiver surface.
    pub origin_x: u32,
    /// Top edge of the patch on the receiver surface.
    pub origin_y: u32,
    pub width: u32,
    pub height: u32,
    pub margin_x: u32,
    pub margin_y: u32,
    /// Left edge of the tile in the source frame.
    pub source_x: u32,
    /// Top edge of the tile in the source frame.
    pub source_y: u32,
    /// `width * height`.
    pub byte_length: usize,
}

// ── GridSpec ─────────────────────────────────────────────────────

/// The computed layout of a grid, without any pixel storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridSpec {
    width: u32,
    height: u32,
    tile_edge: u32,
    columns: u32,
    rows: u32,
    tiles: Vec<Tile>,
}

/// One span along an axis: `(leading margin, extent)`.
type AxisSpan = (u32, u32);

fn split_axis(length: u32, edge: u32, policy: MarginPolicy) -> Vec<AxisSpan> {
    let count = length.div_ceil(edge);
    if count == 1 {
        return vec![(0, length)];
    }

    let remainder = length % edge;
    let margin = if remainder == 0 { 0 } else { edge - remainder };
    let (lead, trail) = match policy {
        MarginPolicy::Centered => (margin / 2, margin - margin / 2),
        MarginPolicy::Leading => (margin, 0),
    };

    let last = count as usize - 1;
    (0..count as usize)
        .map(|i| match i {
            0 => (lead, edge - lead),
            i if i == last => (0, edge - trail),
            _ => (0, edge),
        })
        .collect()
}

/// Compute the grid for a `width × height` frame.
///
/// Fails with [`TilecastError::InvalidDimensions`] when either side is
/// odd or zero, and with [`TilecastError::InvalidTileEdge`] for a zero
/// edge.
pub fn compute_grid(width: u32, height: u32, config: GridConfig) -> Result<GridSpec, TilecastError> {
    if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
        return Err(TilecastError::InvalidDimensions { width, height });
    }
    if config.tile_edge == 0 {
        return Err(TilecastError::InvalidTileEdge(config.tile_edge));
    }

    let xs = split_axis(width, config.tile_edge, config.margin_policy);
    let ys = split_axis(height, config.tile_edge, config.margin_policy);

    let mut tiles = Vec::with_capacity(xs.len() * ys.len());
    let mut source_y = 0;
    for (row, &(margin_y, tile_height)) in ys.iter().enumerate() {
        let mut source_x = 0;
        for (column, &(margin_x, tile_width)) in xs.iter().enumerate() {
            tiles.push(Tile {
                column: column as u32,
                row: row as u32,
                origin_x: margin_x,
                origin_y: margin_y,
                width: tile_width,
                height: tile_height,
                margin_x,
                margin_y,
                source_x,
                source_y,
                byte_length: tile_width as usize * tile_height as usize,
            });
            source_x += tile_width;
        }
        source_y += tile_height;
    }

    Ok(GridSpec {
        width,
        height,
        tile_edge: config.tile_edge,
        columns: xs.len() as u32,
        rows: ys.len() as u32,
        tiles,
    })
}

impl GridSpec {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn tile_edge(&self) -> u32 {
        self.tile_edge
    }

    pub fn columns(&self) -> u32 {
        self.columns
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    /// Tiles in traversal (row-major) order.
    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Linear index of the tile at `(column, row)`.
    pub fn index_of(&self, column: u32, row: u32) -> Option<usize> {
        if column >= self.columns || row >= self.rows {
            return None;
        }
        Some(row as usize * self.columns as usize + column as usize)
    }

    pub fn tile(&self, column: u32, row: u32) -> Option<&Tile> {
        self.index_of(column, row).map(|i| &self.tiles[i])
    }

    /// Sum of all tile byte lengths; equals `width * height`.
    pub fn total_bytes(&self) -> usize {
        self.tiles.iter().map(|t| t.byte_length).sum()
    }

    /// Margins of the leading tile, as advertised to receivers.
    pub fn leading_margin(&self) -> (u32, u32) {
        self.tiles
            .first()
            .map(|t| (t.margin_x, t.margin_y))
            .unwrap_or((0, 0))
    }
}

// ── TileBuffer / TileGrid ────────────────────────────────────────

/// A tile plus its reusable pixel buffer.
#[derive(Debug, Clone)]
pub struct TileBuffer {
    tile: Tile,
    data: Vec<u8>,
    initialized: bool,
}

impl TileBuffer {
    fn new(tile: Tile) -> Self {
        Self {
            tile,
            data: vec![0; tile.byte_length],
            initialized: false,
        }
    }

    pub fn tile(&self) -> &Tile {
        &self.tile
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Whether the buffer has been filled at least once.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub(crate) fn mark_initialized(&mut self) {
        self.initialized = true;
    }
}

/// A grid of tile buffers, allocated once and refilled every frame.
#[derive(Debug, Clone)]
pub struct TileGrid {
    spec: GridSpec,
    buffers: Vec<TileBuffer>,
}

impl TileGrid {
    pub fn new(spec: GridSpec) -> Self {
        let buffers = spec.tiles().iter().copied().map(TileBuffer::new).collect();
        Self { spec, buffers }
    }

    /// Compute the geometry and allocate the buffers in one step.
    pub fn for_frame(width: u32, height: u32, config: GridConfig) -> Result<Self, TilecastError> {
        compute_grid(width, height, config).map(Self::new)
    }

    pub fn spec(&self) -> &GridSpec {
        &self.spec
    }

    pub fn buffers(&self) -> &[TileBuffer] {
        &self.buffers
    }

    pub(crate) fn buffers_mut(&mut self) -> &mut [TileBuffer] {
        &mut self.buffers
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn get(&self, column: u32, row: u32) -> Option<&TileBuffer> {
        self.spec.index_of(column, row).map(|i| &self.buffers[i])
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(w: u32, h: u32, policy: MarginPolicy) -> GridSpec {
        compute_grid(
            w,
            h,
            GridConfig {
                tile_edge: TILE_EDGE,
                margin_policy: policy,
            },
        )
        .unwrap()
    }

    /// Rows sum to the width, columns to the height, and tiles neither
    /// overlap nor leave gaps in the source frame.
    fn assert_exact_cover(spec: &GridSpec) {
        let (w, h) = (spec.width(), spec.height());
        for row in 0..spec.rows() {
            let mut x = 0;
            for column in 0..spec.columns() {
                let t = spec.tile(column, row).unwrap();
                assert_eq!(t.source_x, x, "gap/overlap at ({column},{row}) in {w}x{h}");
                assert!(t.width <= spec.tile_edge() && t.height <= spec.tile_edge());
                assert!(t.origin_x + t.width <= spec.tile_edge());
                assert!(t.origin_y + t.height <= spec.tile_edge());
                x += t.width;
            }
            assert_eq!(x, w, "row {row} of {w}x{h}");
        }
        for column in 0..spec.columns() {
            let mut y = 0;
            for row in 0..spec.rows() {
                let t = spec.tile(column, row).unwrap();
                assert_eq!(t.source_y, y);
                y += t.height;
            }
            assert_eq!(y, h, "column {column} of {w}x{h}");
        }
        assert_eq!(spec.total_bytes(), w as usize * h as usize);
        assert_eq!(spec.tile_count(), (spec.columns() * spec.rows()) as usize);
    }

    #[test]
    fn exact_cover_for_even_dimensions() {
        let sizes = (2..=4096).step_by(62).chain([128, 130, 254, 256, 258, 4094, 4096]);
        for w in sizes {
            for h in [2, 126, 128, 130, 720, 1080, 2000, 4096] {
                assert_exact_cover(&grid(w, h, MarginPolicy::Centered));
                assert_exact_cover(&grid(w, h, MarginPolicy::Leading));
            }
        }
    }

    #[test]
    fn odd_dimensions_rejected() {
        assert!(matches!(
            compute_grid(131, 128, GridConfig::default()),
            Err(TilecastError::InvalidDimensions { width: 131, height: 128 })
        ));
        assert!(compute_grid(128, 127, GridConfig::default()).is_err());
        assert!(compute_grid(0, 128, GridConfig::default()).is_err());
        assert!(compute_grid(130, 128, GridConfig::default()).is_ok());
    }

    #[test]
    fn zero_tile_edge_rejected() {
        let config = GridConfig {
            tile_edge: 0,
            ..Default::default()
        };
        assert!(matches!(
            compute_grid(128, 128, config),
            Err(TilecastError::InvalidTileEdge(0))
        ));
    }

    #[test]
    fn small_frame_is_single_tile_without_margin() {
        let spec = grid(100, 60, MarginPolicy::Centered);
        assert_eq!(spec.tile_count(), 1);
        let t = spec.tiles()[0];
        assert_eq!((t.width, t.height), (100, 60));
        assert_eq!((t.margin_x, t.margin_y), (0, 0));
    }

    #[test]
    fn centered_margin_is_split() {
        // 130 = 2 columns, 126 px of margin → 63 leading, 63 trailing.
        let spec = grid(130, 128, MarginPolicy::Centered);
        assert_eq!((spec.columns(), spec.rows()), (2, 1));
        let first = spec.tile(0, 0).unwrap();
        let last = spec.tile(1, 0).unwrap();
        assert_eq!((first.margin_x, first.origin_x, first.width), (63, 63, 65));
        assert_eq!((last.margin_x, last.origin_x, last.width), (0, 0, 65));
        assert_eq!(spec.leading_margin(), (63, 0));
    }

    #[test]
    fn leading_margin_goes_to_first_tile() {
        let spec = grid(130, 128, MarginPolicy::Leading);
        let first = spec.tile(0, 0).unwrap();
        let last = spec.tile(1, 0).unwrap();
        assert_eq!((first.margin_x, first.width), (126, 2));
        assert_eq!((last.margin_x, last.width), (0, 128));
    }

    #[test]
    fn only_first_row_and_column_have_margins() {
        let spec = grid(1000, 600, MarginPolicy::Centered);
        for t in spec.tiles() {
            if t.column > 0 {
                assert_eq!(t.margin_x, 0);
            }
            if t.row > 0 {
                assert_eq!(t.margin_y, 0);
            }
        }
    }

    #[test]
    fn traversal_is_row_major() {
        let spec = grid(400, 300, MarginPolicy::Centered);
        assert_eq!((spec.columns(), spec.rows()), (4, 3));
        let order: Vec<(u32, u32)> = spec.tiles().iter().map(|t| (t.column, t.row)).collect();
        assert_eq!(&order[..5], &[(0, 0), (1, 0), (2, 0), (3, 0), (0, 1)]);
        assert_eq!(spec.index_of(1, 2), Some(9));
        assert_eq!(spec.index_of(4, 0), None);
    }

    #[test]
    fn tile_grid_allocates_buffers() {
        let grid = TileGrid::for_frame(256, 130, GridConfig::default()).unwrap();
        assert_eq!(grid.len(), 4);
        for buf in grid.buffers() {
            assert_eq!(buf.data().len(), buf.tile().byte_length);
            assert!(!buf.is_initialized());
        }
    }
}
