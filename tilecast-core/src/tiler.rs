//! Frame → tile copying.
//!
//! Two frame layouts are understood:
//!
//! * `PreTiled`: the frame is the concatenation of every tile's pixels in
//!   traversal order, each tile itself row-major. Filling is a single
//!   contiguous pass.
//! * `Raster`: an ordinary `width × height` row-major image. Filling
//!   gathers each tile row with the image stride.
//!
//! [`pretile`] converts a raster into the pre-tiled layout for sources
//! that cannot emit it natively.

use serde::{Deserialize, Serialize};

use crate::error::TilecastError;
use crate::grid::{GridSpec, TileGrid};

/// Byte layout of frames handed to the tiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameLayout {
    #[default]
    PreTiled,
    Raster,
}

/// Copies frames into a [`TileGrid`] according to a [`FrameLayout`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameTiler {
    layout: FrameLayout,
}

impl FrameTiler {
    pub fn new(layout: FrameLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    /// Overwrite every tile buffer from `frame`.
    pub fn fill(&self, grid: &mut TileGrid, frame: &[u8]) -> Result<(), TilecastError> {
        match self.layout {
            FrameLayout::PreTiled => fill_pretiled(grid, frame),
            FrameLayout::Raster => fill_raster(grid, frame),
        }
    }
}

fn check_length(spec: &GridSpec, frame: &[u8]) -> Result<(), TilecastError> {
    let expected = spec.total_bytes();
    if frame.len() != expected {
        return Err(TilecastError::SizeMismatch {
            expected,
            actual: frame.len(),
        });
    }
    Ok(())
}

/// Fill from a pre-tiled frame. The frame is consumed front to back.
pub fn fill_pretiled(grid: &mut TileGrid, frame: &[u8]) -> Result<(), TilecastError> {
    check_length(grid.spec(), frame)?;

    let mut offset = 0;
    for buffer in grid.buffers_mut() {
        let len = buffer.tile().byte_length;
        buffer.data_mut().copy_from_slice(&frame[offset..offset + len]);
        buffer.mark_initialized();
        offset += len;
    }
    Ok(())
}

/// Fill from a row-major raster frame.
pub fn fill_raster(grid: &mut TileGrid, frame: &[u8]) -> Result<(), TilecastError> {
    check_length(grid.spec(), frame)?;

    let stride = grid.spec().width() as usize;
    for buffer in grid.buffers_mut() {
        let tile = *buffer.tile();
        let width = tile.width as usize;
        let data = buffer.data_mut();
        for y in 0..tile.height as usize {
            let src = (tile.source_y as usize + y) * stride + tile.source_x as usize;
            data[y * width..(y + 1) * width].copy_from_slice(&frame[src..src + width]);
        }
        buffer.mark_initialized();
    }
    Ok(())
}

/// Rearrange a raster frame into the pre-tiled layout for `spec`.
pub fn pretile(spec: &GridSpec, raster: &[u8]) -> Result<Vec<u8>, TilecastError> {
    let mut out = Vec::with_capacity(spec.total_bytes());
    pretile_into(spec, raster, &mut out)?;
    Ok(out)
}

/// Like [`pretile`], reusing `out`'s allocation.
pub fn pretile_into(spec: &GridSpec, raster: &[u8], out: &mut Vec<u8>) -> Result<(), TilecastError> {
    check_length(spec, raster)?;

    out.clear();
    let stride = spec.width() as usize;
    for tile in spec.tiles() {
        let width = tile.width as usize;
        for y in 0..tile.height as usize {
            let src = (tile.source_y as usize + y) * stride + tile.source_x as usize;
            out.extend_from_slice(&raster[src..src + width]);
        }
    }
    Ok(())
}
