//! Receiver-facing message bodies.
//!
//! Integers are variable-length: 7 bits per byte, least significant group
//! first, high bit set on every byte except the last. Strings are a
//! varint byte length followed by UTF-8.
//!
//! ## Channels
//!
//! | Channel                    | Host → receiver           | Receiver → host |
//! |----------------------------|---------------------------|-----------------|
//! | `tilecast:acknowledgement` | [`Acknowledgement`]       | [`StatusReply`] |
//! | `tilecast:handshake`       | [`Handshake`]             | [`StatusReply`] |
//! | `tilecast:tile`            | [`TileUpdate`]            | -               |
//! | `tilecast:notice`          | [`Notice`]                | -               |
//!
//! **Handshake body**:
//! ```text
//! ip:                 string
//! port:               varint
//! tile_margin_x:      varint
//! tile_margin_y:      varint
//! grid_columns:       varint
//! grid_rows:          varint
//! total_byte_length:  varint
//! base_tile_id:       varint
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::TilecastError;
use crate::grid::{GridSpec, Tile};

// ── Constants ────────────────────────────────────────────────────

pub const ACKNOWLEDGEMENT_CHANNEL: &str = "tilecast:acknowledgement";
pub const HANDSHAKE_CHANNEL: &str = "tilecast:handshake";
pub const TILE_CHANNEL: &str = "tilecast:tile";
pub const NOTICE_CHANNEL: &str = "tilecast:notice";

/// Out-of-band protocol version advertised in the acknowledgement.
pub const PROTOCOL_VERSION: u32 = 0;

/// A `u32` never needs more than five 7-bit groups.
pub const MAX_VARINT_LEN: usize = 5;

/// Reply status codes.
pub mod status {
    pub const OK: u32 = 0;
    /// Receiver speaks a newer protocol than the host.
    pub const RECEIVER_NEWER: u32 = 1;
    /// Receiver speaks an older protocol than the host.
    pub const RECEIVER_OLDER: u32 = 2;
}

// ── Varint / String primitives ───────────────────────────────────

pub fn put_varint(buf: &mut impl BufMut, mut value: u32) {
    loop {
        if value & !0x7F == 0 {
            buf.put_u8(value as u8);
            return;
        }
        buf.put_u8((value & 0x7F) as u8 | 0x80);
        value >>= 7;
    }
}

pub fn get_varint(buf: &mut impl Buf) -> Result<u32, TilecastError> {
    let mut value: u32 = 0;
    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(TilecastError::Decode("truncated varint"));
        }
        let byte = buf.get_u8();
        value |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(TilecastError::Decode("varint too long"))
}

/// Parse a varint from the front of `src` without consuming it.
///
/// `Ok(None)` means more bytes are needed. On success returns the value
/// and the number of bytes it occupied.
pub fn peek_varint(src: &[u8]) -> Result<Option<(u32, usize)>, TilecastError> {
    let mut value: u32 = 0;
    for (i, &byte) in src.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if src.len() >= MAX_VARINT_LEN {
        return Err(TilecastError::Decode("varint too long"));
    }
    Ok(None)
}

pub fn varint_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0x0FFF_FFFF => 4,
        _ => 5,
    }
}

pub fn put_string(buf: &mut impl BufMut, value: &str) {
    put_varint(buf, value.len() as u32);
    buf.put_slice(value.as_bytes());
}

pub fn get_string(buf: &mut impl Buf) -> Result<String, TilecastError> {
    let len = get_varint(buf)? as usize;
    if buf.remaining() < len {
        return Err(TilecastError::Decode("truncated string"));
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    Ok(String::from_utf8(raw)?)
}

// ── WireMessage ──────────────────────────────────────────────────

/// A message body with a fixed channel.
pub trait WireMessage: Sized {
    const CHANNEL: &'static str;

    fn encode(&self, buf: &mut BytesMut);

    fn decode(buf: &mut impl Buf) -> Result<Self, TilecastError>;

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    fn from_slice(mut data: &[u8]) -> Result<Self, TilecastError> {
        Self::decode(&mut data)
    }
}

/// Host → receiver: "do you speak this protocol version?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgement {
    pub protocol_version: u32,
}

impl WireMessage for Acknowledgement {
    const CHANNEL: &'static str = ACKNOWLEDGEMENT_CHANNEL;

    fn encode(&self, buf: &mut BytesMut) {
        put_varint(buf, self.protocol_version);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, TilecastError> {
        Ok(Self {
            protocol_version: get_varint(buf)?,
        })
    }
}

/// Host → receiver: where to connect and how the grid is laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub ip: String,
    pub port: u32,
    pub tile_margin_x: u32,
    pub tile_margin_y: u32,
    pub grid_columns: u32,
    pub grid_rows: u32,
    pub total_byte_length: u32,
    pub base_tile_id: u32,
}

impl Handshake {
    pub fn for_grid(spec: &GridSpec, ip: impl Into<String>, port: u16, base_tile_id: u32) -> Self {
        let (tile_margin_x, tile_margin_y) = spec.leading_margin();
        Self {
            ip: ip.into(),
            port: port as u32,
            tile_margin_x,
            tile_margin_y,
            grid_columns: spec.columns(),
            grid_rows: spec.rows(),
            total_byte_length: spec.total_bytes() as u32,
            base_tile_id,
        }
    }
}

impl WireMessage for Handshake {
    const CHANNEL: &'static str = HANDSHAKE_CHANNEL;

    fn encode(&self, buf: &mut BytesMut) {
        put_string(buf, &self.ip);
        put_varint(buf, self.port);
        put_varint(buf, self.tile_margin_x);
        put_varint(buf, self.tile_margin_y);
        put_varint(buf, self.grid_columns);
        put_varint(buf, self.grid_rows);
        put_varint(buf, self.total_byte_length);
        put_varint(buf, self.base_tile_id);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, TilecastError> {
        Ok(Self {
            ip: get_string(buf)?,
            port: get_varint(buf)?,
            tile_margin_x: get_varint(buf)?,
            tile_margin_y: get_varint(buf)?,
            grid_columns: get_varint(buf)?,
            grid_rows: get_varint(buf)?,
            total_byte_length: get_varint(buf)?,
            base_tile_id: get_varint(buf)?,
        })
    }
}

/// Receiver → host reply on either handshake channel.
///
/// The channel is decided by the transport, so this type has none of
/// its own; it is sent back on the channel of the request it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReply {
    pub status: u32,
}

impl StatusReply {
    pub const OK: StatusReply = StatusReply { status: status::OK };

    pub fn is_ok(&self) -> bool {
        self.status == status::OK
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        put_varint(buf, self.status);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MAX_VARINT_LEN);
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn from_slice(mut data: &[u8]) -> Result<Self, TilecastError> {
        Ok(Self {
            status: get_varint(&mut data)?,
        })
    }
}

/// Host → receiver: replace one surface's pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileUpdate {
    pub tile_id: u32,
    pub origin_x: u32,
    pub origin_y: u32,
    pub width: u32,
    pub height: u32,
    /// `width * height` palette indices, row-major.
    pub payload: Bytes,
}

impl WireMessage for TileUpdate {
    const CHANNEL: &'static str = TILE_CHANNEL;

    fn encode(&self, buf: &mut BytesMut) {
        let geometry = [self.origin_x, self.origin_y, self.width, self.height];
        encode_tile_update(buf, self.tile_id, geometry, &self.payload);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, TilecastError> {
        let tile_id = get_varint(buf)?;
        let origin_x = get_varint(buf)?;
        let origin_y = get_varint(buf)?;
        let width = get_varint(buf)?;
        let height = get_varint(buf)?;
        let len = width as usize * height as usize;
        if buf.remaining() != len {
            return Err(TilecastError::Decode("tile payload length mismatch"));
        }
        Ok(Self {
            tile_id,
            origin_x,
            origin_y,
            width,
            height,
            payload: buf.copy_to_bytes(len),
        })
    }
}

impl TileUpdate {
    /// Encode an update for `tile` straight from borrowed pixels.
    pub fn encode_tile(tile_id: u32, tile: &Tile, pixels: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        let geometry = [tile.origin_x, tile.origin_y, tile.width, tile.height];
        encode_tile_update(&mut buf, tile_id, geometry, pixels);
        buf.freeze()
    }
}

fn encode_tile_update(buf: &mut BytesMut, tile_id: u32, geometry: [u32; 4], pixels: &[u8]) {
    buf.reserve(5 * MAX_VARINT_LEN + pixels.len());
    put_varint(buf, tile_id);
    for value in geometry {
        put_varint(buf, value);
    }
    buf.put_slice(pixels);
}

/// Host → receiver: a human-readable line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub text: String,
}

impl WireMessage for Notice {
    const CHANNEL: &'static str = NOTICE_CHANNEL;

    fn encode(&self, buf: &mut BytesMut) {
        put_string(buf, &self.text);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, TilecastError> {
        Ok(Self {
            text: get_string(buf)?,
        })
    }
}
