//! Stream framing for channel messages.
//!
//! ```text
//! frame_length:    varint   (bytes that follow)
//! channel_length:  varint
//! channel:         [u8]     (UTF-8)
//! payload:         [u8]     (rest of the frame)
//! ```

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TilecastError;
use crate::wire::{WireMessage, get_string, put_string, put_varint, peek_varint, varint_len};

/// Upper bound on a single frame. A 128×128 tile update is ~16 KiB.
pub const MAX_FRAME_SIZE: usize = 1 << 21;

/// One message on a named channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: Bytes,
}

impl ChannelMessage {
    pub fn new(channel: impl Into<String>, payload: Bytes) -> Self {
        Self {
            channel: channel.into(),
            payload,
        }
    }

    pub fn from_wire<M: WireMessage>(message: &M) -> Self {
        Self::new(M::CHANNEL, message.to_bytes())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ChannelCodec;

impl Decoder for ChannelCodec {
    type Item = ChannelMessage;
    type Error = TilecastError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some((frame_len, prefix)) = peek_varint(&src[..])? else {
            return Ok(None);
        };
        let frame_len = frame_len as usize;
        if frame_len > MAX_FRAME_SIZE {
            return Err(TilecastError::Decode("frame size exceeded"));
        }
        if src.len() < prefix + frame_len {
            src.reserve(prefix + frame_len - src.len());
            return Ok(None);
        }

        src.advance(prefix);
        let mut frame = src.split_to(frame_len);
        let channel = get_string(&mut frame)?;
        Ok(Some(ChannelMessage {
            channel,
            payload: frame.freeze(),
        }))
    }
}

impl Encoder<ChannelMessage> for ChannelCodec {
    type Error = TilecastError;

    fn encode(&mut self, item: ChannelMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let channel_len = item.channel.len();
        let frame_len = varint_len(channel_len as u32) + channel_len + item.payload.len();
        if frame_len > MAX_FRAME_SIZE {
            return Err(TilecastError::Decode("frame size exceeded"));
        }

        dst.reserve(varint_len(frame_len as u32) + frame_len);
        put_varint(dst, frame_len as u32);
        put_string(dst, &item.channel);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}
