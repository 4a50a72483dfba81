//! Frame-source interface.
//!
//! A [`FrameEngine`] is the decode/production backend. It hands out
//! [`SourceHandle`]s, one per open stream, and fills caller-owned buffers
//! with raw frames on demand. Handles are not `Clone`: [`FrameEngine::close`]
//! consumes the handle, so a stream cannot be released twice.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::TilecastError;
use crate::grid::GridConfig;
use crate::tiler::FrameLayout;

// ── Handle / metadata ────────────────────────────────────────────

/// An open stream inside a [`FrameEngine`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SourceHandle(u64);

impl SourceHandle {
    /// Wrap an engine-specific id. Only engines should create handles.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Stream properties, fixed for the lifetime of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// What the consumer expects frames to look like.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    pub layout: FrameLayout,
    pub grid: GridConfig,
}

/// Result of a frame read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRead {
    /// The buffer now holds a complete frame.
    Frame,
    EndOfStream,
}

/// Opaque control forwarded to the producer. The core never interprets
/// these beyond routing them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Begin pushing frames out-of-band at `fps`.
    Start { fps: u32 },
    /// Stop pushing frames out-of-band.
    Stop,
    Seek { second: u32 },
    /// Producer-specific input, e.g. accumulated key presses.
    Input(Vec<u8>),
}

// ── FrameEngine ──────────────────────────────────────────────────

pub trait FrameEngine: Send + Sync {
    fn open(&self, identifier: &str, options: &OpenOptions) -> Result<SourceHandle, TilecastError>;

    /// Overwrite `buf` with the next frame.
    fn next_frame(&self, handle: &SourceHandle, buf: &mut Vec<u8>) -> Result<FrameRead, TilecastError>;

    fn info(&self, handle: &SourceHandle) -> Result<VideoInfo, TilecastError>;

    fn control(&self, handle: &SourceHandle, message: ControlMessage) -> Result<(), TilecastError>;

    fn close(&self, handle: SourceHandle) -> Result<(), TilecastError>;
}

// ── MemoryEngine ─────────────────────────────────────────────────

/// Serves frames that were registered up front, keyed by identifier.
///
/// Every call is recorded so callers can verify how a stream was driven.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    clips: Mutex<HashMap<String, Clip>>,
    streams: Mutex<HashMap<u64, Stream>>,
    journal: Mutex<Vec<EngineCall>>,
    next_id: AtomicU64,
}

#[derive(Debug, Clone)]
struct Clip {
    info: VideoInfo,
    frames: Vec<Vec<u8>>,
    looping: bool,
}

#[derive(Debug)]
struct Stream {
    clip: Clip,
    queue: VecDeque<usize>,
}

/// One recorded engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Open(String),
    NextFrame(u64),
    Control(u64, ControlMessage),
    Close(u64),
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a clip that ends after its last frame.
    pub fn insert(&self, identifier: impl Into<String>, info: VideoInfo, frames: Vec<Vec<u8>>) {
        self.insert_clip(identifier.into(), info, frames, false);
    }

    /// Register a clip that repeats forever.
    pub fn insert_looping(&self, identifier: impl Into<String>, info: VideoInfo, frames: Vec<Vec<u8>>) {
        self.insert_clip(identifier.into(), info, frames, true);
    }

    fn insert_clip(&self, identifier: String, info: VideoInfo, frames: Vec<Vec<u8>>, looping: bool) {
        lock(&self.clips).insert(identifier, Clip { info, frames, looping });
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        lock(&self.journal).clone()
    }

    pub fn count(&self, pred: impl Fn(&EngineCall) -> bool) -> usize {
        lock(&self.journal).iter().filter(|c| pred(*c)).count()
    }

    /// Streams that are still open.
    pub fn open_streams(&self) -> usize {
        lock(&self.streams).len()
    }

    fn record(&self, call: EngineCall) {
        lock(&self.journal).push(call);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl FrameEngine for MemoryEngine {
    fn open(&self, identifier: &str, _options: &OpenOptions) -> Result<SourceHandle, TilecastError> {
        self.record(EngineCall::Open(identifier.to_string()));
        let clip = lock(&self.clips)
            .get(identifier)
            .cloned()
            .ok_or_else(|| TilecastError::FrameSource(format!("no such clip: {identifier}")))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = (0..clip.frames.len()).collect();
        lock(&self.streams).insert(id, Stream { clip, queue });
        Ok(SourceHandle::new(id))
    }

    fn next_frame(&self, handle: &SourceHandle, buf: &mut Vec<u8>) -> Result<FrameRead, TilecastError> {
        self.record(EngineCall::NextFrame(handle.raw()));
        let mut streams = lock(&self.streams);
        let stream = streams.get_mut(&handle.raw()).ok_or(TilecastError::UseAfterKill)?;

        if stream.queue.is_empty() && stream.clip.looping {
            stream.queue.extend(0..stream.clip.frames.len());
        }
        match stream.queue.pop_front() {
            Some(index) => {
                buf.clear();
                buf.extend_from_slice(&stream.clip.frames[index]);
                Ok(FrameRead::Frame)
            }
            None => Ok(FrameRead::EndOfStream),
        }
    }

    fn info(&self, handle: &SourceHandle) -> Result<VideoInfo, TilecastError> {
        lock(&self.streams)
            .get(&handle.raw())
            .map(|s| s.clip.info)
            .ok_or(TilecastError::UseAfterKill)
    }

    fn control(&self, handle: &SourceHandle, message: ControlMessage) -> Result<(), TilecastError> {
        self.record(EngineCall::Control(handle.raw(), message.clone()));
        let mut streams = lock(&self.streams);
        let stream = streams.get_mut(&handle.raw()).ok_or(TilecastError::UseAfterKill)?;

        if let ControlMessage::Seek { second } = message {
            let skip = (second as usize * stream.clip.info.fps as usize).min(stream.clip.frames.len());
            stream.queue = (skip..stream.clip.frames.len()).collect();
        }
        Ok(())
    }

    fn close(&self, handle: SourceHandle) -> Result<(), TilecastError> {
        self.record(EngineCall::Close(handle.raw()));
        lock(&self.streams)
            .remove(&handle.raw())
            .map(|_| ())
            .ok_or(TilecastError::UseAfterKill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> VideoInfo {
        VideoInfo {
            width: 2,
            height: 2,
            fps: 2,
        }
    }

    #[test]
    fn serves_frames_then_end_of_stream() {
        let engine = MemoryEngine::new();
        engine.insert("clip", info(), vec![vec![1; 4], vec![2; 4]]);
        let handle = engine.open("clip", &OpenOptions::default()).unwrap();

        let mut buf = Vec::new();
        assert_eq!(engine.next_frame(&handle, &mut buf).unwrap(), FrameRead::Frame);
        assert_eq!(buf, vec![1; 4]);
        assert_eq!(engine.next_frame(&handle, &mut buf).unwrap(), FrameRead::Frame);
        assert_eq!(engine.next_frame(&handle, &mut buf).unwrap(), FrameRead::EndOfStream);

        engine.close(handle).unwrap();
        assert_eq!(engine.open_streams(), 0);
    }

    #[test]
    fn seek_skips_frames() {
        let engine = MemoryEngine::new();
        let frames = (0..6u8).map(|i| vec![i; 4]).collect();
        engine.insert("clip", info(), frames);
        let handle = engine.open("clip", &OpenOptions::default()).unwrap();

        engine.control(&handle, ControlMessage::Seek { second: 2 }).unwrap();
        let mut buf = Vec::new();
        engine.next_frame(&handle, &mut buf).unwrap();
        assert_eq!(buf, vec![4; 4]);
    }

    #[test]
    fn unknown_clip_fails_to_open() {
        let engine = MemoryEngine::new();
        assert!(matches!(
            engine.open("missing", &OpenOptions::default()),
            Err(TilecastError::FrameSource(_))
        ));
    }
}
