//! Frame engines available to the host.
//!
//! Sources are named by a scheme prefix:
//!
//! ```text
//! synthetic:WxH@FPS          endless moving test pattern
//! synthetic:WxH@FPS:FRAMES   test pattern ending after FRAMES frames
//! file:PATH                  raw frame file (see below)
//! ```
//!
//! A raw frame file is a 16-byte header followed by `width × height` byte
//! frames in raster order:
//!
//! ```text
//! magic:   b"TCRW"
//! width:   u32 LE
//! height:  u32 LE
//! fps:     u32 LE
//! ```
//!
//! Frames are produced in raster order and converted to the pre-tiled
//! layout when the consumer asks for it.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, info};

use tilecast_core::error::TilecastError;
use tilecast_core::grid::{GridSpec, compute_grid};
use tilecast_core::source::{ControlMessage, FrameEngine, FrameRead, OpenOptions, SourceHandle, VideoInfo};
use tilecast_core::tiler::{FrameLayout, pretile_into};

pub const RAW_MAGIC: &[u8; 4] = b"TCRW";
pub const RAW_HEADER_LEN: u64 = 16;

// ── Identifiers ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    Synthetic { info: VideoInfo, frames: Option<u64> },
    File(PathBuf),
}

impl SourceSpec {
    pub fn parse(identifier: &str) -> Result<Self, TilecastError> {
        if let Some(rest) = identifier.strip_prefix("synthetic:") {
            return parse_synthetic(rest)
                .ok_or_else(|| TilecastError::FrameSource(format!("bad synthetic source: {identifier}")));
        }
        if let Some(path) = identifier.strip_prefix("file:") {
            if path.is_empty() {
                return Err(TilecastError::FrameSource("empty file path".into()));
            }
            return Ok(SourceSpec::File(PathBuf::from(path)));
        }
        Err(TilecastError::FrameSource(format!("unknown source scheme: {identifier}")))
    }
}

fn parse_synthetic(rest: &str) -> Option<SourceSpec> {
    let (size, timing) = rest.split_once('@')?;
    let (width, height) = size.split_once('x')?;
    let (fps, frames) = match timing.split_once(':') {
        Some((fps, frames)) => (fps, Some(frames.parse().ok()?)),
        None => (timing, None),
    };
    Some(SourceSpec::Synthetic {
        info: VideoInfo {
            width: width.parse().ok()?,
            height: height.parse().ok()?,
            fps: fps.parse().ok()?,
        },
        frames,
    })
}

// ── Raw file format ──────────────────────────────────────────────

/// Write a raw frame file. Every frame must be `width × height` bytes.
pub fn write_raw(out: &mut impl Write, info: VideoInfo, frames: &[Vec<u8>]) -> Result<(), TilecastError> {
    let frame_len = info.width as usize * info.height as usize;
    let mut header = BytesMut::with_capacity(RAW_HEADER_LEN as usize);
    header.put_slice(RAW_MAGIC);
    header.put_u32_le(info.width);
    header.put_u32_le(info.height);
    header.put_u32_le(info.fps);
    out.write_all(&header)?;
    for frame in frames {
        if frame.len() != frame_len {
            return Err(TilecastError::SizeMismatch {
                expected: frame_len,
                actual: frame.len(),
            });
        }
        out.write_all(frame)?;
    }
    Ok(())
}

fn read_raw_header(reader: &mut impl Read) -> Result<VideoInfo, TilecastError> {
    let mut raw = [0u8; RAW_HEADER_LEN as usize];
    reader.read_exact(&mut raw)?;
    let mut header = &raw[..];
    if &header[..4] != RAW_MAGIC {
        return Err(TilecastError::FrameSource("not a raw frame file".into()));
    }
    header.advance(4);
    Ok(VideoInfo {
        width: header.get_u32_le(),
        height: header.get_u32_le(),
        fps: header.get_u32_le(),
    })
}

// ── Streams ──────────────────────────────────────────────────────

enum Producer {
    Synthetic { frames: Option<u64> },
    File { reader: BufReader<File>, path: PathBuf },
}

struct Stream {
    info: VideoInfo,
    producer: Producer,
    /// Target grid when the consumer wants pre-tiled frames.
    pretile: Option<GridSpec>,
    position: u64,
    raster: Vec<u8>,
    streaming: bool,
}

impl Stream {
    fn frame_len(&self) -> usize {
        self.info.width as usize * self.info.height as usize
    }

    /// Fill `self.raster` with the next raster frame.
    fn produce(&mut self) -> Result<FrameRead, TilecastError> {
        let frame_len = self.frame_len();
        match &mut self.producer {
            Producer::Synthetic { frames } => {
                if frames.is_some_and(|n| self.position >= n) {
                    return Ok(FrameRead::EndOfStream);
                }
                test_pattern(self.info, self.position, &mut self.raster);
            }
            Producer::File { reader, .. } => {
                self.raster.resize(frame_len, 0);
                match reader.read_exact(&mut self.raster) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(FrameRead::EndOfStream),
                    Err(e) => return Err(TilecastError::FrameSource(e.to_string())),
                }
            }
        }
        self.position += 1;
        Ok(FrameRead::Frame)
    }

    fn seek(&mut self, second: u32) -> Result<(), TilecastError> {
        let frame = u64::from(second) * u64::from(self.info.fps);
        let frame_len = self.frame_len() as u64;
        if let Producer::File { reader, .. } = &mut self.producer {
            let offset = frame
                .checked_mul(frame_len)
                .and_then(|bytes| bytes.checked_add(RAW_HEADER_LEN))
                .ok_or_else(|| TilecastError::FrameSource(format!("seek to {second}s is out of range")))?;
            reader.seek(SeekFrom::Start(offset))?;
        }
        self.position = frame;
        Ok(())
    }

    fn describe(&self) -> String {
        match &self.producer {
            Producer::Synthetic { .. } => "synthetic".into(),
            Producer::File { path, .. } => path.display().to_string(),
        }
    }
}

/// Diagonal bands that drift one pixel per frame.
fn test_pattern(info: VideoInfo, frame: u64, out: &mut Vec<u8>) {
    out.clear();
    let shift = frame as u32;
    for y in 0..info.height {
        for x in 0..info.width {
            let band = (x.wrapping_add(y).wrapping_add(shift) / 16) % 56;
            out.push(4 + band as u8);
        }
    }
}

// ── HostEngine ───────────────────────────────────────────────────

/// [`FrameEngine`] over synthetic and raw-file sources.
#[derive(Default)]
pub struct HostEngine {
    streams: Mutex<HashMap<u64, Arc<Mutex<Stream>>>>,
    next_id: AtomicU64,
}

impl HostEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&self, handle: &SourceHandle) -> Result<Arc<Mutex<Stream>>, TilecastError> {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&handle.raw())
            .cloned()
            .ok_or(TilecastError::UseAfterKill)
    }
}

fn lock(stream: &Mutex<Stream>) -> std::sync::MutexGuard<'_, Stream> {
    stream.lock().unwrap_or_else(|e| e.into_inner())
}

impl FrameEngine for HostEngine {
    fn open(&self, identifier: &str, options: &OpenOptions) -> Result<SourceHandle, TilecastError> {
        let (info, producer) = match SourceSpec::parse(identifier)? {
            SourceSpec::Synthetic { info, frames } => (info, Producer::Synthetic { frames }),
            SourceSpec::File(path) => {
                let mut reader = BufReader::new(File::open(&path)?);
                let info = read_raw_header(&mut reader)?;
                (info, Producer::File { reader, path })
            }
        };

        // Odd sizes still open; the session rejects them when it builds
        // its grid.
        let pretile = match options.layout {
            FrameLayout::PreTiled => compute_grid(info.width, info.height, options.grid).ok(),
            FrameLayout::Raster => None,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stream = Stream {
            info,
            producer,
            pretile,
            position: 0,
            raster: Vec::new(),
            streaming: false,
        };
        info!(stream = id, source = %stream.describe(), width = info.width, height = info.height, fps = info.fps, "source opened");
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(Mutex::new(stream)));
        Ok(SourceHandle::new(id))
    }

    fn next_frame(&self, handle: &SourceHandle, buf: &mut Vec<u8>) -> Result<FrameRead, TilecastError> {
        let stream = self.stream(handle)?;
        let mut stream = lock(&stream);
        if stream.produce()? == FrameRead::EndOfStream {
            return Ok(FrameRead::EndOfStream);
        }

        let stream = &mut *stream;
        match &stream.pretile {
            Some(spec) => pretile_into(spec, &stream.raster, buf)?,
            None => {
                buf.clear();
                buf.extend_from_slice(&stream.raster);
            }
        }
        Ok(FrameRead::Frame)
    }

    fn info(&self, handle: &SourceHandle) -> Result<VideoInfo, TilecastError> {
        let stream = self.stream(handle)?;
        Ok(lock(&stream).info)
    }

    fn control(&self, handle: &SourceHandle, message: ControlMessage) -> Result<(), TilecastError> {
        let stream = self.stream(handle)?;
        let mut stream = lock(&stream);
        match message {
            ControlMessage::Start { fps } => {
                stream.streaming = true;
                info!(stream = handle.raw(), fps, "out-of-band streaming started");
            }
            ControlMessage::Stop => {
                if stream.streaming {
                    info!(stream = handle.raw(), "out-of-band streaming stopped");
                }
                stream.streaming = false;
            }
            ControlMessage::Seek { second } => {
                stream.seek(second)?;
                debug!(stream = handle.raw(), second, "seek");
            }
            ControlMessage::Input(bytes) => {
                debug!(stream = handle.raw(), len = bytes.len(), "input ignored");
            }
        }
        Ok(())
    }

    fn close(&self, handle: SourceHandle) -> Result<(), TilecastError> {
        let removed = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.raw());
        match removed {
            Some(_) => {
                debug!(stream = handle.raw(), "source closed");
                Ok(())
            }
            None => Err(TilecastError::UseAfterKill),
        }
    }
}

/// Write `frames` to a new raw file at `path`.
pub fn create_raw_file(path: &Path, info: VideoInfo, frames: &[Vec<u8>]) -> Result<(), TilecastError> {
    let mut file = File::create(path)?;
    write_raw(&mut file, info, frames)?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilecast_core::grid::GridConfig;
    use tilecast_core::tiler::pretile;

    fn raster_options() -> OpenOptions {
        OpenOptions {
            layout: FrameLayout::Raster,
            grid: GridConfig::default(),
        }
    }

    #[test]
    fn parses_identifiers() {
        assert_eq!(
            SourceSpec::parse("synthetic:256x130@25").unwrap(),
            SourceSpec::Synthetic {
                info: VideoInfo { width: 256, height: 130, fps: 25 },
                frames: None,
            }
        );
        assert_eq!(
            SourceSpec::parse("synthetic:4x2@1:3").unwrap(),
            SourceSpec::Synthetic {
                info: VideoInfo { width: 4, height: 2, fps: 1 },
                frames: Some(3),
            }
        );
        assert_eq!(
            SourceSpec::parse("file:/tmp/a.raw").unwrap(),
            SourceSpec::File(PathBuf::from("/tmp/a.raw"))
        );
        assert!(SourceSpec::parse("synthetic:4x@1").is_err());
        assert!(SourceSpec::parse("rtsp://cam").is_err());
    }

    #[test]
    fn synthetic_ends_after_frame_count() {
        let engine = HostEngine::new();
        let handle = engine.open("synthetic:4x2@10:2", &raster_options()).unwrap();
        let mut buf = Vec::new();
        assert_eq!(engine.next_frame(&handle, &mut buf).unwrap(), FrameRead::Frame);
        assert_eq!(buf.len(), 8);
        assert_eq!(engine.next_frame(&handle, &mut buf).unwrap(), FrameRead::Frame);
        assert_eq!(engine.next_frame(&handle, &mut buf).unwrap(), FrameRead::EndOfStream);
        engine.close(handle).unwrap();
    }

    #[test]
    fn pretiled_output_matches_pretile() {
        let engine = HostEngine::new();
        let handle = engine.open("synthetic:256x130@10", &OpenOptions::default()).unwrap();
        let raster_handle = engine.open("synthetic:256x130@10", &raster_options()).unwrap();

        let mut tiled = Vec::new();
        let mut raster = Vec::new();
        engine.next_frame(&handle, &mut tiled).unwrap();
        engine.next_frame(&raster_handle, &mut raster).unwrap();

        let spec = compute_grid(256, 130, GridConfig::default()).unwrap();
        assert_eq!(tiled, pretile(&spec, &raster).unwrap());
    }

    #[test]
    fn raw_file_round_trip_and_seek() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("tilecast-engine-{}.raw", std::process::id()));
        let info = VideoInfo { width: 2, height: 2, fps: 2 };
        let frames: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i; 4]).collect();
        create_raw_file(&path, info, &frames).unwrap();

        let engine = HostEngine::new();
        let identifier = format!("file:{}", path.display());
        let handle = engine.open(&identifier, &raster_options()).unwrap();
        assert_eq!(engine.info(&handle).unwrap(), info);

        let mut buf = Vec::new();
        engine.next_frame(&handle, &mut buf).unwrap();
        assert_eq!(buf, vec![0; 4]);
        engine.control(&handle, ControlMessage::Seek { second: 2 }).unwrap();
        engine.next_frame(&handle, &mut buf).unwrap();
        assert_eq!(buf, vec![4; 4]);
        engine.next_frame(&handle, &mut buf).unwrap();
        assert_eq!(engine.next_frame(&handle, &mut buf).unwrap(), FrameRead::EndOfStream);

        engine.close(handle).unwrap();
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn seek_beyond_addressable_range_fails() {
        let path = std::env::temp_dir().join(format!("tilecast-engine-seek-{}.raw", std::process::id()));
        let info = VideoInfo { width: 2, height: 2, fps: u32::MAX };
        create_raw_file(&path, info, &[vec![1; 4]]).unwrap();

        let engine = HostEngine::new();
        let handle = engine.open(&format!("file:{}", path.display()), &raster_options()).unwrap();
        assert!(matches!(
            engine.control(&handle, ControlMessage::Seek { second: u32::MAX }),
            Err(TilecastError::FrameSource(_))
        ));

        // The stream is still usable from where it was.
        let mut buf = Vec::new();
        assert_eq!(engine.next_frame(&handle, &mut buf).unwrap(), FrameRead::Frame);
        assert_eq!(buf, vec![1; 4]);

        engine.close(handle).unwrap();
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn bad_magic_rejected() {
        let mut raw = b"NOPE".to_vec();
        raw.extend_from_slice(&[0u8; 12]);
        assert!(matches!(
            read_raw_header(&mut &raw[..]),
            Err(TilecastError::FrameSource(_))
        ));
    }

    #[test]
    fn closed_handle_is_rejected() {
        let engine = HostEngine::new();
        let handle = engine.open("synthetic:2x2@1", &raster_options()).unwrap();
        let raw = handle.raw();
        engine.close(handle).unwrap();
        assert!(matches!(
            engine.info(&SourceHandle::new(raw)),
            Err(TilecastError::UseAfterKill)
        ));
    }
}
