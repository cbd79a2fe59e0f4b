//! Typed, reference-counted media frames.
//!
//! A [`Frame`] is a byte buffer plus format and timing metadata. Frames
//! are published as `Arc<Frame>` and treated as immutable after the
//! first delivery: one captured frame can fan out to any number of
//! sinks without copying.

use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

// ── FrameFormat ──────────────────────────────────────────────────

/// Media payload format.
///
/// The numeric codes partition into video (100–199) and audio
/// (200–299); the hundreds digit drives [`FrameFormat::is_video`] and
/// [`FrameFormat::is_audio`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum FrameFormat {
    #[default]
    Unknown = 0,

    // Video (100–199)
    I420 = 101,
    Nv12 = 102,
    Rgb24 = 103,
    Bgr24 = 104,
    Rgba32 = 105,
    Bgra32 = 106,
    H264 = 107,
    H265 = 108,
    Vp8 = 109,
    Vp9 = 110,

    // Audio (200–299)
    PcmS16le = 201,
    PcmF32le = 202,
    Aac = 203,
    Mp3 = 204,
    Opus = 205,
    G711Pcmu = 206,
    G711Pcma = 207,
}

impl FrameFormat {
    /// Whether this is a video format (code 100–199).
    pub const fn is_video(self) -> bool {
        (self as i32) / 100 == 1
    }

    /// Whether this is an audio format (code 200–299).
    pub const fn is_audio(self) -> bool {
        (self as i32) / 100 == 2
    }

    /// Bytes per pixel for packed raw video formats.
    ///
    /// Returns `None` for planar, compressed, audio, and unknown
    /// formats, where "bytes per pixel" is not meaningful.
    pub const fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            FrameFormat::Rgb24 | FrameFormat::Bgr24 => Some(3),
            FrameFormat::Rgba32 | FrameFormat::Bgra32 => Some(4),
            _ => None,
        }
    }

    /// Short human-readable name for logs and file extensions.
    pub const fn name(self) -> &'static str {
        match self {
            FrameFormat::Unknown => "UNKNOWN",
            FrameFormat::I420 => "I420",
            FrameFormat::Nv12 => "NV12",
            FrameFormat::Rgb24 => "RGB24",
            FrameFormat::Bgr24 => "BGR24",
            FrameFormat::Rgba32 => "RGBA32",
            FrameFormat::Bgra32 => "BGRA32",
            FrameFormat::H264 => "H264",
            FrameFormat::H265 => "H265",
            FrameFormat::Vp8 => "VP8",
            FrameFormat::Vp9 => "VP9",
            FrameFormat::PcmS16le => "PCM_S16LE",
            FrameFormat::PcmF32le => "PCM_F32LE",
            FrameFormat::Aac => "AAC",
            FrameFormat::Mp3 => "MP3",
            FrameFormat::Opus => "OPUS",
            FrameFormat::G711Pcmu => "G711_PCMU",
            FrameFormat::G711Pcma => "G711_PCMA",
        }
    }
}

// ── Frame metadata ───────────────────────────────────────────────

/// Video-specific frame metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoInfo {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Nominal frames per second of the producing stream.
    pub framerate: u32,
    /// Whether this frame can be decoded without references.
    pub is_keyframe: bool,
    /// Row pitch in bytes. `0` means tightly packed (`width * bpp`);
    /// a larger value indicates GPU row padding.
    pub stride: u32,
}

impl VideoInfo {
    /// Effective row pitch: the explicit stride, or `width * bpp` for
    /// tightly packed layouts.
    pub fn effective_stride(&self, format: FrameFormat) -> usize {
        if self.stride > 0 {
            self.stride as usize
        } else {
            self.width as usize * format.bytes_per_pixel().unwrap_or(1)
        }
    }
}

/// Audio-specific frame metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioInfo {
    pub channels: u8,
    pub sample_rate: u32,
    pub samples_per_frame: u32,
    pub bytes_per_sample: u32,
}

// ── Frame ────────────────────────────────────────────────────────

/// A media frame: payload bytes plus format and timing metadata.
///
/// Construct with [`Frame::video`] / [`Frame::audio`] / [`Frame::empty`],
/// fill the payload, then wrap in an `Arc` and hand to
/// [`FanOut::deliver`](crate::node::FanOut::deliver). After delivery the
/// frame must not be mutated.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    data: Vec<u8>,
    /// Payload format.
    pub format: FrameFormat,
    /// Capture timestamp, milliseconds on the process monotonic clock.
    pub timestamp: i64,
    /// Video metadata (meaningful when `format.is_video()`).
    pub video: VideoInfo,
    /// Audio metadata (meaningful when `format.is_audio()`).
    pub audio: AudioInfo,
}

impl Frame {
    /// An empty frame with the given buffer capacity reserved.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// An empty, invalid frame.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A video frame taking ownership of `data`.
    pub fn video(format: FrameFormat, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            data,
            format,
            timestamp: monotonic_ms(),
            video: VideoInfo {
                width,
                height,
                ..VideoInfo::default()
            },
            audio: AudioInfo::default(),
        }
    }

    /// An audio frame taking ownership of `data`.
    pub fn audio(format: FrameFormat, info: AudioInfo, data: Vec<u8>) -> Self {
        Self {
            data,
            format,
            timestamp: monotonic_ms(),
            video: VideoInfo::default(),
            audio: info,
        }
    }

    /// Payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable payload bytes. Only valid before the frame is published.
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Allocated buffer capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// A frame is valid when it carries at least one payload byte.
    pub fn is_valid(&self) -> bool {
        !self.data.is_empty()
    }

    /// Whether the format is in the video range.
    pub fn is_video(&self) -> bool {
        self.format.is_video()
    }

    /// Whether the format is in the audio range.
    pub fn is_audio(&self) -> bool {
        self.format.is_audio()
    }

    /// Wrap into the shared handle used for delivery.
    pub fn share(self) -> Arc<Frame> {
        Arc::new(self)
    }
}

// ── Monotonic clock ──────────────────────────────────────────────

static CLOCK_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds since the process clock epoch.
///
/// Monotonic and consistent across all frames produced in this
/// process; not comparable across processes.
pub fn monotonic_ms() -> i64 {
    CLOCK_EPOCH.elapsed().as_millis() as i64
}

// ── Tests ────────────────────────────────────────────────────────
