//! Pixel-format converter: maps between the packed RGB-family layouts
//! and planar I420 (4:2:0 YUV).
//!
//! Supported formats: RGB24, BGR24, RGBA32, BGRA32 as input; the same
//! set plus I420 as output. A frame already in the output format is
//! forwarded unchanged (same `Arc`, zero-copy).

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::frame::{Frame, FrameFormat};
use crate::node::{FanOut, Node, Processor, Sink, Source};

// ── Configuration ────────────────────────────────────────────────

/// Converter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Expected input format (informational; conversion dispatches on
    /// the actual frame format).
    pub input_format: FrameFormat,
    /// Target output format.
    pub output_format: FrameFormat,
    /// Reserved: split rows across worker threads.
    pub enable_threading: bool,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            input_format: FrameFormat::Bgra32,
            output_format: FrameFormat::I420,
            enable_threading: false,
        }
    }
}

/// Whether `format` participates in conversion at all.
fn is_supported(format: FrameFormat) -> bool {
    matches!(
        format,
        FrameFormat::Rgb24
            | FrameFormat::Bgr24
            | FrameFormat::Rgba32
            | FrameFormat::Bgra32
            | FrameFormat::I420
    )
}

/// Output buffer size for a converted `w × h` frame.
fn output_size(width: u32, height: u32, format: FrameFormat) -> usize {
    let (w, h) = (width as usize, height as usize);
    match format {
        FrameFormat::Rgb24 | FrameFormat::Bgr24 => w * h * 3,
        FrameFormat::Rgba32 | FrameFormat::Bgra32 => w * h * 4,
        // Y plane + quarter-size U and V planes.
        FrameFormat::I420 => w * h + 2 * (w / 2) * (h / 2),
        _ => 0,
    }
}

// ── Stats ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ConverterStats {
    pub frames_processed: u64,
    pub frames_dropped: u64,
}

// ── PixelFormatConverter ─────────────────────────────────────────

/// Passive single-pass format conversion processor.
pub struct PixelFormatConverter {
    out: FanOut,
    config: Mutex<ConverterConfig>,
    stats: Mutex<ConverterStats>,
}

impl PixelFormatConverter {
    pub fn new(config: ConverterConfig) -> Self {
        debug!(
            input = config.input_format.name(),
            output = config.output_format.name(),
            "converter created"
        );
        Self {
            out: FanOut::new(),
            config: Mutex::new(config),
            stats: Mutex::new(ConverterStats::default()),
        }
    }

    /// Change the output format at runtime. Rejects formats outside the
    /// supported set; repeated calls with the same format are no-ops.
    pub fn set_output_format(&self, format: FrameFormat) -> bool {
        if !is_supported(format) {
            return false;
        }
        self.config.lock().expect("converter config poisoned").output_format = format;
        true
    }

    /// Currently configured output format.
    pub fn output_format(&self) -> FrameFormat {
        self.config.lock().expect("converter config poisoned").output_format
    }

    /// Snapshot of the running statistics.
    pub fn stats(&self) -> ConverterStats {
        self.stats.lock().expect("converter stats poisoned").clone()
    }

    fn drop_frame(&self) {
        self.stats.lock().expect("converter stats poisoned").frames_dropped += 1;
    }

    fn convert(&self, input: &Frame, output_format: FrameFormat) -> Option<Frame> {
        let (w, h) = (input.video.width, input.video.height);

        // 4:2:0 subsampling halves both dimensions; odd inputs would
        // leave dangling chroma samples.
        if output_format == FrameFormat::I420 && (w % 2 != 0 || h % 2 != 0) {
            warn!(width = w, height = h, "I420 output requires even dimensions");
            return None;
        }

        let size = output_size(w, h, output_format);
        if size == 0 {
            return None;
        }

        let stride = input.video.effective_stride(input.format);
        let data = match (input.format, output_format) {
            (FrameFormat::Bgra32, FrameFormat::Rgba32)
            | (FrameFormat::Rgba32, FrameFormat::Bgra32) => {
                swap_rb_32(input.data(), w, h, stride)
            }
            (FrameFormat::Rgb24, FrameFormat::Bgr24)
            | (FrameFormat::Bgr24, FrameFormat::Rgb24) => {
                swap_rb_24(input.data(), w, h, stride)
            }

            (FrameFormat::Bgra32, FrameFormat::Rgb24)
            | (FrameFormat::Rgba32, FrameFormat::Bgr24) => {
                strip_alpha(input.data(), w, h, stride, true)
            }
            (FrameFormat::Bgra32, FrameFormat::Bgr24)
            | (FrameFormat::Rgba32, FrameFormat::Rgb24) => {
                strip_alpha(input.data(), w, h, stride, false)
            }

            (FrameFormat::Rgb24, FrameFormat::Bgra32)
            | (FrameFormat::Bgr24, FrameFormat::Rgba32) => {
                add_alpha(input.data(), w, h, stride, true)
            }
            (FrameFormat::Rgb24, FrameFormat::Rgba32)
            | (FrameFormat::Bgr24, FrameFormat::Bgra32) => {
                add_alpha(input.data(), w, h, stride, false)
            }

            (FrameFormat::Bgra32, FrameFormat::I420) => {
                rgb_to_i420(input.data(), w, h, stride, 4, [2, 1, 0])
            }
            (FrameFormat::Rgba32, FrameFormat::I420) => {
                rgb_to_i420(input.data(), w, h, stride, 4, [0, 1, 2])
            }
            (FrameFormat::Rgb24, FrameFormat::I420) => {
                rgb_to_i420(input.data(), w, h, stride, 3, [0, 1, 2])
            }
            (FrameFormat::Bgr24, FrameFormat::I420) => {
                rgb_to_i420(input.data(), w, h, stride, 3, [2, 1, 0])
            }

            _ => return None,
        };
        debug_assert_eq!(data.len(), size);

        let mut output = Frame::video(output_format, w, h, data);
        output.timestamp = input.timestamp;
        output.video.framerate = input.video.framerate;
        output.video.is_keyframe = input.video.is_keyframe;
        if let Some(bpp) = output_format.bytes_per_pixel() {
            output.video.stride = w * bpp as u32;
        }
        Some(output)
    }
}

impl Node for PixelFormatConverter {
    fn id(&self) -> u64 {
        self.out.id()
    }

    fn initialize(&self) -> bool {
        let config = self.config.lock().expect("converter config poisoned");
        is_supported(config.input_format) && is_supported(config.output_format)
    }
}

impl Source for PixelFormatConverter {
    fn output(&self) -> &FanOut {
        &self.out
    }
}

impl Sink for PixelFormatConverter {
    fn on_frame(&self, frame: Arc<Frame>) {
        if !frame.is_valid() || !frame.is_video() {
            self.drop_frame();
            return;
        }

        let output_format = self.output_format();
        if frame.format == output_format {
            // Nothing to do — forward the same reference.
            self.out.deliver(frame);
            return;
        }

        match self.convert(&frame, output_format) {
            Some(converted) => {
                self.stats.lock().expect("converter stats poisoned").frames_processed += 1;
                self.out.deliver(converted.share());
            }
            None => self.drop_frame(),
        }
    }
}

impl Processor for PixelFormatConverter {}

// ── Conversion kernels ───────────────────────────────────────────

/// 32-bit ↔ 32-bit with the first and third channel exchanged
/// (BGRA ↔ RGBA).
fn swap_rb_32(src: &[u8], w: u32, h: u32, stride: usize) -> Vec<u8> {
    let mut dst = Vec::with_capacity(w as usize * h as usize * 4);
    for y in 0..h as usize {
        let row = &src[y * stride..];
        for x in 0..w as usize {
            let p = &row[x * 4..x * 4 + 4];
            dst.extend_from_slice(&[p[2], p[1], p[0], p[3]]);
        }
    }
    dst
}

/// 24-bit ↔ 24-bit with the first and third channel exchanged
/// (RGB ↔ BGR).
fn swap_rb_24(src: &[u8], w: u32, h: u32, stride: usize) -> Vec<u8> {
    let mut dst = Vec::with_capacity(w as usize * h as usize * 3);
    for y in 0..h as usize {
        let row = &src[y * stride..];
        for x in 0..w as usize {
            let p = &row[x * 3..x * 3 + 3];
            dst.extend_from_slice(&[p[2], p[1], p[0]]);
        }
    }
    dst
}

/// 32-bit → 24-bit, dropping alpha; `swap` exchanges first/third.
fn strip_alpha(src: &[u8], w: u32, h: u32, stride: usize, swap: bool) -> Vec<u8> {
    let mut dst = Vec::with_capacity(w as usize * h as usize * 3);
    for y in 0..h as usize {
        let row = &src[y * stride..];
        for x in 0..w as usize {
            let p = &row[x * 4..x * 4 + 4];
            if swap {
                dst.extend_from_slice(&[p[2], p[1], p[0]]);
            } else {
                dst.extend_from_slice(&[p[0], p[1], p[2]]);
            }
        }
    }
    dst
}

/// 24-bit → 32-bit, appending an opaque alpha; `swap` exchanges
/// first/third.
fn add_alpha(src: &[u8], w: u32, h: u32, stride: usize, swap: bool) -> Vec<u8> {
    let mut dst = Vec::with_capacity(w as usize * h as usize * 4);
    for y in 0..h as usize {
        let row = &src[y * stride..];
        for x in 0..w as usize {
            let p = &row[x * 3..x * 3 + 3];
            if swap {
                dst.extend_from_slice(&[p[2], p[1], p[0], 255]);
            } else {
                dst.extend_from_slice(&[p[0], p[1], p[2], 255]);
            }
        }
    }
    dst
}

/// Packed RGB-family → planar I420 using integer BT.601 coefficients.
///
/// `offsets` gives the byte positions of R, G, B within one pixel.
/// Chroma is box-subsampled: the U/V sample for each 2×2 block is the
/// value at its even `(x, y)` corner.
fn rgb_to_i420(src: &[u8], w: u32, h: u32, stride: usize, step: usize, offsets: [usize; 3]) -> Vec<u8> {
    let (w, h) = (w as usize, h as usize);
    let y_size = w * h;
    let uv_size = (w / 2) * (h / 2);

    let mut dst = vec![0u8; y_size + 2 * uv_size];
    let (y_plane, uv_planes) = dst.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

    let [r_off, g_off, b_off] = offsets;

    for y in 0..h {
        let row = &src[y * stride..];
        for x in 0..w {
            let p = &row[x * step..x * step + step];
            let r = p[r_off] as i32;
            let g = p[g_off] as i32;
            let b = p[b_off] as i32;

            let luma = (77 * r + 150 * g + 29 * b) >> 8;
            y_plane[y * w + x] = luma.clamp(0, 255) as u8;

            if y % 2 == 0 && x % 2 == 0 {
                let u = ((-43 * r - 85 * g + 128 * b) >> 8) + 128;
                let v = ((128 * r - 107 * g - 21 * b) >> 8) + 128;
                let uv_idx = (y / 2) * (w / 2) + (x / 2);
                u_plane[uv_idx] = u.clamp(0, 255) as u8;
                v_plane[uv_idx] = v.clamp(0, 255) as u8;
            }
        }
    }

    dst
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::next_node_id;
    use std::sync::Mutex as StdMutex;

    struct CaptureSink {
        id: u64,
        frames: StdMutex<Vec<Arc<Frame>>>,
    }

    impl CaptureSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: next_node_id(),
                frames: StdMutex::new(Vec::new()),
            })
        }

        fn last(&self) -> Arc<Frame> {
            self.frames.lock().unwrap().last().cloned().expect("no frame delivered")
        }

        fn count(&self) -> usize {
            self.frames.lock().unwrap().len()
        }
    }

    impl Node for CaptureSink {
        fn id(&self) -> u64 {
            self.id
        }
    }

    impl Sink for CaptureSink {
        fn on_frame(&self, frame: Arc<Frame>) {
            self.frames.lock().unwrap().push(frame);
        }
    }

    fn converter(output: FrameFormat) -> (Arc<PixelFormatConverter>, Arc<CaptureSink>) {
        let c = Arc::new(PixelFormatConverter::new(ConverterConfig {
            output_format: output,
            ..ConverterConfig::default()
        }));
        let sink = CaptureSink::new();
        c.add_sink(Arc::clone(&sink) as Arc<dyn Sink>);
        (c, sink)
    }

    fn frame_of(format: FrameFormat, w: u32, h: u32, pixel: &[u8]) -> Frame {
        let mut data = Vec::new();
        for _ in 0..w * h {
            data.extend_from_slice(pixel);
        }
        Frame::video(format, w, h, data)
    }

    #[test]
    fn matching_format_forwards_same_reference() {
        let (c, sink) = converter(FrameFormat::Bgra32);
        let frame = frame_of(FrameFormat::Bgra32, 4, 4, &[1, 2, 3, 4]).share();
        let expected = Arc::as_ptr(&frame);
        c.on_frame(frame);
        assert_eq!(Arc::as_ptr(&sink.last()), expected);
        assert_eq!(c.stats().frames_processed, 0, "zero-copy path is not a conversion");
    }

    #[test]
    fn bgra_rgba_roundtrip_is_exact() {
        let original: Vec<u8> = (0u8..=255).cycle().take(8 * 2 * 4).collect();
        let frame = Frame::video(FrameFormat::Bgra32, 8, 2, original.clone());

        let (to_rgba, mid) = converter(FrameFormat::Rgba32);
        to_rgba.on_frame(frame.share());
        let rgba = mid.last();
        assert_eq!(rgba.format, FrameFormat::Rgba32);

        let (back, end) = converter(FrameFormat::Bgra32);
        back.on_frame(rgba);
        assert_eq!(end.last().data(), original.as_slice());
    }

    #[test]
    fn rgb_bgr_roundtrip_is_exact() {
        let original: Vec<u8> = (0u8..=255).cycle().take(6 * 3 * 3).collect();
        let frame = Frame::video(FrameFormat::Rgb24, 6, 3, original.clone());

        let (to_bgr, mid) = converter(FrameFormat::Bgr24);
        to_bgr.on_frame(frame.share());

        let (back, end) = converter(FrameFormat::Rgb24);
        back.on_frame(mid.last());
        assert_eq!(end.last().data(), original.as_slice());
    }

    #[test]
    fn rgb24_to_bgra32_sets_opaque_alpha() {
        let (c, sink) = converter(FrameFormat::Bgra32);
        c.on_frame(frame_of(FrameFormat::Rgb24, 2, 2, &[10, 20, 30]).share());

        let out = sink.last();
        assert_eq!(out.size(), 2 * 2 * 4);
        assert_eq!(&out.data()[..4], &[30, 20, 10, 255]);
    }

    #[test]
    fn blue_bgra_to_i420_reference_values() {
        // Solid blue (B=255, G=0, R=0): Y = (29·255)>>8 = 28,
        // U = 127+128 = 255, V = (-5355>>8)+128 = 107 per the integer
        // BT.601 coefficients.
        let (c, sink) = converter(FrameFormat::I420);
        c.on_frame(frame_of(FrameFormat::Bgra32, 4, 2, &[255, 0, 0, 255]).share());

        let out = sink.last();
        assert_eq!(out.format, FrameFormat::I420);
        assert_eq!(out.size(), 4 * 2 + 2 * 2 * 1);
        assert_eq!(out.size(), 12);

        let data = out.data();
        assert!(data[..8].iter().all(|&y| y == 28), "Y plane: {:?}", &data[..8]);
        assert!(data[8..10].iter().all(|&u| u == 255), "U plane");
        assert!(data[10..12].iter().all(|&v| v == 107), "V plane");
    }

    #[test]
    fn i420_size_formula() {
        let (c, sink) = converter(FrameFormat::I420);
        c.on_frame(frame_of(FrameFormat::Rgba32, 16, 8, &[1, 2, 3, 4]).share());

        let out = sink.last();
        assert_eq!(out.size(), 16 * 8 + 2 * 8 * 4);
    }

    #[test]
    fn odd_dimensions_rejected_for_i420() {
        let (c, sink) = converter(FrameFormat::I420);
        c.on_frame(frame_of(FrameFormat::Bgra32, 5, 2, &[0, 0, 0, 0]).share());
        assert_eq!(sink.count(), 0);
        assert_eq!(c.stats().frames_dropped, 1);
    }

    #[test]
    fn i420_input_is_unsupported() {
        let (c, sink) = converter(FrameFormat::Rgb24);
        let data = vec![0u8; 4 * 2 + 2 * 2];
        let frame = Frame::video(FrameFormat::I420, 4, 2, data);
        c.on_frame(frame.share());
        assert_eq!(sink.count(), 0);
        assert_eq!(c.stats().frames_dropped, 1);
    }

    #[test]
    fn set_output_format_is_idempotent_and_validated() {
        let (c, _sink) = converter(FrameFormat::I420);
        assert!(c.set_output_format(FrameFormat::Rgb24));
        assert!(c.set_output_format(FrameFormat::Rgb24));
        assert_eq!(c.output_format(), FrameFormat::Rgb24);
        assert!(!c.set_output_format(FrameFormat::H264));
        assert_eq!(c.output_format(), FrameFormat::Rgb24);
    }

    #[test]
    fn initialize_validates_formats() {
        let c = PixelFormatConverter::new(ConverterConfig {
            input_format: FrameFormat::H264,
            output_format: FrameFormat::I420,
            enable_threading: false,
        });
        assert!(!c.initialize());

        let c = PixelFormatConverter::new(ConverterConfig::default());
        assert!(c.initialize());
    }

    #[test]
    fn drops_invalid_frames() {
        let (c, sink) = converter(FrameFormat::Rgba32);
        c.on_frame(Frame::empty().share());
        assert_eq!(sink.count(), 0);
        assert_eq!(c.stats().frames_dropped, 1);
    }
}
