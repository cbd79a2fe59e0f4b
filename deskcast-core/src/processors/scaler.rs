//! Video scaler: resamples packed RGBA/BGRA frames to a target
//! resolution, optionally preserving the input aspect ratio.
//!
//! Bilinear resampling is implemented; the other algorithm tags are
//! accepted by configuration but currently drop frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::frame::{Frame, FrameFormat};
use crate::node::{FanOut, Node, Processor, Sink, Source};

// ── Configuration ────────────────────────────────────────────────

/// Resampling kernel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScalingAlgorithm {
    Nearest,
    #[default]
    Bilinear,
    Bicubic,
    Lanczos,
}

/// Scaler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    /// Target width in pixels (> 0).
    pub target_width: u32,
    /// Target height in pixels (> 0).
    pub target_height: u32,
    /// Resampling kernel.
    pub algorithm: ScalingAlgorithm,
    /// Fit within the target box preserving the input aspect ratio.
    pub maintain_aspect_ratio: bool,
    /// Reserved: split rows across worker threads.
    pub enable_threading: bool,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            target_width: 1920,
            target_height: 1080,
            algorithm: ScalingAlgorithm::Bilinear,
            maintain_aspect_ratio: true,
            enable_threading: false,
        }
    }
}

// ── Stats ────────────────────────────────────────────────────────

/// Running scaler statistics.
#[derive(Debug, Clone, Default)]
pub struct ScalerStats {
    pub frames_processed: u64,
    pub frames_dropped: u64,
    /// Exponential moving average of per-frame scaling time (α = 0.1
    /// after the first sample).
    pub avg_scaling_time: Duration,
    pub input_width: u32,
    pub input_height: u32,
    pub output_width: u32,
    pub output_height: u32,
}

// ── VideoScaler ──────────────────────────────────────────────────

/// Passive resampling processor.
///
/// Frames already matching the computed target dimensions are
/// forwarded unchanged (same `Arc`, zero-copy).
pub struct VideoScaler {
    out: FanOut,
    config: Mutex<ScalerConfig>,
    stats: Mutex<ScalerStats>,
    warned_unsupported: AtomicBool,
}

impl VideoScaler {
    pub fn new(config: ScalerConfig) -> Self {
        debug!(
            target_width = config.target_width,
            target_height = config.target_height,
            algorithm = ?config.algorithm,
            maintain_aspect_ratio = config.maintain_aspect_ratio,
            "scaler created"
        );
        Self {
            out: FanOut::new(),
            config: Mutex::new(config),
            stats: Mutex::new(ScalerStats::default()),
            warned_unsupported: AtomicBool::new(false),
        }
    }

    /// Change the target resolution at runtime. Rejects zero dimensions.
    pub fn set_target_resolution(&self, width: u32, height: u32) -> bool {
        if width == 0 || height == 0 {
            error!(width, height, "invalid target resolution");
            return false;
        }
        let mut config = self.config.lock().expect("scaler config poisoned");
        info!(
            from_width = config.target_width,
            from_height = config.target_height,
            width,
            height,
            "target resolution changed"
        );
        config.target_width = width;
        config.target_height = height;
        true
    }

    /// Change the resampling kernel at runtime.
    pub fn set_algorithm(&self, algorithm: ScalingAlgorithm) -> bool {
        self.config.lock().expect("scaler config poisoned").algorithm = algorithm;
        true
    }

    /// Snapshot of the running statistics.
    pub fn stats(&self) -> ScalerStats {
        self.stats.lock().expect("scaler stats poisoned").clone()
    }

    /// Target dimensions for a given input, honoring the aspect policy.
    ///
    /// When preserving aspect ratio the result fits within the target
    /// box and each dimension is rounded up to the nearest even number
    /// (codec-friendly).
    fn target_dimensions(config: &ScalerConfig, input_w: u32, input_h: u32) -> (u32, u32) {
        if !config.maintain_aspect_ratio {
            return (config.target_width, config.target_height);
        }

        let input_aspect = input_w as f32 / input_h as f32;
        let target_aspect = config.target_width as f32 / config.target_height as f32;

        let (w, h) = if input_aspect > target_aspect {
            // Wider than the box: fit to width.
            let h = (config.target_width as f32 / input_aspect) as u32;
            (config.target_width, h)
        } else {
            // Taller than the box: fit to height.
            let w = (config.target_height as f32 * input_aspect) as u32;
            (w, config.target_height)
        };

        ((w + 1) & !1, (h + 1) & !1)
    }

    fn scale_frame(&self, input: &Frame, target_w: u32, target_h: u32) -> Option<Frame> {
        let bpp = input.format.bytes_per_pixel()?;
        if bpp != 4 {
            return None;
        }

        let algorithm = self.config.lock().expect("scaler config poisoned").algorithm;
        if algorithm != ScalingAlgorithm::Bilinear {
            if !self.warned_unsupported.swap(true, Ordering::Relaxed) {
                warn!(?algorithm, "only bilinear scaling is implemented; dropping frames");
            }
            return None;
        }

        let mut output = Frame::with_capacity(target_w as usize * target_h as usize * bpp);
        output.format = input.format;
        output.timestamp = input.timestamp;
        output.video.width = target_w;
        output.video.height = target_h;
        output.video.framerate = input.video.framerate;
        output.video.is_keyframe = input.video.is_keyframe;
        output.video.stride = target_w * bpp as u32;

        bilinear_4ch(input, target_w, target_h, output.data_mut());
        Some(output)
    }

    fn update_stats(
        &self,
        input_w: u32,
        input_h: u32,
        output_w: u32,
        output_h: u32,
        elapsed: Duration,
    ) {
        let mut stats = self.stats.lock().expect("scaler stats poisoned");
        stats.frames_processed += 1;
        stats.input_width = input_w;
        stats.input_height = input_h;
        stats.output_width = output_w;
        stats.output_height = output_h;

        if stats.frames_processed == 1 {
            stats.avg_scaling_time = elapsed;
        } else {
            let avg = stats.avg_scaling_time.as_secs_f64() * 0.9 + elapsed.as_secs_f64() * 0.1;
            stats.avg_scaling_time = Duration::from_secs_f64(avg);
        }

        if stats.frames_processed % 100 == 0 {
            info!(
                processed = stats.frames_processed,
                dropped = stats.frames_dropped,
                avg_ms = stats.avg_scaling_time.as_secs_f64() * 1000.0,
                "scaler: {}x{} -> {}x{}",
                input_w,
                input_h,
                output_w,
                output_h
            );
        }
    }

    fn drop_frame(&self) {
        self.stats.lock().expect("scaler stats poisoned").frames_dropped += 1;
    }
}

impl Node for VideoScaler {
    fn id(&self) -> u64 {
        self.out.id()
    }

    fn initialize(&self) -> bool {
        let config = self.config.lock().expect("scaler config poisoned");
        if config.target_width == 0 || config.target_height == 0 {
            error!(
                target_width = config.target_width,
                target_height = config.target_height,
                "invalid scaler target resolution"
            );
            return false;
        }
        true
    }
}

impl Source for VideoScaler {
    fn output(&self) -> &FanOut {
        &self.out
    }
}

impl Sink for VideoScaler {
    fn on_frame(&self, frame: Arc<Frame>) {
        if !frame.is_valid() || !frame.is_video() {
            self.drop_frame();
            return;
        }

        let (input_w, input_h) = (frame.video.width, frame.video.height);
        let (target_w, target_h) = {
            let config = self.config.lock().expect("scaler config poisoned");
            Self::target_dimensions(&config, input_w, input_h)
        };

        if (input_w, input_h) == (target_w, target_h) {
            // Already the right size — forward the same reference.
            self.out.deliver(frame);
            return;
        }

        let started = Instant::now();
        match self.scale_frame(&frame, target_w, target_h) {
            Some(scaled) => {
                self.update_stats(input_w, input_h, target_w, target_h, started.elapsed());
                self.out.deliver(scaled.share());
            }
            None => self.drop_frame(),
        }
    }
}

impl Processor for VideoScaler {}

// ── Bilinear kernel ──────────────────────────────────────────────

/// Bilinear resample of a 4-channel packed frame into `dst`.
///
/// For each destination pixel the four nearest source neighbours
/// (clamped to the source bounds) are interpolated per channel.
fn bilinear_4ch(input: &Frame, dst_w: u32, dst_h: u32, dst: &mut Vec<u8>) {
    let src = input.data();
    let src_w = input.video.width as usize;
    let src_h = input.video.height as usize;
    let src_stride = input.video.effective_stride(input.format);

    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;

    dst.clear();
    dst.reserve(dst_w as usize * dst_h as usize * 4);

    for y in 0..dst_h as usize {
        let src_y = y as f32 * y_ratio;
        let y1 = src_y as usize;
        let y2 = (y1 + 1).min(src_h - 1);
        let dy = src_y - y1 as f32;

        let row1 = y1 * src_stride;
        let row2 = y2 * src_stride;

        for x in 0..dst_w as usize {
            let src_x = x as f32 * x_ratio;
            let x1 = src_x as usize;
            let x2 = (x1 + 1).min(src_w - 1);
            let dx = src_x - x1 as f32;

            let tl = row1 + x1 * 4;
            let tr = row1 + x2 * 4;
            let bl = row2 + x1 * 4;
            let br = row2 + x2 * 4;

            for c in 0..4 {
                let top = src[tl + c] as f32 + dx * (src[tr + c] as f32 - src[tl + c] as f32);
                let bottom = src[bl + c] as f32 + dx * (src[br + c] as f32 - src[bl + c] as f32);
                let value = top + dy * (bottom - top);
                dst.push(value.clamp(0.0, 255.0) as u8);
            }
        }
    }
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

    fn solid_frame(w: u32, h: u32, pixel: [u8; 4]) -> Frame {
        let mut data = Vec::with_capacity((w * h * 4) as usize);
        for _ in 0..w * h {
            data.extend_from_slice(&pixel);
        }
        let mut f = Frame::video(FrameFormat::Bgra32, w, h, data);
        f.video.framerate = 30;
        f
    }

    fn scaler(w: u32, h: u32, keep_aspect: bool) -> (Arc<VideoScaler>, Arc<CaptureSink>) {
        let s = Arc::new(VideoScaler::new(ScalerConfig {
            target_width: w,
            target_height: h,
            maintain_aspect_ratio: keep_aspect,
            ..ScalerConfig::default()
        }));
        let sink = CaptureSink::new();
        s.add_sink(Arc::clone(&sink) as Arc<dyn Sink>);
        (s, sink)
    }

    #[test]
    fn initialize_rejects_zero_target() {
        let s = VideoScaler::new(ScalerConfig {
            target_width: 0,
            target_height: 720,
            ..ScalerConfig::default()
        });
        assert!(!s.initialize());

        let s = VideoScaler::new(ScalerConfig {
            target_width: 1280,
            target_height: 0,
            ..ScalerConfig::default()
        });
        assert!(!s.initialize());
    }

    #[test]
    fn matching_size_forwards_same_reference() {
        let (s, sink) = scaler(640, 480, false);
        assert!(s.initialize());

        let frame = solid_frame(640, 480, [1, 2, 3, 4]).share();
        let expected = Arc::as_ptr(&frame);
        s.on_frame(frame);

        assert_eq!(Arc::as_ptr(&sink.last()), expected);
    }

    #[test]
    fn exact_resize_without_aspect() {
        let (s, sink) = scaler(320, 200, false);
        s.on_frame(solid_frame(640, 480, [10, 20, 30, 255]).share());

        let out = sink.last();
        assert_eq!(out.video.width, 320);
        assert_eq!(out.video.height, 200);
        assert_eq!(out.size(), 320 * 200 * 4);
        assert_eq!(out.video.stride, 320 * 4);
        // Solid input stays solid.
        assert_eq!(&out.data()[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn aspect_fit_is_even_and_within_box() {
        let (s, sink) = scaler(1280, 720, true);
        s.on_frame(solid_frame(1600, 900, [0, 0, 255, 255]).share());

        let out = sink.last();
        assert_eq!((out.video.width, out.video.height), (1280, 720));
        assert_eq!(out.size(), 3_686_400);
    }

    #[test]
    fn square_box_keeps_input_aspect() {
        let (s, sink) = scaler(500, 500, true);
        s.on_frame(solid_frame(1600, 900, [9, 9, 9, 9]).share());

        let out = sink.last();
        let (w, h) = (out.video.width, out.video.height);
        assert!(w <= 500 && h <= 500);
        assert_eq!(w % 2, 0);
        assert_eq!(h % 2, 0);
        // Even rounding may move a dimension by up to 2, so allow the
        // corresponding aspect deviation.
        let in_aspect = 1600.0 / 900.0;
        let out_aspect = w as f64 / h as f64;
        assert!((in_aspect - out_aspect).abs() <= 2.0 * in_aspect / h as f64);
    }

    #[test]
    fn red_region_lands_scaled() {
        // 1600x900 with a 100x100 red block at the origin, scaled into
        // a 1280x720 box: the block becomes ~80x80 at the origin.
        let mut data = vec![0u8; 1600 * 900 * 4];
        for y in 0..100 {
            for x in 0..100 {
                let i = (y * 1600 + x) * 4;
                data[i..i + 4].copy_from_slice(&[0, 0, 255, 255]); // BGRA red
            }
        }
        let frame = Frame::video(FrameFormat::Bgra32, 1600, 900, data);

        let (s, sink) = scaler(1280, 720, true);
        s.on_frame(frame.share());

        let out = sink.last();
        assert_eq!((out.video.width, out.video.height), (1280, 720));
        let red_at = |x: usize, y: usize| {
            let i = (y * 1280 + x) * 4;
            out.data()[i + 2] > 200 && out.data()[i] < 50
        };
        assert!(red_at(0, 0));
        assert!(red_at(78, 78), "inside the scaled block");
        assert!(!red_at(82, 82), "outside the scaled block");
    }

    #[test]
    fn drops_invalid_and_non_video() {
        let (s, sink) = scaler(100, 100, false);
        s.on_frame(Frame::empty().share());

        let mut audio = Frame::audio(
            FrameFormat::PcmS16le,
            crate::frame::AudioInfo::default(),
            vec![0u8; 32],
        );
        audio.timestamp = 0;
        s.on_frame(audio.share());

        assert_eq!(sink.count(), 0);
        assert_eq!(s.stats().frames_dropped, 2);
    }

    #[test]
    fn unsupported_algorithm_drops() {
        let (s, sink) = scaler(100, 100, false);
        s.set_algorithm(ScalingAlgorithm::Lanczos);
        s.on_frame(solid_frame(200, 200, [1, 1, 1, 1]).share());
        assert_eq!(sink.count(), 0);
        assert_eq!(s.stats().frames_dropped, 1);
    }

    #[test]
    fn set_target_resolution_validates() {
        let (s, _sink) = scaler(100, 100, false);
        assert!(!s.set_target_resolution(0, 50));
        assert!(!s.set_target_resolution(50, 0));
        assert!(s.set_target_resolution(64, 64));
    }

    #[test]
    fn stats_track_dimensions_and_average() {
        let (s, _sink) = scaler(320, 240, false);
        s.on_frame(solid_frame(640, 480, [5, 5, 5, 5]).share());
        s.on_frame(solid_frame(640, 480, [5, 5, 5, 5]).share());

        let stats = s.stats();
        assert_eq!(stats.frames_processed, 2);
        assert_eq!((stats.input_width, stats.input_height), (640, 480));
        assert_eq!((stats.output_width, stats.output_height), (320, 240));
    }
}
