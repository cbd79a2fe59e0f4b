//! File recorder sinks.
//!
//! [`Y4mRecorder`] writes an uncompressed Y4M container (one ASCII
//! header, then `FRAME\n` + payload per picture) and expects I420
//! input. [`RawRecorder`] dumps each frame's payload unchanged,
//! picking the file extension from the first frame's format.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use crate::frame::{Frame, FrameFormat};
use crate::node::{next_node_id, Node, Sink};

// ── Y4mRecorder ──────────────────────────────────────────────────

#[derive(Default)]
struct Y4mState {
    writer: Option<BufWriter<File>>,
    header_written: bool,
    frames_written: u64,
    bytes_written: u64,
    non_i420_skipped: u64,
}

/// Sink writing I420 frames into a `.y4m` container.
pub struct Y4mRecorder {
    id: u64,
    path: PathBuf,
    running: AtomicBool,
    state: Mutex<Y4mState>,
}

impl Y4mRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            id: next_node_id(),
            path: path.into(),
            running: AtomicBool::new(false),
            state: Mutex::new(Y4mState::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_written(&self) -> u64 {
        self.state.lock().expect("recorder poisoned").frames_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.state.lock().expect("recorder poisoned").bytes_written
    }

    /// Print a human-readable recording summary.
    pub fn print_summary(&self) {
        let state = self.state.lock().expect("recorder poisoned");
        println!("Recorded {} frames to {}", state.frames_written, self.path.display());
        println!(
            "Total data: {:.2} MB",
            state.bytes_written as f64 / (1024.0 * 1024.0)
        );
        println!("Play with: ffplay {}", self.path.display());
        if state.non_i420_skipped > 0 {
            println!("Skipped {} non-I420 frames", state.non_i420_skipped);
        }
    }

    fn write_frame(&self, frame: &Frame) -> std::io::Result<()> {
        let mut state = self.state.lock().expect("recorder poisoned");

        if state.writer.is_none() {
            state.writer = Some(BufWriter::new(File::create(&self.path)?));
        }

        if !state.header_written {
            let fps = if frame.video.framerate > 0 {
                frame.video.framerate
            } else {
                30
            };
            let header = format!(
                "YUV4MPEG2 W{} H{} F{}:1 Ip A1:1 C420jpeg\n",
                frame.video.width, frame.video.height, fps
            );
            let writer = state.writer.as_mut().expect("writer just created");
            writer.write_all(header.as_bytes())?;
            state.header_written = true;
        }

        let writer = state.writer.as_mut().expect("writer just created");
        writer.write_all(b"FRAME\n")?;
        writer.write_all(frame.data())?;

        state.frames_written += 1;
        state.bytes_written += frame.size() as u64;
        Ok(())
    }
}

impl Node for Y4mRecorder {
    fn id(&self) -> u64 {
        self.id
    }

    fn start(&self) -> bool {
        self.running.store(true, Ordering::SeqCst);
        true
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut state = self.state.lock().expect("recorder poisoned");
        if let Some(writer) = state.writer.as_mut() {
            if let Err(e) = writer.flush() {
                error!(error = %e, path = %self.path.display(), "flush failed");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Sink for Y4mRecorder {
    fn on_frame(&self, frame: Arc<Frame>) {
        if !self.is_running() {
            return;
        }

        if frame.format != FrameFormat::I420 {
            let mut state = self.state.lock().expect("recorder poisoned");
            if state.non_i420_skipped == 0 {
                warn!(
                    format = frame.format.name(),
                    "Y4M recorder expects I420 frames"
                );
            }
            state.non_i420_skipped += 1;
            return;
        }

        if let Err(e) = self.write_frame(&frame) {
            error!(error = %e, path = %self.path.display(), "Y4M write failed");
        }
    }
}

// ── RawRecorder ──────────────────────────────────────────────────

#[derive(Default)]
struct RawState {
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    frames_written: u64,
    bytes_written: u64,
}

/// Sink dumping raw frame payloads to `<prefix>.<ext>`, with the
/// extension chosen from the first frame's format.
pub struct RawRecorder {
    id: u64,
    prefix: PathBuf,
    running: AtomicBool,
    state: Mutex<RawState>,
}

impl RawRecorder {
    pub fn new(prefix: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            id: next_node_id(),
            prefix: prefix.into(),
            running: AtomicBool::new(false),
            state: Mutex::new(RawState::default()),
        })
    }

    /// The output path; known once the first frame arrived.
    pub fn path(&self) -> Option<PathBuf> {
        self.state.lock().expect("recorder poisoned").path.clone()
    }

    pub fn frames_written(&self) -> u64 {
        self.state.lock().expect("recorder poisoned").frames_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.state.lock().expect("recorder poisoned").bytes_written
    }

    fn extension(format: FrameFormat) -> &'static str {
        match format {
            FrameFormat::Bgra32 => "bgra",
            FrameFormat::Rgba32 => "rgba",
            FrameFormat::Rgb24 => "rgb",
            FrameFormat::Bgr24 => "bgr",
            FrameFormat::I420 | FrameFormat::Nv12 => "yuv",
            _ => "bin",
        }
    }

    fn write_frame(&self, frame: &Frame) -> std::io::Result<()> {
        let mut state = self.state.lock().expect("recorder poisoned");

        if state.writer.is_none() {
            let mut path = self.prefix.clone();
            path.set_extension(Self::extension(frame.format));
            info!(path = %path.display(), "raw recorder output");
            state.writer = Some(BufWriter::new(File::create(&path)?));
            state.path = Some(path);
        }

        let writer = state.writer.as_mut().expect("writer just created");
        writer.write_all(frame.data())?;

        state.frames_written += 1;
        state.bytes_written += frame.size() as u64;
        Ok(())
    }
}

impl Node for RawRecorder {
    fn id(&self) -> u64 {
        self.id
    }

    fn start(&self) -> bool {
        self.running.store(true, Ordering::SeqCst);
        true
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut state = self.state.lock().expect("recorder poisoned");
        if let Some(writer) = state.writer.as_mut() {
            if let Err(e) = writer.flush() {
                error!(error = %e, "flush failed");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Sink for RawRecorder {
    fn on_frame(&self, frame: Arc<Frame>) {
        if !self.is_running() {
            return;
        }
        if let Err(e) = self.write_frame(&frame) {
            error!(error = %e, "raw write failed");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
