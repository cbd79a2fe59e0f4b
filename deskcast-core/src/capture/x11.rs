//! X11 capture engine.
//!
//! Grabs the root window with `XGetImage` on a paced worker thread.
//! The Xlib connection is confined to one thread at a time: it is
//! opened during `initialize`, moves into the worker on `start`, and
//! returns to the engine when the worker exits, so `start` can be
//! called again after `stop`.

use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};
use x11::xlib;

use crate::error::CaptureError;
use crate::frame::{monotonic_ms, Frame, FrameFormat};

use super::{CaptureConfig, CaptureEngine, FrameCallback, ScreenInfo};

// ── X11Session ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct CaptureRect {
    x: i32,
    y: i32,
    width: u32,
    height: u32,
}

/// An open Xlib connection plus the resolved capture geometry.
struct X11Session {
    display: *mut xlib::Display,
    root: xlib::Window,
    rect: CaptureRect,
}

// Xlib connections are not internally synchronized. The session is
// used by exactly one thread at a time: the engine thread between
// initialize/start and after stop, the worker thread in between.
unsafe impl Send for X11Session {}

impl Drop for X11Session {
    fn drop(&mut self) {
        unsafe {
            xlib::XCloseDisplay(self.display);
        }
    }
}

// ── X11CaptureEngine ─────────────────────────────────────────────

/// `XGetImage`-based capture backend.
pub struct X11CaptureEngine {
    config: CaptureConfig,
    frame_interval: Duration,
    callback: Arc<Mutex<Option<FrameCallback>>>,
    /// Holds the session while the worker is not running.
    session: Arc<Mutex<Option<X11Session>>>,
    should_stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    running: bool,
}

impl X11CaptureEngine {
    pub fn new() -> Self {
        Self {
            config: CaptureConfig::default(),
            frame_interval: Duration::from_millis(1000 / 30),
            callback: Arc::new(Mutex::new(None)),
            session: Arc::new(Mutex::new(None)),
            should_stop: Arc::new(AtomicBool::new(false)),
            worker: None,
            running: false,
        }
    }

    fn open_session(config: &CaptureConfig) -> Result<X11Session, CaptureError> {
        let display = unsafe { xlib::XOpenDisplay(ptr::null()) };
        if display.is_null() {
            error!(
                "no X11 display available (headless environment?); \
                 run under Xvfb and set DISPLAY, e.g. `Xvfb :99 & DISPLAY=:99`"
            );
            return Err(CaptureError::NoDisplay);
        }

        let screen = unsafe { xlib::XDefaultScreen(display) };
        let root = unsafe { xlib::XRootWindow(display, screen) };

        let rect = if config.width > 0 && config.height > 0 {
            CaptureRect {
                x: config.offset_x,
                y: config.offset_y,
                width: config.width,
                height: config.height,
            }
        } else {
            CaptureRect {
                x: 0,
                y: 0,
                width: unsafe { xlib::XDisplayWidth(display, screen) } as u32,
                height: unsafe { xlib::XDisplayHeight(display, screen) } as u32,
            }
        };

        debug!(
            width = rect.width,
            height = rect.height,
            x = rect.x,
            y = rect.y,
            "X11 session opened"
        );

        Ok(X11Session {
            display,
            root,
            rect,
        })
    }
}

impl Default for X11CaptureEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureEngine for X11CaptureEngine {
    fn initialize(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        if self.running {
            return Err(CaptureError::AlreadyStarted);
        }
        config.validate()?;

        let session = Self::open_session(config)?;
        *self.session.lock().expect("session slot poisoned") = Some(session);

        self.config = config.clone();
        self.frame_interval = Duration::from_millis(1000 / u64::from(config.frame_rate));
        Ok(())
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        if self.running {
            return Ok(());
        }

        let Some(session) = self.session.lock().expect("session slot poisoned").take() else {
            return Err(CaptureError::Initialization(
                "X11 engine not initialized".into(),
            ));
        };

        self.should_stop.store(false, Ordering::SeqCst);

        let interval = self.frame_interval;
        let callback = Arc::clone(&self.callback);
        let slot = Arc::clone(&self.session);
        let should_stop = Arc::clone(&self.should_stop);
        let frame_rate = self.config.frame_rate;

        let handle = std::thread::Builder::new()
            .name("deskcast-x11-capture".into())
            .spawn(move || {
                capture_loop(session, interval, frame_rate, callback, should_stop, slot);
            })
            .map_err(|e| CaptureError::Initialization(format!("spawn capture worker: {e}")))?;

        self.worker = Some(handle);
        self.running = true;
        debug!("X11 capture started");
        Ok(())
    }

    fn stop(&mut self) {
        if !self.running {
            return;
        }

        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("X11 capture worker panicked");
            }
        }
        self.running = false;
        debug!("X11 capture stopped");
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn available_screens(&self) -> Vec<ScreenInfo> {
        // A short-lived connection keeps this callable while the
        // worker owns the capture session.
        let display = unsafe { xlib::XOpenDisplay(ptr::null()) };
        if display.is_null() {
            return Vec::new();
        }

        let mut screens = Vec::new();
        unsafe {
            let count = xlib::XScreenCount(display);
            let default = xlib::XDefaultScreen(display);
            for i in 0..count {
                screens.push(ScreenInfo {
                    id: i as u32,
                    width: xlib::XDisplayWidth(display, i) as u32,
                    height: xlib::XDisplayHeight(display, i) as u32,
                    bits_per_pixel: xlib::XDefaultDepth(display, i) as u32,
                    x: 0,
                    y: 0,
                    name: format!("Screen {i}"),
                    is_primary: i == default,
                });
            }
            xlib::XCloseDisplay(display);
        }
        screens
    }

    fn set_frame_callback(&mut self, callback: FrameCallback) {
        *self.callback.lock().expect("callback poisoned") = Some(callback);
    }

    fn config(&self) -> CaptureConfig {
        self.config.clone()
    }

    fn update_config(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        let was_running = self.running;
        if was_running {
            self.stop();
        }

        self.initialize(config)?;
        if was_running {
            self.start()?;
        }
        Ok(())
    }
}

impl Drop for X11CaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Worker ───────────────────────────────────────────────────────

/// Paced capture loop. Owns the session for its lifetime and returns
/// it to `slot` on exit.
fn capture_loop(
    session: X11Session,
    interval: Duration,
    frame_rate: u32,
    callback: Arc<Mutex<Option<FrameCallback>>>,
    should_stop: Arc<AtomicBool>,
    slot: Arc<Mutex<Option<X11Session>>>,
) {
    debug!("X11 capture loop started");
    let mut last_frame = Instant::now();

    while !should_stop.load(Ordering::SeqCst) {
        if last_frame.elapsed() >= interval {
            if let Some(frame) = capture_one_frame(&session, frame_rate) {
                let cb = callback.lock().expect("callback poisoned").clone();
                if let Some(cb) = cb {
                    cb(frame.share());
                }
            }
            last_frame = Instant::now();
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    *slot.lock().expect("session slot poisoned") = Some(session);
    debug!("X11 capture loop ended");
}

/// Grab one frame of the capture rect.
///
/// The XImage payload is repacked into a tight `width * 4` layout so
/// downstream processors see `stride == width * 4`.
fn capture_one_frame(session: &X11Session, frame_rate: u32) -> Option<Frame> {
    let rect = session.rect;

    let image = unsafe {
        xlib::XGetImage(
            session.display,
            session.root,
            rect.x,
            rect.y,
            rect.width,
            rect.height,
            !0, // all planes
            xlib::ZPixmap,
        )
    };
    if image.is_null() {
        warn!(
            width = rect.width,
            height = rect.height,
            "XGetImage failed"
        );
        return None;
    }

    let frame = unsafe {
        let img = &*image;

        if img.bits_per_pixel != 32 {
            warn!(
                bits_per_pixel = img.bits_per_pixel,
                "unsupported root visual, dropping frame"
            );
            if let Some(destroy) = img.funcs.destroy_image {
                destroy(image);
            }
            return None;
        }

        let format = detect_format(img);
        let width = img.width as u32;
        let height = img.height as u32;
        let row_bytes = width as usize * 4;
        let src_stride = img.bytes_per_line as usize;
        let src =
            std::slice::from_raw_parts(img.data as *const u8, src_stride * height as usize);

        let mut data = Vec::with_capacity(row_bytes * height as usize);
        if src_stride == row_bytes {
            data.extend_from_slice(src);
        } else {
            for y in 0..height as usize {
                let start = y * src_stride;
                data.extend_from_slice(&src[start..start + row_bytes]);
            }
        }

        let mut frame = Frame::video(format, width, height, data);
        frame.timestamp = monotonic_ms();
        frame.video.framerate = frame_rate;
        frame.video.stride = row_bytes as u32;
        frame
    };

    unsafe {
        if let Some(destroy) = (*image).funcs.destroy_image {
            destroy(image);
        }
    }

    Some(frame)
}

/// Map XImage depth/bpp/channel masks onto a frame format.
fn detect_format(img: &xlib::XImage) -> FrameFormat {
    if img.depth == 24 && img.bits_per_pixel == 32 {
        if img.red_mask == 0x00FF_0000 && img.green_mask == 0x0000_FF00 && img.blue_mask == 0x0000_00FF
        {
            return FrameFormat::Bgra32;
        }
        if img.red_mask == 0x0000_00FF && img.green_mask == 0x0000_FF00 && img.blue_mask == 0x00FF_0000
        {
            return FrameFormat::Rgba32;
        }
    }
    FrameFormat::Unknown
}

// ── Tests ────────────────────────────────────────────────────────
