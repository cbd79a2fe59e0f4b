//! Screen capture: platform engines, factory, and the pipeline-facing
//! [`ScreenCapturer`] source.
//!
//! Backends are selected at runtime via [`Technology`] and compiled
//! conditionally per OS. Nothing platform-specific leaks through the
//! [`CaptureEngine`] trait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CaptureError;
use crate::frame::Frame;
use crate::node::{FanOut, Node, Source};

#[cfg(target_os = "windows")]
pub mod dxgi;
#[cfg(target_os = "linux")]
pub mod x11;

// ── Configuration ────────────────────────────────────────────────

/// Screen capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Target frame rate in Hz (≥ 1).
    pub frame_rate: u32,
    /// Capture region width (0 = full screen width).
    pub width: u32,
    /// Capture region height (0 = full screen height).
    pub height: u32,
    /// X offset of the capture region.
    pub offset_x: i32,
    /// Y offset of the capture region.
    pub offset_y: i32,
    /// Monitor index to capture (0 = primary).
    pub monitor_index: u32,
    /// Overlay the cursor onto captured frames.
    pub capture_cursor: bool,
    /// Use hardware acceleration where available.
    pub use_hardware_acceleration: bool,
    /// Pixel format preference (platform hint).
    pub pixel_format: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_rate: 30,
            width: 0,
            height: 0,
            offset_x: 0,
            offset_y: 0,
            monitor_index: 0,
            capture_cursor: true,
            use_hardware_acceleration: true,
            pixel_format: "BGRA".into(),
        }
    }
}

impl CaptureConfig {
    /// Reject configurations no engine could honor.
    pub(crate) fn validate(&self) -> Result<(), CaptureError> {
        if self.frame_rate == 0 {
            return Err(CaptureError::InvalidConfig("frame_rate must be >= 1".into()));
        }
        Ok(())
    }
}

/// One attached monitor.
#[derive(Debug, Clone, Default)]
pub struct ScreenInfo {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
    pub x: i32,
    pub y: i32,
    pub name: String,
    pub is_primary: bool,
}

/// Callback invoked with each captured frame, on the capture worker
/// thread. Must not block for long; fan-out is the callback's job.
pub type FrameCallback = Arc<dyn Fn(Arc<Frame>) + Send + Sync>;

// ── CaptureEngine contract ───────────────────────────────────────

/// Platform-specific capture backend.
pub trait CaptureEngine: Send {
    /// Validate the config and acquire platform handles. Refuses while
    /// capturing.
    fn initialize(&mut self, config: &CaptureConfig) -> Result<(), CaptureError>;

    /// Spawn the capture worker. Idempotent: returns `Ok` when already
    /// running.
    fn start(&mut self) -> Result<(), CaptureError>;

    /// Signal the worker to exit and join it. Platform handles are
    /// kept so `start` can be called again.
    fn stop(&mut self);

    fn is_running(&self) -> bool;

    /// Enumerate attached monitors.
    fn available_screens(&self) -> Vec<ScreenInfo>;

    /// Install the emission callback, replacing any prior one.
    fn set_frame_callback(&mut self, callback: FrameCallback);

    /// Current configuration.
    fn config(&self) -> CaptureConfig;

    /// Stop if running, re-initialize with `config`, restart if it was
    /// running.
    fn update_config(&mut self, config: &CaptureConfig) -> Result<(), CaptureError>;
}

// ── Factory ──────────────────────────────────────────────────────

/// Capture backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Technology {
    DesktopDuplication,
    X11,
    Wayland,
    CoreGraphics,
    #[default]
    Auto,
}

impl Technology {
    /// Human-readable backend name.
    pub fn display_name(self) -> &'static str {
        match self {
            Technology::DesktopDuplication => "Desktop Duplication API (Windows)",
            Technology::X11 => "X11 (Linux)",
            Technology::Wayland => "Wayland (Linux)",
            Technology::CoreGraphics => "Core Graphics (macOS)",
            Technology::Auto => "Auto-detect",
        }
    }
}

/// The best backend for the host platform.
pub fn best_available() -> Technology {
    #[cfg(target_os = "windows")]
    {
        Technology::DesktopDuplication
    }
    #[cfg(target_os = "linux")]
    {
        if std::env::var_os("DISPLAY").is_none() {
            // Likely a Wayland-only or headless session. XWayland may
            // still serve an X11 connection, so try that path anyway.
            warn!("DISPLAY is not set; Wayland capture is not implemented, attempting X11");
        }
        Technology::X11
    }
    #[cfg(not(any(target_os = "windows", target_os = "linux")))]
    {
        Technology::Auto
    }
}

/// Whether `technology` can be instantiated on this host.
pub fn is_supported(technology: Technology) -> bool {
    match technology {
        Technology::DesktopDuplication => cfg!(target_os = "windows"),
        Technology::X11 => cfg!(target_os = "linux"),
        // Reserved backends.
        Technology::Wayland | Technology::CoreGraphics => false,
        Technology::Auto => {
            let best = best_available();
            best != Technology::Auto && is_supported(best)
        }
    }
}

/// Instantiate an engine for `technology`, resolving `Auto` to the
/// best supported backend. Returns `None` when unsupported.
pub fn create_engine(technology: Technology) -> Option<Box<dyn CaptureEngine>> {
    let target = if technology == Technology::Auto {
        best_available()
    } else {
        technology
    };

    if !is_supported(target) {
        return None;
    }

    match target {
        #[cfg(target_os = "windows")]
        Technology::DesktopDuplication => Some(Box::new(dxgi::DxgiCaptureEngine::new())),
        #[cfg(target_os = "linux")]
        Technology::X11 => Some(Box::new(x11::X11CaptureEngine::new())),
        _ => None,
    }
}

// ── ScreenCapturer ───────────────────────────────────────────────

/// Pipeline source backed by a platform capture engine.
///
/// `initialize` wires the engine's frame callback into the fan-out;
/// the engine's worker thread then drives delivery.
pub struct ScreenCapturer {
    out: Arc<FanOut>,
    engine: Mutex<Box<dyn CaptureEngine>>,
    config: Mutex<CaptureConfig>,
    technology: Technology,
    initialized: AtomicBool,
}

impl ScreenCapturer {
    /// Create a capturer for the given backend. Fails with
    /// [`CaptureError::NotSupported`] when no engine is available.
    pub fn new(config: CaptureConfig, technology: Technology) -> Result<Self, CaptureError> {
        let engine = create_engine(technology).ok_or(CaptureError::NotSupported)?;
        debug!(technology = technology.display_name(), "screen capturer created");
        Ok(Self {
            out: Arc::new(FanOut::new()),
            engine: Mutex::new(engine),
            config: Mutex::new(config),
            technology,
            initialized: AtomicBool::new(false),
        })
    }

    /// Enumerate monitors via the underlying engine.
    pub fn available_screens(&self) -> Vec<ScreenInfo> {
        self.engine.lock().expect("engine poisoned").available_screens()
    }

    /// Replace the capture configuration (restarts the engine if
    /// running).
    pub fn update_config(&self, config: CaptureConfig) -> Result<(), CaptureError> {
        *self.config.lock().expect("config poisoned") = config.clone();
        self.engine
            .lock()
            .expect("engine poisoned")
            .update_config(&config)
    }

    /// Name of the selected backend.
    pub fn technology_name(&self) -> &'static str {
        self.technology.display_name()
    }
}

impl Node for ScreenCapturer {
    fn id(&self) -> u64 {
        self.out.id()
    }

    fn initialize(&self) -> bool {
        let config = self.config.lock().expect("config poisoned").clone();
        let mut engine = self.engine.lock().expect("engine poisoned");

        if let Err(e) = engine.initialize(&config) {
            warn!(error = %e, "capture engine initialization failed");
            return false;
        }

        // Captured frames flow straight into the fan-out.
        let out = Arc::clone(&self.out);
        engine.set_frame_callback(Arc::new(move |frame| out.deliver(frame)));

        self.initialized.store(true, Ordering::SeqCst);
        true
    }

    fn start(&self) -> bool {
        if !self.initialized.load(Ordering::SeqCst) {
            return false;
        }
        self.engine.lock().expect("engine poisoned").start().is_ok()
    }

    fn stop(&self) {
        self.engine.lock().expect("engine poisoned").stop();
    }

    fn is_running(&self) -> bool {
        self.engine.lock().expect("engine poisoned").is_running()
    }
}

impl Source for ScreenCapturer {
    fn output(&self) -> &FanOut {
        &self.out
    }
}

impl Drop for ScreenCapturer {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Tests ────────────────────────────────────────────────────────
