//! Desktop Duplication capture engine (Windows).
//!
//! Wraps the `IDXGIOutputDuplication` pipeline:
//!
//! 1. Create a D3D11 device (feature levels 11.1 → 10.0).
//! 2. Traverse DXGI device → adapter → output at `monitor_index` and
//!    duplicate it.
//! 3. Create a CPU-readable staging texture.
//! 4. Per frame: `AcquireNextFrame`, copy to staging, map, repack the
//!    rows into a tight BGRA32 buffer, unmap, release.
//!
//! All unsafe FFI is confined to this module. The D3D session moves
//! into the worker thread on `start` and returns when it exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};
use windows::core::Interface;
use windows::Win32::Graphics::Direct3D::{
    D3D_DRIVER_TYPE_HARDWARE, D3D_FEATURE_LEVEL, D3D_FEATURE_LEVEL_10_0, D3D_FEATURE_LEVEL_10_1,
    D3D_FEATURE_LEVEL_11_0, D3D_FEATURE_LEVEL_11_1,
};
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D,
    D3D11_CPU_ACCESS_READ, D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_MAPPED_SUBRESOURCE,
    D3D11_MAP_READ, D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::{
    CreateDXGIFactory1, IDXGIAdapter1, IDXGIDevice, IDXGIFactory1, IDXGIOutput, IDXGIOutput1,
    IDXGIOutputDuplication, IDXGIResource, DXGI_ERROR_ACCESS_LOST, DXGI_ERROR_DEVICE_REMOVED,
    DXGI_ERROR_NOT_CURRENTLY_AVAILABLE, DXGI_ERROR_NOT_FOUND, DXGI_ERROR_WAIT_TIMEOUT,
    DXGI_OUTDUPL_FRAME_INFO, DXGI_OUTPUT_DESC,
};

use crate::error::CaptureError;
use crate::frame::{monotonic_ms, Frame, FrameFormat};

use super::{CaptureConfig, CaptureEngine, FrameCallback, ScreenInfo};

/// How long one `AcquireNextFrame` may block.
const ACQUIRE_TIMEOUT_MS: u32 = 1000;

const FEATURE_LEVELS: [D3D_FEATURE_LEVEL; 4] = [
    D3D_FEATURE_LEVEL_11_1,
    D3D_FEATURE_LEVEL_11_0,
    D3D_FEATURE_LEVEL_10_1,
    D3D_FEATURE_LEVEL_10_0,
];

// ── DxgiSession ──────────────────────────────────────────────────

/// Live duplication state: device, duplication handle, staging
/// texture, output geometry.
struct DxgiSession {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    duplication: IDXGIOutputDuplication,
    staging: ID3D11Texture2D,
    width: u32,
    height: u32,
}

impl DxgiSession {
    fn open(config: &CaptureConfig) -> Result<Self, CaptureError> {
        // 1. D3D11 device + immediate context.
        let mut device = None;
        let mut context = None;
        unsafe {
            D3D11CreateDevice(
                None,
                D3D_DRIVER_TYPE_HARDWARE,
                None,
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                Some(&FEATURE_LEVELS),
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
            .map_err(|e| CaptureError::Initialization(format!("D3D11CreateDevice: {e}")))?;
        }
        let device =
            device.ok_or_else(|| CaptureError::Initialization("D3D11 device is None".into()))?;
        let context =
            context.ok_or_else(|| CaptureError::Initialization("D3D11 context is None".into()))?;

        // 2. DXGI device → adapter → output at monitor_index.
        let dxgi_device: IDXGIDevice = device
            .cast()
            .map_err(|e| CaptureError::Initialization(format!("cast IDXGIDevice: {e}")))?;
        let adapter = unsafe {
            dxgi_device
                .GetAdapter()
                .map_err(|e| CaptureError::Initialization(format!("GetAdapter: {e}")))?
        };
        let output: IDXGIOutput = unsafe {
            adapter.EnumOutputs(config.monitor_index).map_err(|e| {
                CaptureError::Initialization(format!(
                    "EnumOutputs({}): {e}",
                    config.monitor_index
                ))
            })?
        };

        // 3. Duplicate the output.
        let output1: IDXGIOutput1 = output
            .cast()
            .map_err(|e| CaptureError::Initialization(format!("cast IDXGIOutput1: {e}")))?;
        let duplication = unsafe {
            output1.DuplicateOutput(&device).map_err(|e| {
                if e.code() == DXGI_ERROR_NOT_CURRENTLY_AVAILABLE {
                    CaptureError::AccessDenied
                } else {
                    CaptureError::Initialization(format!("DuplicateOutput: {e}"))
                }
            })?
        };

        let dup_desc = unsafe { duplication.GetDesc() };
        let width = dup_desc.ModeDesc.Width;
        let height = dup_desc.ModeDesc.Height;

        // 4. CPU-readable staging texture.
        let staging_desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags: 0,
        };
        let mut staging = None;
        unsafe {
            device
                .CreateTexture2D(&staging_desc, None, Some(&mut staging))
                .map_err(|e| {
                    CaptureError::Initialization(format!("CreateTexture2D (staging): {e}"))
                })?;
        }
        let staging =
            staging.ok_or_else(|| CaptureError::Initialization("staging texture is None".into()))?;

        debug!(width, height, "desktop duplication session opened");
        Ok(Self {
            device,
            context,
            duplication,
            staging,
            width,
            height,
        })
    }

    /// Acquire and repack the next desktop frame.
    ///
    /// `Ok(None)` means nothing new within the deadline (timeout or an
    /// unchanged desktop); the caller simply tries again.
    fn capture_one_frame(&self, frame_rate: u32) -> Result<Option<Frame>, CaptureError> {
        let mut frame_info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource: Option<IDXGIResource> = None;

        match unsafe {
            self.duplication
                .AcquireNextFrame(ACQUIRE_TIMEOUT_MS, &mut frame_info, &mut resource)
        } {
            Ok(()) => {}
            Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => return Ok(None),
            Err(e)
                if e.code() == DXGI_ERROR_ACCESS_LOST
                    || e.code() == DXGI_ERROR_NOT_CURRENTLY_AVAILABLE =>
            {
                return Err(CaptureError::AccessDenied);
            }
            Err(e) if e.code() == DXGI_ERROR_DEVICE_REMOVED => {
                return Err(CaptureError::Initialization("device removed".into()));
            }
            Err(e) => return Err(CaptureError::Unknown(format!("AcquireNextFrame: {e}"))),
        }

        // A zero present time is a mouse-only update with no new
        // desktop image.
        if frame_info.LastPresentTime == 0 {
            let _ = unsafe { self.duplication.ReleaseFrame() };
            return Ok(None);
        }

        let resource = match resource {
            Some(r) => r,
            None => {
                let _ = unsafe { self.duplication.ReleaseFrame() };
                return Err(CaptureError::Unknown("acquired resource is None".into()));
            }
        };

        let texture: ID3D11Texture2D = match resource.cast() {
            Ok(t) => t,
            Err(e) => {
                let _ = unsafe { self.duplication.ReleaseFrame() };
                return Err(CaptureError::Unknown(format!("cast ID3D11Texture2D: {e}")));
            }
        };

        unsafe {
            self.context.CopyResource(&self.staging, &texture);
            // Release the DXGI frame as early as possible.
            let _ = self.duplication.ReleaseFrame();
        }

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe {
            self.context
                .Map(&self.staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
                .map_err(|e| CaptureError::Unknown(format!("Map staging: {e}")))?;
        }

        let row_bytes = self.width as usize * 4;
        let src_stride = mapped.RowPitch as usize;
        let mut data = Vec::with_capacity(row_bytes * self.height as usize);
        unsafe {
            let src = std::slice::from_raw_parts(
                mapped.pData as *const u8,
                src_stride * self.height as usize,
            );
            if src_stride == row_bytes {
                data.extend_from_slice(src);
            } else {
                for y in 0..self.height as usize {
                    let start = y * src_stride;
                    data.extend_from_slice(&src[start..start + row_bytes]);
                }
            }
            self.context.Unmap(&self.staging, 0);
        }

        let mut frame = Frame::video(FrameFormat::Bgra32, self.width, self.height, data);
        frame.timestamp = monotonic_ms();
        frame.video.framerate = frame_rate;
        frame.video.stride = row_bytes as u32;
        // TODO: overlay the cursor shape when capture_cursor is set
        // (needs DXGI_OUTDUPL_POINTER_SHAPE handling).
        Ok(Some(frame))
    }
}

// ── DxgiCaptureEngine ────────────────────────────────────────────

/// Desktop Duplication capture backend.
pub struct DxgiCaptureEngine {
    config: CaptureConfig,
    frame_interval: Duration,
    callback: Arc<Mutex<Option<FrameCallback>>>,
    session: Arc<Mutex<Option<DxgiSession>>>,
    should_stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    running: bool,
}

impl DxgiCaptureEngine {
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
}

impl Default for DxgiCaptureEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureEngine for DxgiCaptureEngine {
    fn initialize(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        if self.running {
            return Err(CaptureError::AlreadyStarted);
        }
        config.validate()?;

        let session = DxgiSession::open(config)?;
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
                "desktop duplication not initialized".into(),
            ));
        };

        self.should_stop.store(false, Ordering::SeqCst);

        let interval = self.frame_interval;
        let callback = Arc::clone(&self.callback);
        let slot = Arc::clone(&self.session);
        let should_stop = Arc::clone(&self.should_stop);
        let frame_rate = self.config.frame_rate;

        let handle = std::thread::Builder::new()
            .name("deskcast-dxgi-capture".into())
            .spawn(move || {
                capture_loop(session, interval, frame_rate, callback, should_stop, slot);
            })
            .map_err(|e| CaptureError::Initialization(format!("spawn capture worker: {e}")))?;

        self.worker = Some(handle);
        self.running = true;
        debug!("desktop duplication capture started");
        Ok(())
    }

    fn stop(&mut self) {
        if !self.running {
            return;
        }

        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("DXGI capture worker panicked");
            }
        }
        self.running = false;
        debug!("desktop duplication capture stopped");
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn available_screens(&self) -> Vec<ScreenInfo> {
        let mut screens = Vec::new();

        let factory: IDXGIFactory1 = match unsafe { CreateDXGIFactory1() } {
            Ok(f) => f,
            Err(_) => return screens,
        };

        let mut adapter_idx = 0u32;
        loop {
            let adapter: IDXGIAdapter1 = match unsafe { factory.EnumAdapters1(adapter_idx) } {
                Ok(a) => a,
                Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => break,
                Err(_) => break,
            };

            let mut output_idx = 0u32;
            loop {
                let output = match unsafe { adapter.EnumOutputs(output_idx) } {
                    Ok(o) => o,
                    Err(_) => break,
                };

                let mut desc = DXGI_OUTPUT_DESC::default();
                if unsafe { output.GetDesc(&mut desc) }.is_ok() {
                    let rect = desc.DesktopCoordinates;
                    let name_len = desc
                        .DeviceName
                        .iter()
                        .position(|&c| c == 0)
                        .unwrap_or(desc.DeviceName.len());
                    screens.push(ScreenInfo {
                        id: screens.len() as u32,
                        width: (rect.right - rect.left) as u32,
                        height: (rect.bottom - rect.top) as u32,
                        bits_per_pixel: 32,
                        x: rect.left,
                        y: rect.top,
                        name: String::from_utf16_lossy(&desc.DeviceName[..name_len]),
                        is_primary: adapter_idx == 0 && output_idx == 0,
                    });
                }
                output_idx += 1;
            }
            adapter_idx += 1;
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

impl Drop for DxgiCaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Worker ───────────────────────────────────────────────────────

fn capture_loop(
    session: DxgiSession,
    interval: Duration,
    frame_rate: u32,
    callback: Arc<Mutex<Option<FrameCallback>>>,
    should_stop: Arc<AtomicBool>,
    slot: Arc<Mutex<Option<DxgiSession>>>,
) {
    debug!("DXGI capture loop started");
    let mut last_frame = Instant::now();

    while !should_stop.load(Ordering::SeqCst) {
        if last_frame.elapsed() >= interval {
            match session.capture_one_frame(frame_rate) {
                Ok(Some(frame)) => {
                    let cb = callback.lock().expect("callback poisoned").clone();
                    if let Some(cb) = cb {
                        cb(frame.share());
                    }
                }
                Ok(None) => {}
                Err(CaptureError::AccessDenied) => {
                    // Desktop switch or exclusive-mode app; the handle
                    // must be rebuilt via update_config.
                    warn!("desktop access lost; call update_config to rebuild duplication");
                }
                Err(e) => warn!(error = %e, "capture failed"),
            }
            last_frame = Instant::now();
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    *slot.lock().expect("session slot poisoned") = Some(session);
    debug!("DXGI capture loop ended");
}
