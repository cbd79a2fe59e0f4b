//! Error types for the capture pipeline.
//!
//! All fallible operations return `Result<T, DeskError>` or, for the
//! capture engines, `Result<T, CaptureError>`. No panics on invalid
//! input — every error is typed and recoverable.

use thiserror::Error;

/// Errors reported by capture engines and their factory.
///
/// Platform errors are mapped onto these variants at the FFI boundary
/// (e.g. `DXGI_ERROR_WAIT_TIMEOUT` → [`CaptureError::Timeout`],
/// `DXGI_ERROR_NOT_CURRENTLY_AVAILABLE` → [`CaptureError::AccessDenied`]).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// Platform handles could not be acquired.
    #[error("capture initialization failed: {0}")]
    Initialization(String),

    /// The supplied configuration is invalid (e.g. `frame_rate == 0`).
    #[error("invalid capture config: {0}")]
    InvalidConfig(String),

    /// No display is available (headless environment).
    #[error("no display available")]
    NoDisplay,

    /// The desktop is not accessible (session switch, secure desktop).
    #[error("desktop access denied")]
    AccessDenied,

    /// No new frame arrived within the platform deadline.
    #[error("capture timed out")]
    Timeout,

    /// The requested backend is not supported on this host.
    #[error("capture technology not supported on this platform")]
    NotSupported,

    /// `start` was called while the engine is already capturing.
    #[error("capture already started")]
    AlreadyStarted,

    /// `initialize` was called twice without an intervening teardown.
    #[error("capture already initialized")]
    AlreadyInitialized,

    /// Catch-all for unexpected platform failures.
    #[error("capture error: {0}")]
    Unknown(String),
}

// ── DeskError ────────────────────────────────────────────────────

/// The crate-wide error type for everything outside the engines.
#[derive(Debug, Error)]
pub enum DeskError {
    /// A capture engine failed.
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// The socket/file layer reported an error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A received datagram or config value could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// A component was used before `initialize`/`link_all`.
    #[error("not ready: {0}")]
    NotReady(&'static str),

    /// A service descriptor is already taken or unknown.
    #[error("service error: {0}")]
    Service(String),

    /// Catch-all.
    #[error("{0}")]
    Other(String),
}

impl From<String> for DeskError {
    fn from(s: String) -> Self {
        DeskError::Other(s)
    }
}

impl From<&str> for DeskError {
    fn from(s: &str) -> Self {
        DeskError::Other(s.to_string())
    }
}
