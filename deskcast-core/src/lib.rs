//! # deskcast-core
//!
//! Desktop-capture media pipeline: platform capture engines feed a
//! typed source → processor → sink graph, with UDP peer discovery and
//! a process-wide service registry on the side.
//!
//! ## Architecture
//!
//! - [`frame`] — reference-counted typed frames.
//! - [`node`] — the Source/Sink/Processor capabilities and the shared
//!   fan-out.
//! - [`pipeline`] — linear chain assembly and lifecycle ordering.
//! - [`capture`] — platform capture engines behind one trait and
//!   factory.
//! - [`processors`] — scaler, pixel-format converter, encoder.
//! - [`discovery`] — UDP broadcast presence announcer/listener.
//! - [`services`] — named background services with an event bus.
//! - [`sinks`] — Y4M and raw-file recorders.
//!
//! Frames fan out by shared reference: one captured frame reaches any
//! number of sinks without copying, and a processor whose output
//! format already matches forwards the input `Arc` untouched.

pub mod capture;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod node;
pub mod pipeline;
pub mod processors;
pub mod services;
pub mod sinks;

pub use capture::{CaptureConfig, CaptureEngine, ScreenCapturer, ScreenInfo, Technology};
pub use discovery::{DiscoveryConfig, DiscoveryInfo, DiscoveryListener, DiscoveryService};
pub use error::{CaptureError, DeskError};
pub use frame::{Frame, FrameFormat};
pub use node::{FanOut, Node, Processor, Sink, Source};
pub use pipeline::Pipeline;
pub use processors::{
    ConverterConfig, EncoderConfig, PixelFormatConverter, ScalerConfig, ScalingAlgorithm,
    VideoCodec, VideoEncoder, VideoScaler,
};
pub use services::{service_manager, Service, ServiceManager, ServiceMessage};
