//! Frame processors: transformers sitting between a source and the
//! terminal sink.

mod converter;
mod encoder;
mod scaler;

pub use converter::{ConverterConfig, ConverterStats, PixelFormatConverter};
pub use encoder::{EncodedPacket, EncoderConfig, EncodeStats, VideoCodec, VideoEncoder};
pub use scaler::{ScalerConfig, ScalerStats, ScalingAlgorithm, VideoScaler};
