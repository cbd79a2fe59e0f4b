//! Video encoder processor: a bounded queue feeding a worker thread,
//! with the actual compression behind the [`VideoCodec`] trait.
//!
//! Unlike the passive processors, the encoder decouples itself from
//! the producing thread: `on_frame` enqueues without blocking and
//! drops on overflow (surfaced via `frames_dropped`), and a dedicated
//! worker drains the queue, encodes, and fans the packets out.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::frame::{Frame, FrameFormat};
use crate::node::{FanOut, Node, Processor, Sink, Source};

/// Capacity of the frame queue between `on_frame` and the worker.
const ENCODE_QUEUE_DEPTH: usize = 8;

// ── Configuration ────────────────────────────────────────────────

/// Encoder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Target bitrate in bits/second.
    pub bitrate: u32,
    /// Keyframe every N frames.
    pub keyframe_interval: u32,
    pub input_format: FrameFormat,
    pub output_format: FrameFormat,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            bitrate: 2_000_000,
            keyframe_interval: 30,
            input_format: FrameFormat::Bgra32,
            output_format: FrameFormat::H264,
        }
    }
}

// ── Codec seam ───────────────────────────────────────────────────

/// One compressed packet produced by a codec.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub data: Vec<u8>,
    pub is_keyframe: bool,
    /// Timestamp carried over from the source frame, milliseconds.
    pub timestamp: i64,
}

/// The compression backend behind [`VideoEncoder`].
///
/// Implementations wrap a real codec library; the pipeline only cares
/// about the frame-in / packets-out contract. A codec may buffer
/// internally — `flush` must return whatever is still pending.
pub trait VideoCodec: Send {
    /// Encode one raw frame; may emit zero or more packets.
    fn encode(&mut self, frame: &Frame, force_keyframe: bool) -> Vec<EncodedPacket>;

    /// Drain internally buffered packets.
    fn flush(&mut self) -> Vec<EncodedPacket>;

    /// Live bitrate adjustment.
    fn set_bitrate(&mut self, _bitrate: u32) {}
}

// ── Stats ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct EncodeStats {
    pub frames_received: u64,
    pub frames_encoded: u64,
    pub frames_dropped: u64,
    pub total_bytes_encoded: u64,
    /// EMA of per-frame encode time (α = 0.1 after the first sample).
    pub avg_encode_time: Duration,
}

// ── VideoEncoder ─────────────────────────────────────────────────

struct Worker {
    tx: Option<Sender<Arc<Frame>>>,
    handle: Option<JoinHandle<()>>,
}

/// Queue-fed encoding processor.
pub struct VideoEncoder {
    out: Arc<FanOut>,
    config: Mutex<EncoderConfig>,
    /// The codec rests here while stopped and moves into the worker
    /// while running.
    codec: Arc<Mutex<Option<Box<dyn VideoCodec>>>>,
    worker: Mutex<Worker>,
    running: AtomicBool,
    force_keyframe: Arc<AtomicBool>,
    bitrate: Arc<AtomicU32>,
    stats: Arc<Mutex<EncodeStats>>,
}

impl VideoEncoder {
    pub fn new(config: EncoderConfig, codec: Box<dyn VideoCodec>) -> Self {
        let bitrate = config.bitrate;
        Self {
            out: Arc::new(FanOut::new()),
            config: Mutex::new(config),
            codec: Arc::new(Mutex::new(Some(codec))),
            worker: Mutex::new(Worker {
                tx: None,
                handle: None,
            }),
            running: AtomicBool::new(false),
            force_keyframe: Arc::new(AtomicBool::new(false)),
            bitrate: Arc::new(AtomicU32::new(bitrate)),
            stats: Arc::new(Mutex::new(EncodeStats::default())),
        }
    }

    /// Request that the next encoded frame be a keyframe.
    pub fn force_keyframe(&self) {
        self.force_keyframe.store(true, Ordering::SeqCst);
    }

    /// Adjust the target bitrate without restarting.
    pub fn set_bitrate(&self, bitrate: u32) {
        self.bitrate.store(bitrate, Ordering::SeqCst);
        self.config.lock().expect("encoder config poisoned").bitrate = bitrate;
    }

    /// Replace the configuration; restarts the worker if running.
    pub fn update_config(&self, config: EncoderConfig) -> bool {
        let was_running = self.is_running();
        if was_running {
            self.stop();
        }
        self.bitrate.store(config.bitrate, Ordering::SeqCst);
        *self.config.lock().expect("encoder config poisoned") = config;
        if was_running {
            return Node::start(self);
        }
        true
    }

    /// Snapshot of the running statistics.
    pub fn stats(&self) -> EncodeStats {
        self.stats.lock().expect("encoder stats poisoned").clone()
    }

    pub fn config(&self) -> EncoderConfig {
        self.config.lock().expect("encoder config poisoned").clone()
    }
}

impl Node for VideoEncoder {
    fn id(&self) -> u64 {
        self.out.id()
    }

    fn initialize(&self) -> bool {
        let config = self.config.lock().expect("encoder config poisoned");
        if config.width == 0 || config.height == 0 || config.fps == 0 {
            error!(
                width = config.width,
                height = config.height,
                fps = config.fps,
                "invalid encoder config"
            );
            return false;
        }
        if !config.output_format.is_video() {
            error!(format = config.output_format.name(), "encoder output must be a video format");
            return false;
        }
        true
    }

    fn start(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return true;
        }

        let Some(mut codec) = self.codec.lock().expect("codec slot poisoned").take() else {
            error!("encoder has no codec installed");
            self.running.store(false, Ordering::SeqCst);
            return false;
        };

        let (tx, rx) = bounded::<Arc<Frame>>(ENCODE_QUEUE_DEPTH);
        let out = Arc::clone(&self.out);
        let codec_slot = Arc::clone(&self.codec);
        let stats = Arc::clone(&self.stats);
        let force_keyframe = Arc::clone(&self.force_keyframe);
        let bitrate = Arc::clone(&self.bitrate);
        let config = self.config.lock().expect("encoder config poisoned").clone();

        let handle = std::thread::Builder::new()
            .name("deskcast-encoder".into())
            .spawn(move || {
                let mut current_bitrate = bitrate.load(Ordering::SeqCst);
                codec.set_bitrate(current_bitrate);

                // Drains until every sender is dropped (stop()).
                while let Ok(frame) = rx.recv() {
                    let wanted = bitrate.load(Ordering::SeqCst);
                    if wanted != current_bitrate {
                        codec.set_bitrate(wanted);
                        current_bitrate = wanted;
                    }

                    let force = force_keyframe.swap(false, Ordering::SeqCst);
                    let started = Instant::now();
                    let packets = codec.encode(&frame, force);
                    let elapsed = started.elapsed();

                    {
                        let mut stats = stats.lock().expect("encoder stats poisoned");
                        stats.frames_encoded += 1;
                        if stats.frames_encoded == 1 {
                            stats.avg_encode_time = elapsed;
                        } else {
                            let avg = stats.avg_encode_time.as_secs_f64() * 0.9
                                + elapsed.as_secs_f64() * 0.1;
                            stats.avg_encode_time = Duration::from_secs_f64(avg);
                        }
                        stats.total_bytes_encoded +=
                            packets.iter().map(|p| p.data.len() as u64).sum::<u64>();
                    }

                    for packet in packets {
                        deliver_packet(&out, &config, packet);
                    }
                }

                // Queue closed: flush whatever the codec still holds.
                for packet in codec.flush() {
                    deliver_packet(&out, &config, packet);
                }

                *codec_slot.lock().expect("codec slot poisoned") = Some(codec);
                debug!("encoder worker exited");
            })
            .expect("failed to spawn encoder worker");

        let mut worker = self.worker.lock().expect("encoder worker poisoned");
        worker.tx = Some(tx);
        worker.handle = Some(handle);
        true
    }

    /// Stop the worker: close the queue, let it drain and flush, join.
    fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let (tx, handle) = {
            let mut worker = self.worker.lock().expect("encoder worker poisoned");
            (worker.tx.take(), worker.handle.take())
        };
        drop(tx);
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("encoder worker panicked");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Source for VideoEncoder {
    fn output(&self) -> &FanOut {
        &self.out
    }
}

impl Sink for VideoEncoder {
    fn on_frame(&self, frame: Arc<Frame>) {
        if !self.is_running() {
            return;
        }
        if !frame.is_valid() || !frame.is_video() {
            self.stats.lock().expect("encoder stats poisoned").frames_dropped += 1;
            return;
        }

        self.stats.lock().expect("encoder stats poisoned").frames_received += 1;

        let worker = self.worker.lock().expect("encoder worker poisoned");
        let Some(tx) = worker.tx.as_ref() else {
            return;
        };
        match tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.stats.lock().expect("encoder stats poisoned").frames_dropped += 1;
                warn!("encoder queue full, frame dropped");
            }
        }
    }
}

impl Processor for VideoEncoder {}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wrap one packet into a frame and fan it out.
fn deliver_packet(out: &FanOut, config: &EncoderConfig, packet: EncodedPacket) {
    let mut frame = Frame::video(config.output_format, config.width, config.height, packet.data);
    frame.timestamp = packet.timestamp;
    frame.video.framerate = config.fps;
    frame.video.is_keyframe = packet.is_keyframe;
    out.deliver(frame.share());
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::next_node_id;
    use std::sync::Mutex as StdMutex;

    /// Codec that "compresses" by recording the first byte of each
    /// frame, marking keyframes on the configured interval.
    struct MockCodec {
        interval: u32,
        count: u32,
        pending: Vec<EncodedPacket>,
        bitrates: Vec<u32>,
    }

    impl MockCodec {
        fn new(interval: u32) -> Self {
            Self {
                interval,
                count: 0,
                pending: Vec::new(),
                bitrates: Vec::new(),
            }
        }
    }

    impl VideoCodec for MockCodec {
        fn encode(&mut self, frame: &Frame, force_keyframe: bool) -> Vec<EncodedPacket> {
            let keyframe = force_keyframe || self.count % self.interval == 0;
            self.count += 1;
            vec![EncodedPacket {
                data: vec![frame.data()[0], 0xEE],
                is_keyframe: keyframe,
                timestamp: frame.timestamp,
            }]
        }

        fn flush(&mut self) -> Vec<EncodedPacket> {
            std::mem::take(&mut self.pending)
        }

        fn set_bitrate(&mut self, bitrate: u32) {
            self.bitrates.push(bitrate);
        }
    }

    struct PacketSink {
        id: u64,
        frames: StdMutex<Vec<Arc<Frame>>>,
    }

    impl PacketSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: next_node_id(),
                frames: StdMutex::new(Vec::new()),
            })
        }

        fn frames(&self) -> Vec<Arc<Frame>> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl Node for PacketSink {
        fn id(&self) -> u64 {
            self.id
        }
    }

    impl Sink for PacketSink {
        fn on_frame(&self, frame: Arc<Frame>) {
            self.frames.lock().unwrap().push(frame);
        }
    }

    fn raw_frame(first_byte: u8) -> Arc<Frame> {
        let mut data = vec![0u8; 4 * 4 * 4];
        data[0] = first_byte;
        Frame::video(FrameFormat::Bgra32, 4, 4, data).share()
    }

    fn encoder_with_sink(interval: u32) -> (Arc<VideoEncoder>, Arc<PacketSink>) {
        let enc = Arc::new(VideoEncoder::new(
            EncoderConfig {
                width: 4,
                height: 4,
                keyframe_interval: interval,
                ..EncoderConfig::default()
            },
            Box::new(MockCodec::new(interval)),
        ));
        let sink = PacketSink::new();
        enc.add_sink(Arc::clone(&sink) as Arc<dyn Sink>);
        (enc, sink)
    }

    fn wait_for(sink: &PacketSink, n: usize) {
        for _ in 0..200 {
            if sink.frames.lock().unwrap().len() >= n {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for {n} packets");
    }

    #[test]
    fn encodes_and_emits_packets() {
        let (enc, sink) = encoder_with_sink(30);
        assert!(enc.initialize());
        assert!(Node::start(enc.as_ref()));

        enc.on_frame(raw_frame(0xAB));
        wait_for(&sink, 1);
        enc.stop();

        let packets = sink.frames();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].format, FrameFormat::H264);
        assert_eq!(packets[0].data(), &[0xAB, 0xEE]);
        assert!(packets[0].video.is_keyframe, "first frame is a keyframe");
        assert_eq!(enc.stats().frames_encoded, 1);
    }

    #[test]
    fn stop_drains_the_queue() {
        let (enc, sink) = encoder_with_sink(1000);
        Node::start(enc.as_ref());

        for i in 0..5 {
            enc.on_frame(raw_frame(i));
        }
        enc.stop();

        // Everything accepted into the queue was encoded before stop
        // returned.
        let stats = enc.stats();
        assert_eq!(
            stats.frames_received - stats.frames_dropped,
            sink.frames().len() as u64
        );
    }

    #[test]
    fn force_keyframe_marks_next_packet() {
        let (enc, sink) = encoder_with_sink(1000);
        Node::start(enc.as_ref());

        enc.on_frame(raw_frame(1));
        wait_for(&sink, 1);
        enc.force_keyframe();
        enc.on_frame(raw_frame(2));
        wait_for(&sink, 2);
        enc.stop();

        let packets = sink.frames();
        assert!(packets[0].video.is_keyframe, "interval keyframe");
        assert!(packets[1].video.is_keyframe, "forced keyframe");
    }

    #[test]
    fn ignores_frames_while_stopped() {
        let (enc, sink) = encoder_with_sink(30);
        enc.on_frame(raw_frame(1));
        assert_eq!(sink.frames().len(), 0);
        assert_eq!(enc.stats().frames_received, 0);
    }

    #[test]
    fn start_is_idempotent() {
        let (enc, _sink) = encoder_with_sink(30);
        assert!(Node::start(enc.as_ref()));
        assert!(Node::start(enc.as_ref()));
        assert!(enc.is_running());
        enc.stop();
        enc.stop();
        assert!(!enc.is_running());
    }

    #[test]
    fn restart_after_stop() {
        let (enc, sink) = encoder_with_sink(30);
        Node::start(enc.as_ref());
        enc.on_frame(raw_frame(1));
        wait_for(&sink, 1);
        enc.stop();

        assert!(Node::start(enc.as_ref()), "codec returns to the slot on stop");
        enc.on_frame(raw_frame(2));
        wait_for(&sink, 2);
        enc.stop();
    }

    #[test]
    fn invalid_frames_counted_as_dropped() {
        let (enc, _sink) = encoder_with_sink(30);
        Node::start(enc.as_ref());
        enc.on_frame(Frame::empty().share());
        enc.stop();
        assert_eq!(enc.stats().frames_dropped, 1);
    }

    #[test]
    fn initialize_validates_config() {
        let enc = VideoEncoder::new(
            EncoderConfig {
                fps: 0,
                ..EncoderConfig::default()
            },
            Box::new(MockCodec::new(30)),
        );
        assert!(!enc.initialize());

        let enc = VideoEncoder::new(
            EncoderConfig {
                output_format: FrameFormat::Opus,
                ..EncoderConfig::default()
            },
            Box::new(MockCodec::new(30)),
        );
        assert!(!enc.initialize());
    }
}
