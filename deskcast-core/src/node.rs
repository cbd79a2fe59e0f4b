//! Node graph primitives: sources, sinks, processors, and fan-out.
//!
//! The graph has three capabilities:
//!
//! - [`Source`] produces frames and owns a [`FanOut`] of downstream sinks.
//! - [`Sink`] consumes frames via [`Sink::on_frame`].
//! - [`Processor`] is both: a sink whose `on_frame` publishes derived
//!   frames through its own source side.
//!
//! All nodes are shared as `Arc<dyn …>` and use interior mutability;
//! lifecycle methods take `&self`. Processors are passive by default —
//! `start`/`stop` are no-ops and `is_running` reports ready — and only
//! nodes with internal workers override them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::frame::Frame;

// ── Node identity ────────────────────────────────────────────────

static NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique node ID. IDs are purely diagnostic.
pub fn next_node_id() -> u64 {
    NODE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Common node surface: identity plus uniform lifecycle.
pub trait Node: Send + Sync {
    /// Stable process-unique identifier.
    fn id(&self) -> u64;

    /// Prepare resources. Default: nothing to do.
    fn initialize(&self) -> bool {
        true
    }

    /// Begin accepting/producing frames. Default: always ready.
    fn start(&self) -> bool {
        true
    }

    /// Stop accepting/producing frames. Idempotent.
    fn stop(&self) {}

    /// Whether the node is currently running.
    fn is_running(&self) -> bool {
        true
    }
}

/// A frame consumer.
pub trait Sink: Node {
    /// Receive one shared frame.
    ///
    /// Called on the producing thread; implementations must be
    /// reentrant or serialize internally, must not panic, and should
    /// ignore frames while not running.
    fn on_frame(&self, frame: Arc<Frame>);
}

/// A frame producer. The fan-out list lives in the embedded [`FanOut`];
/// the trait forwards the structural operations to it.
pub trait Source: Node {
    /// The source's fan-out set.
    fn output(&self) -> &FanOut;

    /// Attach a sink. Duplicates (by node ID) are ignored.
    fn add_sink(&self, sink: Arc<dyn Sink>) {
        self.output().add_sink(sink);
    }

    /// Detach a sink by identity.
    fn remove_sink(&self, sink: &dyn Sink) {
        self.output().remove_sink(sink.id());
    }

    /// Detach every sink.
    fn clear_sinks(&self) {
        self.output().clear_sinks();
    }

    /// Number of attached sinks.
    fn sink_count(&self) -> usize {
        self.output().sink_count()
    }

    /// Whether any sink is attached.
    fn has_sinks(&self) -> bool {
        self.output().has_sinks()
    }
}

/// A node that is both sink and source.
pub trait Processor: Source + Sink {}

// ── FanOut ───────────────────────────────────────────────────────

/// The one concrete fan-out implementation shared by every source.
///
/// An ordered sink list behind a reader-writer lock: delivery walks the
/// list under the read lock, structural changes take the write lock.
/// [`FanOut::deliver`] hands the *same* `Arc<Frame>` to every sink in
/// insertion order — zero-copy fan-out.
pub struct FanOut {
    id: u64,
    sinks: RwLock<Vec<Arc<dyn Sink>>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self {
            id: next_node_id(),
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// The owning node's identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Append a sink unless one with the same ID is already attached.
    pub fn add_sink(&self, sink: Arc<dyn Sink>) {
        let mut sinks = self.sinks.write().expect("sink list poisoned");
        if sinks.iter().any(|s| s.id() == sink.id()) {
            return;
        }
        debug!(source = self.id, sink = sink.id(), "add sink");
        sinks.push(sink);
    }

    /// Remove the sink with the given ID, if attached.
    pub fn remove_sink(&self, sink_id: u64) {
        let mut sinks = self.sinks.write().expect("sink list poisoned");
        if let Some(pos) = sinks.iter().position(|s| s.id() == sink_id) {
            debug!(source = self.id, sink = sink_id, "remove sink");
            sinks.remove(pos);
        }
    }

    /// Drop every attached sink.
    pub fn clear_sinks(&self) {
        let mut sinks = self.sinks.write().expect("sink list poisoned");
        let count = sinks.len();
        sinks.clear();
        debug!(source = self.id, count, "clear sinks");
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.read().expect("sink list poisoned").len()
    }

    pub fn has_sinks(&self) -> bool {
        !self.sinks.read().expect("sink list poisoned").is_empty()
    }

    /// Deliver one frame to every attached sink, in insertion order.
    ///
    /// Invalid frames are dropped silently — producers may legitimately
    /// probe with empty frames. The sink list is held under the shared
    /// lock for the duration of delivery, so structural changes wait
    /// until the walk completes.
    pub fn deliver(&self, frame: Arc<Frame>) {
        if !frame.is_valid() {
            return;
        }

        let sinks = self.sinks.read().expect("sink list poisoned");
        for sink in sinks.iter() {
            sink.on_frame(Arc::clone(&frame));
        }
    }
}

impl Default for FanOut {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameFormat;
    use std::sync::Mutex;

    /// Records delivery order into a shared log.
    struct ProbeSink {
        id: u64,
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl ProbeSink {
        fn new(label: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
            Arc::new(Self {
                id: next_node_id(),
                label,
                log,
            })
        }
    }

    impl Node for ProbeSink {
        fn id(&self) -> u64 {
            self.id
        }
    }

    impl Sink for ProbeSink {
        fn on_frame(&self, _frame: Arc<Frame>) {
            self.log.lock().unwrap().push(self.label);
        }
    }

    fn test_frame() -> Arc<Frame> {
        Frame::video(FrameFormat::Bgra32, 2, 2, vec![0x7F; 16]).share()
    }

    #[test]
    fn delivers_in_insertion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let out = FanOut::new();
        out.add_sink(ProbeSink::new("a", Arc::clone(&log)));
        out.add_sink(ProbeSink::new("b", Arc::clone(&log)));
        out.add_sink(ProbeSink::new("c", Arc::clone(&log)));

        out.deliver(test_frame());
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn rejects_duplicate_sinks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let out = FanOut::new();
        let sink = ProbeSink::new("a", Arc::clone(&log));

        out.add_sink(Arc::clone(&sink) as Arc<dyn Sink>);
        out.add_sink(sink as Arc<dyn Sink>);
        assert_eq!(out.sink_count(), 1);
    }

    #[test]
    fn remove_and_clear() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let out = FanOut::new();
        let a = ProbeSink::new("a", Arc::clone(&log));
        let b = ProbeSink::new("b", Arc::clone(&log));
        out.add_sink(Arc::clone(&a) as Arc<dyn Sink>);
        out.add_sink(b as Arc<dyn Sink>);

        out.remove_sink(a.id());
        assert_eq!(out.sink_count(), 1);

        out.clear_sinks();
        assert_eq!(out.sink_count(), 0);
        assert!(!out.has_sinks());
    }

    #[test]
    fn invalid_frames_are_dropped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let out = FanOut::new();
        out.add_sink(ProbeSink::new("a", Arc::clone(&log)));

        out.deliver(Frame::empty().share());
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn same_reference_reaches_every_sink() {
        struct PtrSink {
            id: u64,
            seen: Mutex<Vec<*const Frame>>,
        }
        unsafe impl Send for PtrSink {}
        unsafe impl Sync for PtrSink {}
        impl Node for PtrSink {
            fn id(&self) -> u64 {
                self.id
            }
        }
        impl Sink for PtrSink {
            fn on_frame(&self, frame: Arc<Frame>) {
                self.seen.lock().unwrap().push(Arc::as_ptr(&frame));
            }
        }

        let sink = Arc::new(PtrSink {
            id: next_node_id(),
            seen: Mutex::new(Vec::new()),
        });
        let out = FanOut::new();
        out.add_sink(Arc::clone(&sink) as Arc<dyn Sink>);

        let frame = test_frame();
        let expected = Arc::as_ptr(&frame);
        out.deliver(Arc::clone(&frame));
        out.deliver(frame);

        let seen = sink.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|p| *p == expected));
    }

    #[test]
    fn ids_are_unique() {
        let a = next_node_id();
        let b = next_node_id();
        assert_ne!(a, b);
    }
}
