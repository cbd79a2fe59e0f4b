//! Linear pipeline assembly and lifecycle.
//!
//! A [`Pipeline`] owns one source, an ordered list of processors
//! (possibly empty), and one terminal sink, and links them into a
//! chain: `source → p₀ → … → pₙ₋₁ → sink`.
//!
//! Lifecycle ordering: `start` brings up consumers before producers
//! (sink, then processors in chain order, then the source last) so
//! that downstream is ready before the first frame is emitted; `stop`
//! reverses (source first, so upstream stops emitting before
//! downstream tears down).

use std::sync::Arc;

use tracing::{debug, warn};

use crate::node::{Node, Processor, Sink, Source};

/// Assembles and drives one linear media chain.
#[derive(Default)]
pub struct Pipeline {
    source: Option<Arc<dyn Source>>,
    processors: Vec<Arc<dyn Processor>>,
    sink: Option<Arc<dyn Sink>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the producing end. Replaces any previous source.
    pub fn set_source(&mut self, source: Arc<dyn Source>) {
        self.source = Some(source);
    }

    /// Install the terminal sink. Replaces any previous sink.
    pub fn set_sink(&mut self, sink: Arc<dyn Sink>) {
        self.sink = Some(sink);
    }

    /// Append a processor; order of addition is order in the chain.
    pub fn add_processor(&mut self, processor: Arc<dyn Processor>) {
        self.processors.push(processor);
    }

    /// Whether both ends of the chain are present.
    pub fn is_connected(&self) -> bool {
        self.source.is_some() && self.sink.is_some()
    }

    /// Link `source → processors… → sink`.
    ///
    /// Requires a source and a sink; returns `false` otherwise.
    /// Existing edges are cleared first, so repeated calls never
    /// duplicate an edge.
    pub fn link_all(&mut self) -> bool {
        let (Some(source), Some(sink)) = (self.source.as_ref(), self.sink.as_ref()) else {
            warn!("link_all: pipeline needs both a source and a sink");
            return false;
        };

        self.unlink_edges();

        if self.processors.is_empty() {
            source.add_sink(Arc::clone(sink));
        } else {
            let first: Arc<dyn Sink> = self.processors[0].clone();
            source.add_sink(first);

            for pair in self.processors.windows(2) {
                let next: Arc<dyn Sink> = pair[1].clone();
                pair[0].add_sink(next);
            }

            self.processors
                .last()
                .expect("non-empty processors")
                .add_sink(Arc::clone(sink));
        }

        debug!("{}", self.pipeline_info());
        true
    }

    /// Start the chain: sink, processors in chain order, source last.
    ///
    /// Returns `false` on the first failure. Already-started components
    /// are *not* rolled back; call [`Pipeline::stop`] (idempotent) to
    /// clean up after a partial start.
    pub fn start(&self) -> bool {
        if let Some(sink) = &self.sink {
            if !sink.start() {
                warn!(sink = sink.id(), "pipeline start: sink failed to start");
                return false;
            }
        }

        for processor in &self.processors {
            if !processor.start() {
                warn!(
                    processor = processor.id(),
                    "pipeline start: processor failed to start"
                );
                return false;
            }
        }

        match &self.source {
            Some(source) => {
                if !source.start() {
                    warn!(source = source.id(), "pipeline start: source failed to start");
                    return false;
                }
                true
            }
            None => false,
        }
    }

    /// Stop the chain: source first, then processors, then the sink.
    /// Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(source) = &self.source {
            source.stop();
        }
        for processor in &self.processors {
            processor.stop();
        }
        if let Some(sink) = &self.sink {
            sink.stop();
        }
    }

    /// Clear every upstream fan-out set, leaving components in place.
    pub fn unlink_all(&mut self) {
        self.unlink_edges();
    }

    /// Unlink and drop all components.
    pub fn clear(&mut self) {
        self.unlink_edges();
        self.source = None;
        self.sink = None;
        self.processors.clear();
    }

    /// Number of owned components (source + processors + sink).
    pub fn component_count(&self) -> usize {
        usize::from(self.source.is_some())
            + self.processors.len()
            + usize::from(self.sink.is_some())
    }

    /// One-line diagnostic description of the chain.
    pub fn pipeline_info(&self) -> String {
        let mut info = String::from("Pipeline: ");
        if self.source.is_some() {
            info.push_str("Source");
        }
        if !self.processors.is_empty() {
            info.push_str(&format!(" -> {} Processor(s)", self.processors.len()));
        }
        if self.sink.is_some() {
            info.push_str(" -> Sink");
        }
        info
    }

    fn unlink_edges(&self) {
        if let Some(source) = &self.source {
            source.clear_sinks();
        }
        for processor in &self.processors {
            processor.clear_sinks();
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
