//! Behavior tracker
//!
//! Owns the activity gate, accumulator, sampler and buffer for one page load
//! and advances them from a stream of `TrackerEvent` messages. The tracker
//! performs no I/O; flushes come out as `FlushBatch` values for the delivery
//! side to send.
//!
//! Every method takes `&mut self`, so event handling, ticks and flushes are
//! serialized by ownership rather than by a lock.

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::accumulator::SignalAccumulator;
use crate::activity::ActivityGate;
use crate::buffer::LogBuffer;
use crate::config::TrackerConfig;
use crate::delivery::{FlushBatch, FlushTrigger};
use crate::features::{FeatureSampler, SampleInputs};
use crate::types::{FeatureRecord, Rect, Viewport};

/// Input messages fed to the tracker; `at_ms` is a monotonic page clock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackerEvent {
    /// Pointer moved to viewport coordinates
    PointerMove { at_ms: u64, x: f64, y: f64 },
    /// Pointer entered the document
    PointerEnter { at_ms: u64 },
    /// Pointer left the document
    PointerLeave { at_ms: u64 },
    /// Page scrolled to a vertical offset
    Scroll { at_ms: u64, offset_y: f64 },
    /// Document focus changed
    Focus { at_ms: u64, focused: bool },
    /// Page visibility changed
    Visibility { at_ms: u64, visible: bool },
    /// Viewport resized
    Resize { at_ms: u64, width: f64, height: f64 },
    /// Content region moved, appeared or disappeared
    Region {
        at_ms: u64,
        #[serde(default)]
        rect: Option<Rect>,
    },
    /// Sampling timer fired
    Tick { at_ms: u64 },
    /// Page is unloading
    Unload { at_ms: u64 },
    /// Tracking stopped explicitly (e.g. logout)
    Stop { at_ms: u64 },
}

impl TrackerEvent {
    pub fn at_ms(&self) -> u64 {
        match self {
            TrackerEvent::PointerMove { at_ms, .. }
            | TrackerEvent::PointerEnter { at_ms }
            | TrackerEvent::PointerLeave { at_ms }
            | TrackerEvent::Scroll { at_ms, .. }
            | TrackerEvent::Focus { at_ms, .. }
            | TrackerEvent::Visibility { at_ms, .. }
            | TrackerEvent::Resize { at_ms, .. }
            | TrackerEvent::Region { at_ms, .. }
            | TrackerEvent::Tick { at_ms }
            | TrackerEvent::Unload { at_ms }
            | TrackerEvent::Stop { at_ms } => *at_ms,
        }
    }
}

/// Page geometry when tracking starts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub at_ms: u64,
    pub viewport: Viewport,
    #[serde(default)]
    pub scroll_offset: f64,
    #[serde(default)]
    pub region: Option<Rect>,
}

impl PageSnapshot {
    pub fn new(at_ms: u64, viewport: Viewport) -> Self {
        Self {
            at_ms,
            viewport,
            scroll_offset: 0.0,
            region: None,
        }
    }

    pub fn with_region(mut self, region: Rect) -> Self {
        self.region = Some(region);
        self
    }

    pub fn with_scroll_offset(mut self, offset: f64) -> Self {
        self.scroll_offset = offset;
        self
    }
}

/// Engagement tracker for a single page load
#[derive(Debug, Clone)]
pub struct BehaviorTracker {
    gate: ActivityGate,
    accumulator: SignalAccumulator,
    sampler: FeatureSampler,
    buffer: LogBuffer,
    viewport: Viewport,
    region: Option<Rect>,
    stopped: bool,
    flushes: u64,
}

impl BehaviorTracker {
    pub fn new(config: &TrackerConfig, page: PageSnapshot) -> Self {
        info!(
            "behavior tracker started: tick={}ms emit={}ms flush_threshold={}",
            config.tick_interval_ms, config.emit_interval_ms, config.flush_threshold
        );
        Self {
            gate: ActivityGate::new(config.scroll_decay_ms),
            accumulator: SignalAccumulator::new(page.scroll_offset),
            sampler: FeatureSampler::new(
                page.at_ms,
                config.emit_interval_ms,
                config.reset_accumulators_on_emit,
            ),
            buffer: LogBuffer::new(config.flush_threshold, config.max_buffered_records),
            viewport: page.viewport,
            region: page.region,
            stopped: false,
            flushes: 0,
        }
    }

    /// Apply one event; returns a batch when the event triggers a flush
    pub fn handle(&mut self, event: TrackerEvent) -> Option<FlushBatch> {
        if self.stopped {
            debug!("ignoring event after stop: {event:?}");
            return None;
        }

        match event {
            TrackerEvent::PointerMove { at_ms, x, y } => {
                if self.gate.is_active(at_ms) {
                    self.accumulator.record_pointer(x, y);
                }
                None
            }
            TrackerEvent::PointerEnter { .. } => {
                self.gate.set_pointer_inside(true);
                None
            }
            TrackerEvent::PointerLeave { .. } => {
                self.gate.set_pointer_inside(false);
                None
            }
            TrackerEvent::Scroll { at_ms, offset_y } => {
                // The scroll window is refreshed before the gate is consulted
                self.gate.note_scroll(at_ms);
                if self.gate.is_active(at_ms) {
                    self.accumulator.record_scroll(offset_y);
                }
                None
            }
            TrackerEvent::Focus { focused, .. } => {
                self.gate.set_focused(focused);
                None
            }
            TrackerEvent::Visibility { visible, .. } => {
                self.gate.set_visible(visible);
                if visible {
                    None
                } else {
                    self.flush(FlushTrigger::Hidden)
                }
            }
            TrackerEvent::Resize { width, height, .. } => {
                self.viewport = Viewport::new(width, height);
                None
            }
            TrackerEvent::Region { rect, .. } => {
                self.region = rect;
                None
            }
            TrackerEvent::Tick { at_ms } => self.tick(at_ms),
            TrackerEvent::Unload { .. } => self.flush(FlushTrigger::Unload),
            TrackerEvent::Stop { .. } => self.stop(),
        }
    }

    fn tick(&mut self, at_ms: u64) -> Option<FlushBatch> {
        let inputs = SampleInputs {
            active: self.gate.is_active(at_ms),
            viewport: self.viewport,
            region: self.region,
        };
        let record = self.sampler.tick(at_ms, inputs, &mut self.accumulator)?;
        if self.buffer.push(record) {
            self.flush(FlushTrigger::Threshold)
        } else {
            None
        }
    }

    /// Drain the buffer; `None` when there is nothing to send
    pub fn flush(&mut self, trigger: FlushTrigger) -> Option<FlushBatch> {
        if self.buffer.is_empty() {
            return None;
        }
        let records = self.buffer.take();
        self.flushes += 1;
        debug!("flush #{} ({trigger:?}): {} records", self.flushes, records.len());
        Some(FlushBatch { trigger, records })
    }

    /// Return records of a failed flush to the front of the buffer
    pub fn requeue(&mut self, records: Vec<FeatureRecord>) {
        if records.is_empty() {
            return;
        }
        info!(
            "requeueing {} undelivered records ahead of {} buffered",
            records.len(),
            self.buffer.len()
        );
        self.buffer.restore_front(records);
    }

    /// Stop accepting events and drain whatever is buffered
    pub fn stop(&mut self) -> Option<FlushBatch> {
        if self.stopped {
            return None;
        }
        self.stopped = true;
        info!(
            "behavior tracker stopped after {} records ({} ms active)",
            self.sampler.emitted(),
            self.sampler.total_active_ms()
        );
        self.flush(FlushTrigger::Stop)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn is_active(&self, at_ms: u64) -> bool {
        self.gate.is_active(at_ms)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffered_records(&self) -> Vec<FeatureRecord> {
        self.buffer.records().copied().collect()
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes
    }

    pub fn total_active_ms(&self) -> u64 {
        self.sampler.total_active_ms()
    }

    pub fn accumulator(&self) -> &SignalAccumulator {
        &self.accumulator
    }
}
