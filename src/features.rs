//! Feature sampling
//!
//! Converts accumulated raw signals into one normalized `FeatureRecord` per
//! emission interval of *active* time. The timer ticks faster than records are
//! emitted; the leftover of each interval carries into the next so that
//! active/inactive transitions do not bias elapsed time.

use log::debug;

use crate::accumulator::SignalAccumulator;
use crate::types::{FeatureRecord, Point, Rect, Viewport};

/// Decimal places kept for elapsed seconds
const ELAPSED_DECIMALS: i32 = 3;

/// Decimal places kept for every other feature
const FEATURE_DECIMALS: i32 = 10;

/// Floor for active seconds, avoids dividing by zero on the first record
const MIN_ACTIVE_SECONDS: f64 = 0.001;

/// Inputs read by the sampler at a tick
#[derive(Debug, Clone, Copy)]
pub struct SampleInputs {
    /// Activity gate result at this tick
    pub active: bool,
    /// Viewport at this tick
    pub viewport: Viewport,
    /// Content region rectangle, if the page has one
    pub region: Option<Rect>,
}

/// Sub-sampling timer state
#[derive(Debug, Clone)]
pub struct FeatureSampler {
    emit_interval_ms: u64,
    reset_on_emit: bool,
    last_check_ms: u64,
    total_active_ms: u64,
    residual_ms: u64,
    emitted: u64,
}

impl FeatureSampler {
    pub fn new(start_ms: u64, emit_interval_ms: u64, reset_on_emit: bool) -> Self {
        Self {
            emit_interval_ms,
            reset_on_emit,
            last_check_ms: start_ms,
            total_active_ms: 0,
            residual_ms: 0,
            emitted: 0,
        }
    }

    /// Process one timer tick.
    ///
    /// The wall-clock delta since the previous tick is always consumed; it only
    /// counts toward active time when the page is active.
    pub fn tick(
        &mut self,
        now_ms: u64,
        inputs: SampleInputs,
        accumulator: &mut SignalAccumulator,
    ) -> Option<FeatureRecord> {
        let delta = now_ms.saturating_sub(self.last_check_ms);
        self.last_check_ms = now_ms;

        if !inputs.active {
            return None;
        }

        self.total_active_ms += delta;
        self.residual_ms += delta;

        if self.residual_ms < self.emit_interval_ms {
            return None;
        }
        self.residual_ms -= self.emit_interval_ms;

        let record = build_record(
            self.total_active_ms,
            accumulator,
            inputs.viewport,
            inputs.region,
        );
        self.emitted += 1;
        debug!(
            "feature record #{} at {:.3}s active: mmf=({:.4}, {:.4}) msf={:.4} proximity={:.4}",
            self.emitted, record.elapsed_sec, record.mmf_x, record.mmf_y, record.msf_y, record.proximity
        );

        if self.reset_on_emit {
            accumulator.reset();
        }

        Some(record)
    }

    pub fn total_active_ms(&self) -> u64 {
        self.total_active_ms
    }

    pub fn residual_ms(&self) -> u64 {
        self.residual_ms
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

/// Build a record from the accumulator state and the geometry at emission time
pub fn build_record(
    total_active_ms: u64,
    accumulator: &SignalAccumulator,
    viewport: Viewport,
    region: Option<Rect>,
) -> FeatureRecord {
    let width = viewport.safe_width();
    let height = viewport.safe_height();
    let active_sec = (total_active_ms as f64 / 1000.0).max(MIN_ACTIVE_SECONDS);
    let pointer = accumulator.pointer();

    FeatureRecord {
        elapsed_sec: round_to(total_active_ms as f64 / 1000.0, ELAPSED_DECIMALS),
        mouse_x: round_to(pointer.x / width, FEATURE_DECIMALS),
        mouse_y: round_to(pointer.y / height, FEATURE_DECIMALS),
        mmf_x: round_to(
            compute_movement_frequency(accumulator.cumulative_x(), width, active_sec),
            FEATURE_DECIMALS,
        ),
        mmf_y: round_to(
            compute_movement_frequency(accumulator.cumulative_y(), height, active_sec),
            FEATURE_DECIMALS,
        ),
        msf_y: round_to(
            compute_movement_frequency(accumulator.cumulative_scroll(), height, active_sec),
            FEATURE_DECIMALS,
        ),
        proximity: round_to(
            region.map(|r| compute_proximity(pointer, r)).unwrap_or(0.0),
            FEATURE_DECIMALS,
        ),
    }
}

/// Running-average movement intensity
///
/// Formula: `(cumulative_distance / viewport_dimension) / total_active_seconds`
///
/// The divisor is the whole session's active time, not the emission interval.
fn compute_movement_frequency(cumulative: f64, dimension: f64, active_sec: f64) -> f64 {
    (cumulative / dimension) / active_sec
}

/// Closeness of the pointer to the content region
///
/// Formula: `1.0` inside the rectangle, otherwise `1 / (1 + d)` with `d` the
/// Euclidean distance to the nearest point of the rectangle.
pub fn compute_proximity(pointer: Point, region: Rect) -> f64 {
    if region.contains(pointer) {
        1.0
    } else {
        1.0 / (1.0 + region.distance_to(pointer))
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
