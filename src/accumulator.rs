//! Signal accumulator
//!
//! Keeps running totals of absolute pointer and scroll displacement since the
//! last reset. Callers gate events on the activity predicate before handing
//! them over; only the feature sampler resets the totals.

use serde::{Deserialize, Serialize};

use crate::types::Point;

/// Cumulative pointer/scroll displacement state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalAccumulator {
    /// Latest pointer position
    current: Point,
    /// Previous pointer position; absent until the first move
    last_pointer: Option<Point>,
    /// Sum of |dx| since reset
    cumulative_x: f64,
    /// Sum of |dy| since reset
    cumulative_y: f64,
    /// Latest vertical scroll offset
    last_scroll: f64,
    /// Sum of |d scroll| since reset
    cumulative_scroll: f64,
}

impl SignalAccumulator {
    /// Start with the page's current vertical scroll offset
    pub fn new(initial_scroll_offset: f64) -> Self {
        Self {
            last_scroll: initial_scroll_offset,
            ..Default::default()
        }
    }

    /// Record a pointer move to `(x, y)`
    pub fn record_pointer(&mut self, x: f64, y: f64) {
        if let Some(last) = self.last_pointer {
            self.cumulative_x += (x - last.x).abs();
            self.cumulative_y += (y - last.y).abs();
        }
        self.current = Point::new(x, y);
        self.last_pointer = Some(self.current);
    }

    /// Record a scroll to vertical offset `offset_y`
    pub fn record_scroll(&mut self, offset_y: f64) {
        self.cumulative_scroll += (offset_y - self.last_scroll).abs();
        self.last_scroll = offset_y;
    }

    /// Zero the cumulative totals; positions are kept
    pub fn reset(&mut self) {
        self.cumulative_x = 0.0;
        self.cumulative_y = 0.0;
        self.cumulative_scroll = 0.0;
    }

    pub fn pointer(&self) -> Point {
        self.current
    }

    pub fn cumulative_x(&self) -> f64 {
        self.cumulative_x
    }

    pub fn cumulative_y(&self) -> f64 {
        self.cumulative_y
    }

    pub fn cumulative_scroll(&self) -> f64 {
        self.cumulative_scroll
    }

    pub fn scroll_offset(&self) -> f64 {
        self.last_scroll
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_move_records_no_distance() {
        let mut acc = SignalAccumulator::new(0.0);
        acc.record_pointer(300.0, 200.0);
        assert_eq!(acc.cumulative_x(), 0.0);
        assert_eq!(acc.cumulative_y(), 0.0);
        assert_eq!(acc.pointer(), Point::new(300.0, 200.0));
    }

    #[test]
    fn test_pointer_sum_of_absolute_deltas() {
        let mut acc = SignalAccumulator::new(0.0);
        let path = [(0.0, 0.0), (10.0, 5.0), (4.0, 25.0), (4.0, 20.0)];
        for (x, y) in path {
            acc.record_pointer(x, y);
        }
        // |10| + |-6| + |0| and |5| + |20| + |-5|
        assert_eq!(acc.cumulative_x(), 16.0);
        assert_eq!(acc.cumulative_y(), 30.0);
    }

    #[test]
    fn test_scroll_starts_from_initial_offset() {
        let mut acc = SignalAccumulator::new(120.0);
        acc.record_scroll(200.0);
        acc.record_scroll(150.0);
        assert_eq!(acc.cumulative_scroll(), 130.0);
        assert_eq!(acc.scroll_offset(), 150.0);
    }

    #[test]
    fn test_reset_keeps_positions() {
        let mut acc = SignalAccumulator::new(0.0);
        acc.record_pointer(0.0, 0.0);
        acc.record_pointer(50.0, 50.0);
        acc.record_scroll(40.0);
        acc.reset();

        assert_eq!(acc.cumulative_x(), 0.0);
        assert_eq!(acc.cumulative_scroll(), 0.0);

        // Deltas continue from the last known position
        acc.record_pointer(60.0, 50.0);
        acc.record_scroll(50.0);
        assert_eq!(acc.cumulative_x(), 10.0);
        assert_eq!(acc.cumulative_scroll(), 10.0);
    }
}
