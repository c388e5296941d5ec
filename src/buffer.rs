//! Log buffer
//!
//! Ordered queue of feature records awaiting delivery. Insertion order is
//! chronological order. A flush swaps the whole queue out; a failed flush puts
//! its records back at the front.

use log::warn;
use std::collections::VecDeque;

use crate::types::FeatureRecord;

/// Pending feature records
#[derive(Debug, Clone)]
pub struct LogBuffer {
    records: VecDeque<FeatureRecord>,
    flush_threshold: usize,
    max_records: Option<usize>,
    dropped: u64,
}

impl LogBuffer {
    pub fn new(flush_threshold: usize, max_records: Option<usize>) -> Self {
        Self {
            records: VecDeque::with_capacity(flush_threshold),
            flush_threshold,
            max_records,
            dropped: 0,
        }
    }

    /// Append a record; returns `true` when the buffer has reached the flush threshold
    pub fn push(&mut self, record: FeatureRecord) -> bool {
        self.records.push_back(record);
        self.enforce_cap();
        self.records.len() >= self.flush_threshold
    }

    /// Hand off the current contents, leaving an empty buffer behind
    pub fn take(&mut self) -> Vec<FeatureRecord> {
        let taken = std::mem::take(&mut self.records);
        Vec::from(taken)
    }

    /// Put records from a failed flush back ahead of anything newer
    pub fn restore_front(&mut self, records: Vec<FeatureRecord>) {
        for record in records.into_iter().rev() {
            self.records.push_front(record);
        }
        self.enforce_cap();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &FeatureRecord> {
        self.records.iter()
    }

    /// Records discarded because of the optional cap
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn enforce_cap(&mut self) {
        let Some(cap) = self.max_records else {
            return;
        };
        let overflow = self.records.len().saturating_sub(cap);
        if overflow > 0 {
            self.records.drain(..overflow);
            self.dropped += overflow as u64;
            warn!(
                "log buffer over capacity ({cap}); dropped {overflow} oldest records ({} total)",
                self.dropped
            );
        }
    }
}
