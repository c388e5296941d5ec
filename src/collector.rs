//! Behavior collector
//!
//! Receiving side of the behavior endpoint. Each payload is flattened into one
//! stored document per record, using the field names of the behavior index.
//! Deliveries may repeat (a beacon that actually arrived followed by a requeued
//! resend) and may arrive out of order, so records already seen for a session
//! are skipped and searches sort on read.

use chrono::{DateTime, FixedOffset, Offset, SubsecRound, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::TrackerError;
use crate::types::DeliveryPayload;

/// Offset applied to `stored_time` (KST)
pub const STORED_TIME_OFFSET_SECS: i32 = 9 * 3600;

/// One stored record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorDocument {
    pub user_id: String,
    pub news_id: String,
    #[serde(rename = "MMF_X_inf")]
    pub mmf_x: f64,
    #[serde(rename = "MMF_Y_inf")]
    pub mmf_y: f64,
    #[serde(rename = "MSF_Y_inf")]
    pub msf_y: f64,
    #[serde(rename = "mouseX")]
    pub mouse_x: f64,
    #[serde(rename = "mouseY")]
    pub mouse_y: f64,
    /// Whole seconds of active time
    pub timestamp: u64,
    pub baseline: f64,
    pub stored_time: DateTime<FixedOffset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
}

/// Result of ingesting one payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub duplicates: usize,
}

/// In-memory behavior store
#[derive(Debug, Default)]
pub struct BehaviorCollector {
    documents: Vec<CollectorDocument>,
    seen: HashSet<(Uuid, u64)>,
}

fn stored_time_offset() -> FixedOffset {
    FixedOffset::east_opt(STORED_TIME_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

impl BehaviorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest a raw request body
    pub fn ingest_json(&mut self, body: &str) -> Result<IngestReport, TrackerError> {
        let payload: DeliveryPayload = serde_json::from_str(body)?;
        self.ingest(&payload)
    }

    /// Ingest a payload stamped with the current time
    pub fn ingest(&mut self, payload: &DeliveryPayload) -> Result<IngestReport, TrackerError> {
        let now = Utc::now().with_timezone(&stored_time_offset());
        self.ingest_at(payload, now)
    }

    /// Ingest a payload with an explicit `stored_time`
    pub fn ingest_at(
        &mut self,
        payload: &DeliveryPayload,
        stored_at: DateTime<FixedOffset>,
    ) -> Result<IngestReport, TrackerError> {
        payload.validate()?;
        if payload.is_miscounted() {
            warn!(
                "payload announces {} logs but carries {}; storing what arrived",
                payload.total_logs,
                payload.logs.len()
            );
        }
        let stored_time = stored_at.trunc_subsecs(0);

        let mut report = IngestReport::default();
        for log in &payload.logs {
            // Payloads from older clients carry no session id and are never deduplicated
            if let Some(session_id) = payload.session_id {
                if !self.seen.insert((session_id, log.elapsed_sec.to_bits())) {
                    debug!(
                        "skipping duplicate record {}s of session {session_id}",
                        log.elapsed_sec
                    );
                    report.duplicates += 1;
                    continue;
                }
            }

            self.documents.push(CollectorDocument {
                user_id: payload.user_id.clone(),
                news_id: payload.news_id.clone(),
                mmf_x: log.mmf_x,
                mmf_y: log.mmf_y,
                msf_y: log.msf_y,
                mouse_x: log.mouse_x,
                mouse_y: log.mouse_y,
                timestamp: log.elapsed_sec.max(0.0).trunc() as u64,
                baseline: log.proximity,
                stored_time,
                session_id: payload.session_id,
            });
            report.accepted += 1;
        }

        info!(
            "stored {} records for user {} on news {} ({} duplicates)",
            report.accepted, payload.user_id, payload.news_id, report.duplicates
        );
        Ok(report)
    }

    /// Documents of one viewer stored at or after `since`, grouped per article.
    ///
    /// Documents are ordered by `(stored_time, news_id, timestamp)`; groups
    /// appear in the order of their first document.
    pub fn search(&self, user_id: &str, since: DateTime<FixedOffset>) -> Vec<Vec<CollectorDocument>> {
        let mut hits: Vec<&CollectorDocument> = self
            .documents
            .iter()
            .filter(|doc| doc.user_id == user_id && doc.stored_time >= since)
            .collect();
        hits.sort_by(|a, b| {
            a.stored_time
                .cmp(&b.stored_time)
                .then_with(|| a.news_id.cmp(&b.news_id))
                .then_with(|| a.timestamp.cmp(&b.timestamp))
        });

        let mut groups: Vec<Vec<CollectorDocument>> = Vec::new();
        for doc in hits {
            match groups.iter_mut().find(|g| g[0].news_id == doc.news_id) {
                Some(group) => group.push(doc.clone()),
                None => groups.push(vec![doc.clone()]),
            }
        }
        groups
    }

    /// Longest active time recorded for a viewer on an article, in seconds
    pub fn dwell_time(&self, user_id: &str, news_id: &str) -> Option<u64> {
        self.documents
            .iter()
            .filter(|doc| doc.user_id == user_id && doc.news_id == news_id)
            .map(|doc| doc.timestamp)
            .max()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn documents(&self) -> &[CollectorDocument] {
        &self.documents
    }
}
