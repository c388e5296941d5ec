//! Delivery manager
//!
//! Sends flushed batches to the behavior collector. A flush first tries the
//! beacon path, which only reports whether the request was *enqueued*. When
//! the enqueue is refused it falls back to a single keepalive POST whose
//! outcome is known. If that fails too the records are handed back for
//! requeueing; there is no third attempt.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{TrackerError, TransportError};
use crate::types::{DeliveryPayload, FeatureRecord, ViewerSession};

/// Why a flush happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    /// Buffer reached its threshold
    Threshold,
    /// Page became hidden
    Hidden,
    /// Page is unloading
    Unload,
    /// Tracking was stopped explicitly
    Stop,
}

/// Records drained from the buffer by one flush
#[derive(Debug, Clone, PartialEq)]
pub struct FlushBatch {
    pub trigger: FlushTrigger,
    pub records: Vec<FeatureRecord>,
}

/// Fire-and-forget send that survives page teardown.
///
/// Returning `true` only means the request was queued, not that it arrived.
pub trait BeaconTransport: Send + Sync {
    fn send_beacon(&self, path: &str, body: &str) -> bool;
}

/// Regular request allowed to outlive navigation, with a known outcome
#[async_trait]
pub trait KeepaliveTransport: Send + Sync {
    async fn post_keepalive(&self, path: &str, body: String) -> Result<(), TransportError>;
}

/// A transport offering both delivery paths
pub trait Transport: BeaconTransport + KeepaliveTransport {}

impl<T: BeaconTransport + KeepaliveTransport> Transport for T {}

/// Result of the synchronous part of a flush
#[derive(Debug)]
pub enum Dispatch {
    /// Beacon accepted the payload
    Beaconed { count: usize },
    /// Beacon refused; the keepalive fallback must run
    Fallback(PendingDelivery),
}

/// A payload waiting for its keepalive fallback
#[derive(Debug)]
pub struct PendingDelivery {
    pub trigger: FlushTrigger,
    pub path: String,
    pub body: String,
    pub records: Vec<FeatureRecord>,
}

/// Final outcome of a flush
#[derive(Debug, PartialEq)]
pub enum DeliveryOutcome {
    Delivered { count: usize },
    Failed {
        records: Vec<FeatureRecord>,
        error: TransportError,
    },
}

impl PendingDelivery {
    /// Run the keepalive fallback
    pub async fn send<T: KeepaliveTransport + ?Sized>(self, transport: &T) -> DeliveryOutcome {
        let count = self.records.len();
        match transport.post_keepalive(&self.path, self.body).await {
            Ok(()) => {
                info!("keepalive delivery succeeded ({count} records, {:?})", self.trigger);
                DeliveryOutcome::Delivered { count }
            }
            Err(err) => {
                error!("keepalive delivery failed ({count} records): {err}");
                DeliveryOutcome::Failed {
                    records: self.records,
                    error: err,
                }
            }
        }
    }
}

/// Builds payloads for one viewer session and dispatches them
#[derive(Debug, Clone)]
pub struct DeliveryManager {
    session: ViewerSession,
    collector_path: String,
}

impl DeliveryManager {
    pub fn new(session: ViewerSession, collector_path: impl Into<String>) -> Self {
        Self {
            session,
            collector_path: collector_path.into(),
        }
    }

    pub fn session(&self) -> &ViewerSession {
        &self.session
    }

    /// Wrap records in a payload stamped with the flush time
    pub fn build_payload(
        &self,
        records: Vec<FeatureRecord>,
        flushed_at: DateTime<Utc>,
    ) -> DeliveryPayload {
        DeliveryPayload {
            news_id: self.session.article_id.clone(),
            user_id: self.session.viewer_id.clone(),
            session_id: Some(self.session.session_id),
            session_end_time: flushed_at.timestamp_millis(),
            total_logs: records.len(),
            logs: records,
        }
    }

    /// Serialize the batch and try the beacon path
    pub fn dispatch<T: BeaconTransport + ?Sized>(
        &self,
        batch: FlushBatch,
        transport: &T,
    ) -> Result<Dispatch, TrackerError> {
        let count = batch.records.len();
        let payload = self.build_payload(batch.records, Utc::now());
        let body = serde_json::to_string(&payload)?;

        if transport.send_beacon(&self.collector_path, &body) {
            info!("beacon accepted {count} records ({:?})", batch.trigger);
            return Ok(Dispatch::Beaconed { count });
        }

        warn!("beacon refused {count} records; retrying with keepalive request");
        Ok(Dispatch::Fallback(PendingDelivery {
            trigger: batch.trigger,
            path: self.collector_path.clone(),
            body,
            records: payload.logs,
        }))
    }

    /// Run a whole flush to completion
    pub async fn deliver<T: Transport + ?Sized>(
        &self,
        batch: FlushBatch,
        transport: &T,
    ) -> Result<DeliveryOutcome, TrackerError> {
        match self.dispatch(batch, transport)? {
            Dispatch::Beaconed { count } => Ok(DeliveryOutcome::Delivered { count }),
            Dispatch::Fallback(pending) => Ok(pending.send(transport).await),
        }
    }
}
