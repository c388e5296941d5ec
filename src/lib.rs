//! NPTI tracker - reading-behavior signals for news personalization
//!
//! The tracker observes how a viewer reads an article page and turns raw input
//! events into one feature record per second of active reading: normalized
//! pointer position, mouse movement and scroll frequencies, and proximity of
//! the pointer to the article body. Records are buffered and delivered in
//! batches to the behavior collector: activity gate → signal accumulator →
//! feature sampler → log buffer → delivery manager.
//!
//! ## Modules
//!
//! - **Tracker core**: `BehaviorTracker`, a sans-IO state machine fed with `TrackerEvent`s
//! - **Driver**: tokio task running a tracker with its own timer and delivery tasks
//! - **Collector**: receiving side of the behavior endpoint
//! - **Traces**: recorded event streams for replay and validation

pub mod accumulator;
pub mod activity;
pub mod buffer;
pub mod collector;
pub mod config;
pub mod delivery;
pub mod driver;
pub mod error;
pub mod features;
pub mod trace;
pub mod tracker;
pub mod types;

#[cfg(feature = "http")]
pub mod http;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use collector::{BehaviorCollector, CollectorDocument, IngestReport};
pub use config::TrackerConfig;
pub use delivery::{
    BeaconTransport, DeliveryManager, DeliveryOutcome, FlushBatch, FlushTrigger,
    KeepaliveTransport, Transport,
};
pub use driver::{spawn_tracker, StopReport, TrackerHandle};
pub use error::{TrackerError, TransportError};
pub use tracker::{BehaviorTracker, PageSnapshot, TrackerEvent};
pub use types::{DeliveryPayload, FeatureRecord, Rect, SessionState, ViewerSession, Viewport};

#[cfg(feature = "http")]
pub use http::{ApiClient, HttpTransport};

/// Tracker version
pub const TRACKER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name reported by diagnostics
pub const PRODUCER_NAME: &str = "npti-tracker";
