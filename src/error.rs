//! Error types for the NPTI tracker

use thiserror::Error;

/// Errors surfaced by the tracker, its configuration and the collector
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse input: {0}")]
    ParseError(String),

    #[error("No article identifier resolvable from the page")]
    MissingArticle,

    #[error("Viewer {0} is not eligible for tracking")]
    NotEligible(String),

    #[error("Invalid tracker event: {0}")]
    InvalidEvent(String),

    #[error("Invalid event trace: {0}")]
    InvalidTrace(String),

    #[error("Tracker already stopped")]
    Stopped,

    #[error("Tracker task failed: {0}")]
    Driver(String),

    #[error("Invalid delivery payload: {0}")]
    InvalidPayload(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Failures reported by a delivery transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Collector responded with status {0}")]
    Status(u16),
}
