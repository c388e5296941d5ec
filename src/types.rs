//! Core data types
//!
//! This module defines the geometry, session and record types that flow through
//! the tracking pipeline, along with their wire representations.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TrackerError;

/// Viewport dimensions in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

impl Viewport {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Width used as a divisor; a zero or negative width counts as 1px
    pub fn safe_width(&self) -> f64 {
        if self.width > 0.0 {
            self.width
        } else {
            1.0
        }
    }

    /// Height used as a divisor; a zero or negative height counts as 1px
    pub fn safe_height(&self) -> f64 {
        if self.height > 0.0 {
            self.height
        } else {
            1.0
        }
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new(1.0, 1.0)
    }
}

/// A viewport-relative point in pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Bounding rectangle of the designated content region, viewport-relative
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl Rect {
    pub fn new(left: f64, top: f64, right: f64, bottom: f64) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Whether the point lies inside the rectangle, edges included
    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.left && p.x <= self.right && p.y >= self.top && p.y <= self.bottom
    }

    /// Euclidean distance from the point to the nearest point of the rectangle
    pub fn distance_to(&self, p: Point) -> f64 {
        let dx = (self.left - p.x).max(0.0).max(p.x - self.right);
        let dy = (self.top - p.y).max(0.0).max(p.y - self.bottom);
        (dx * dx + dy * dy).sqrt()
    }
}

/// Response of the session/identity endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(rename = "isLoggedIn", default)]
    pub is_logged_in: bool,
    #[serde(rename = "hasNPTI", default)]
    pub has_npti: bool,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Identifies who is being observed on which article; immutable per page load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerSession {
    /// Viewer identity
    pub viewer_id: String,
    /// Opaque article identifier
    pub article_id: String,
    /// Viewer is identified and has an NPTI profile
    pub has_consent_signal: bool,
    /// Per-page-load identifier, used by the collector to deduplicate
    pub session_id: Uuid,
}

impl ViewerSession {
    pub fn new(viewer_id: impl Into<String>, article_id: impl Into<String>) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            article_id: article_id.into(),
            has_consent_signal: true,
            session_id: Uuid::new_v4(),
        }
    }

    /// Decide whether tracking may start for this page load.
    ///
    /// Returns `Ok(None)` for guests and viewers without an NPTI profile, and
    /// `Err(MissingArticle)` when the page carries no article identifier.
    pub fn from_session_state(
        state: &SessionState,
        article_id: Option<&str>,
    ) -> Result<Option<Self>, TrackerError> {
        let article_id = match article_id.map(str::trim) {
            Some(id) if !id.is_empty() => id,
            _ => return Err(TrackerError::MissingArticle),
        };

        let viewer_id = match (&state.user_id, state.is_logged_in) {
            (Some(id), true) if !id.is_empty() => id,
            _ => return Ok(None),
        };

        if !state.has_npti {
            return Ok(None);
        }

        Ok(Some(Self::new(viewer_id.clone(), article_id)))
    }
}

/// One per-second engagement snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    /// Total active time in seconds. The wire name is historical.
    #[serde(rename = "elapsedMs")]
    pub elapsed_sec: f64,
    /// Pointer x divided by viewport width
    #[serde(rename = "mouseX")]
    pub mouse_x: f64,
    /// Pointer y divided by viewport height
    #[serde(rename = "mouseY")]
    pub mouse_y: f64,
    /// Horizontal mouse movement frequency
    #[serde(rename = "MMF_X")]
    pub mmf_x: f64,
    /// Vertical mouse movement frequency
    #[serde(rename = "MMF_Y")]
    pub mmf_y: f64,
    /// Vertical scroll frequency
    #[serde(rename = "MSF_Y")]
    pub msf_y: f64,
    /// Proximity of the pointer to the content region
    #[serde(rename = "baseline")]
    pub proximity: f64,
}

/// Batch sent to the behavior collector endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryPayload {
    pub news_id: String,
    pub user_id: String,
    #[serde(default)]
    pub session_id: Option<Uuid>,
    /// Flush timestamp, epoch milliseconds
    pub session_end_time: i64,
    pub total_logs: usize,
    pub logs: Vec<FeatureRecord>,
}

impl DeliveryPayload {
    /// Checks the identifiers a stored record cannot do without.
    ///
    /// `total_logs` is informational; see [`DeliveryPayload::is_miscounted`].
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.news_id.is_empty() {
            return Err(TrackerError::InvalidPayload("news_id is empty".to_string()));
        }
        if self.user_id.is_empty() {
            return Err(TrackerError::InvalidPayload("user_id is empty".to_string()));
        }
        Ok(())
    }

    pub fn is_miscounted(&self) -> bool {
        self.total_logs != self.logs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_distance() {
        let rect = Rect::new(100.0, 100.0, 900.0, 700.0);
        assert_eq!(rect.distance_to(Point::new(500.0, 400.0)), 0.0);
        assert_eq!(rect.distance_to(Point::new(950.0, 400.0)), 50.0);
        // Corner: 30/40 → 50
        assert_eq!(rect.distance_to(Point::new(60.0, 70.0)), 50.0);
        assert!(rect.contains(Point::new(100.0, 700.0)));
        assert!(!rect.contains(Point::new(99.9, 400.0)));
    }

    #[test]
    fn test_viewport_zero_dimensions() {
        let vp = Viewport::new(0.0, 0.0);
        assert_eq!(vp.safe_width(), 1.0);
        assert_eq!(vp.safe_height(), 1.0);
    }

    #[test]
    fn test_session_eligibility() {
        let state = SessionState {
            is_logged_in: true,
            has_npti: true,
            user_id: Some("reader-1".to_string()),
        };
        let session = ViewerSession::from_session_state(&state, Some("news-42"))
            .unwrap()
            .unwrap();
        assert_eq!(session.viewer_id, "reader-1");
        assert_eq!(session.article_id, "news-42");
        assert!(session.has_consent_signal);

        let unprofiled = SessionState {
            has_npti: false,
            ..state.clone()
        };
        assert!(ViewerSession::from_session_state(&unprofiled, Some("news-42"))
            .unwrap()
            .is_none());

        let guest = SessionState::default();
        assert!(ViewerSession::from_session_state(&guest, Some("news-42"))
            .unwrap()
            .is_none());

        assert!(matches!(
            ViewerSession::from_session_state(&state, None),
            Err(TrackerError::MissingArticle)
        ));
        assert!(matches!(
            ViewerSession::from_session_state(&state, Some("  ")),
            Err(TrackerError::MissingArticle)
        ));
    }

    #[test]
    fn test_session_state_wire_names() {
        let state: SessionState =
            serde_json::from_str(r#"{"isLoggedIn": true, "hasNPTI": false, "user_id": "u1"}"#)
                .unwrap();
        assert!(state.is_logged_in);
        assert!(!state.has_npti);
        assert_eq!(state.user_id.as_deref(), Some("u1"));
    }

    #[test]
    fn test_feature_record_wire_names() {
        let record = FeatureRecord {
            elapsed_sec: 1.0,
            mouse_x: 0.5,
            mouse_y: 0.5,
            mmf_x: 0.1,
            mmf_y: 0.2,
            msf_y: 0.3,
            proximity: 1.0,
        };
        let value = serde_json::to_value(record).unwrap();
        for key in ["elapsedMs", "mouseX", "mouseY", "MMF_X", "MMF_Y", "MSF_Y", "baseline"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn test_payload_validation() {
        let mut payload = DeliveryPayload {
            news_id: "n".to_string(),
            user_id: "u".to_string(),
            session_id: None,
            session_end_time: 0,
            total_logs: 2,
            logs: vec![],
        };
        assert!(payload.is_miscounted());
        assert!(payload.validate().is_ok());

        payload.user_id.clear();
        assert!(payload.validate().is_err());
    }
}
