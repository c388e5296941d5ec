//! Recorded event traces
//!
//! A trace is a sequence of `TrackerEvent`s, stored either as NDJSON (one event
//! per line) or as a JSON array. Traces drive CLI replays and tests.

use serde::Serialize;

use crate::error::TrackerError;
use crate::tracker::TrackerEvent;

/// A problem found in one event of a trace
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceIssue {
    /// Zero-based position in the trace
    pub index: usize,
    pub message: String,
}

/// Parse a JSON array of events
pub fn parse_array(json: &str) -> Result<Vec<TrackerEvent>, TrackerError> {
    let events: Vec<TrackerEvent> = serde_json::from_str(json)?;
    Ok(events)
}

/// Parse NDJSON (newline-delimited JSON) events; blank lines are skipped
pub fn parse_ndjson(ndjson: &str) -> Result<Vec<TrackerEvent>, TrackerError> {
    let mut events = Vec::new();
    for (line_num, line) in ndjson.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<TrackerEvent>(trimmed) {
            Ok(event) => events.push(event),
            Err(e) => {
                return Err(TrackerError::ParseError(format!(
                    "Failed to parse line {}: {}",
                    line_num + 1,
                    e
                )));
            }
        }
    }
    Ok(events)
}

/// Parse either format, picking by the first non-whitespace character
pub fn parse_trace(input: &str) -> Result<Vec<TrackerEvent>, TrackerError> {
    if input.trim_start().starts_with('[') {
        parse_array(input)
    } else {
        parse_ndjson(input)
    }
}

/// Check a single event in isolation
pub fn validate_event(event: &TrackerEvent) -> Result<(), TrackerError> {
    match event {
        TrackerEvent::PointerMove { x, y, .. } => {
            if !x.is_finite() || !y.is_finite() {
                return Err(TrackerError::InvalidEvent(format!(
                    "pointer position ({x}, {y}) is not finite"
                )));
            }
        }
        TrackerEvent::Scroll { offset_y, .. } => {
            if !offset_y.is_finite() {
                return Err(TrackerError::InvalidEvent(format!(
                    "scroll offset {offset_y} is not finite"
                )));
            }
        }
        TrackerEvent::Resize { width, height, .. } => {
            if !(width.is_finite() && height.is_finite()) || *width < 0.0 || *height < 0.0 {
                return Err(TrackerError::InvalidEvent(format!(
                    "viewport {width}x{height} is invalid"
                )));
            }
        }
        TrackerEvent::Region { rect: Some(rect), .. } => {
            let edges = [rect.left, rect.top, rect.right, rect.bottom];
            if edges.iter().any(|e| !e.is_finite()) {
                return Err(TrackerError::InvalidEvent(
                    "region edges must be finite".to_string(),
                ));
            }
            if rect.right < rect.left || rect.bottom < rect.top {
                return Err(TrackerError::InvalidEvent(
                    "region is inverted".to_string(),
                ));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Collect every issue in a trace, including clock regressions
pub fn validate_events(events: &[TrackerEvent]) -> Vec<TraceIssue> {
    let mut issues = Vec::new();
    let mut last_at: Option<u64> = None;

    for (index, event) in events.iter().enumerate() {
        if let Err(e) = validate_event(event) {
            issues.push(TraceIssue {
                index,
                message: e.to_string(),
            });
        }

        let at = event.at_ms();
        if let Some(prev) = last_at {
            if at < prev {
                issues.push(TraceIssue {
                    index,
                    message: format!("clock went backwards: {at}ms after {prev}ms"),
                });
            }
        }
        last_at = Some(at);
    }

    issues
}

/// Fail with the first issue, if any
pub fn ensure_valid(events: &[TrackerEvent]) -> Result<(), TrackerError> {
    let issues = validate_events(events);
    match issues.first() {
        None => Ok(()),
        Some(first) => Err(TrackerError::InvalidTrace(format!(
            "event {}: {} ({} issues total)",
            first.index,
            first.message,
            issues.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Rect;

    const NDJSON: &str = r#"
{"type":"pointer_move","at_ms":10,"x":500.0,"y":400.0}

{"type":"scroll","at_ms":20,"offset_y":120.0}
{"type":"region","at_ms":25}
{"type":"tick","at_ms":100}
"#;

    #[test]
    fn test_parse_ndjson_skips_blank_lines() {
        let events = parse_ndjson(NDJSON).unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[0],
            TrackerEvent::PointerMove {
                at_ms: 10,
                x: 500.0,
                y: 400.0
            }
        );
        assert_eq!(events[2], TrackerEvent::Region { at_ms: 25, rect: None });
    }

    #[test]
    fn test_parse_ndjson_reports_line() {
        let err = parse_ndjson("{\"type\":\"tick\",\"at_ms\":1}\n{\"type\":\"warp\"}").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_parse_trace_detects_array() {
        let events = parse_trace(r#" [{"type":"unload","at_ms":5},{"type":"stop","at_ms":6}]"#).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].at_ms(), 6);
    }

    #[test]
    fn test_validate_collects_all_issues() {
        let events = vec![
            TrackerEvent::Tick { at_ms: 100 },
            TrackerEvent::PointerMove {
                at_ms: 90,
                x: f64::NAN,
                y: 1.0,
            },
            TrackerEvent::Resize {
                at_ms: 120,
                width: -5.0,
                height: 600.0,
            },
            TrackerEvent::Region {
                at_ms: 130,
                rect: Some(Rect::new(500.0, 0.0, 100.0, 10.0)),
            },
        ];

        let issues = validate_events(&events);
        let indices: Vec<usize> = issues.iter().map(|i| i.index).collect();
        assert_eq!(indices, vec![1, 1, 2, 3]);
        assert!(issues[1].message.contains("backwards"));
        assert!(matches!(
            ensure_valid(&events),
            Err(TrackerError::InvalidTrace(_))
        ));
    }

    #[test]
    fn test_valid_trace_passes() {
        let events = parse_ndjson(NDJSON).unwrap();
        assert!(validate_events(&events).is_empty());
        assert!(ensure_valid(&events).is_ok());
    }
}
