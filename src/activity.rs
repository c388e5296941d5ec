//! Activity gate
//!
//! Decides whether the viewer is engaged with the page at a given instant.
//! The page counts as active when it is visible and at least one of focus,
//! pointer presence or a recent scroll holds.

use serde::{Deserialize, Serialize};

/// Tracks the page signals that feed the activity predicate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityGate {
    visible: bool,
    focused: bool,
    pointer_inside: bool,
    /// Scrolling stays true strictly before this instant (ms)
    scroll_active_until: Option<u64>,
    scroll_decay_ms: u64,
}

impl ActivityGate {
    /// A freshly loaded page: visible, focused, pointer inside, not scrolling
    pub fn new(scroll_decay_ms: u64) -> Self {
        Self {
            visible: true,
            focused: true,
            pointer_inside: true,
            scroll_active_until: None,
            scroll_decay_ms,
        }
    }

    /// Whether the page is active for measurement purposes at `now_ms`
    pub fn is_active(&self, now_ms: u64) -> bool {
        self.visible && (self.focused || self.pointer_inside || self.is_scrolling(now_ms))
    }

    /// Whether a scroll happened within the decay window
    pub fn is_scrolling(&self, now_ms: u64) -> bool {
        self.scroll_active_until
            .map(|until| now_ms < until)
            .unwrap_or(false)
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn set_focused(&mut self, focused: bool) {
        self.focused = focused;
    }

    pub fn set_pointer_inside(&mut self, inside: bool) {
        self.pointer_inside = inside;
    }

    /// Restart the scroll window (debounce)
    pub fn note_scroll(&mut self, now_ms: u64) {
        self.scroll_active_until = Some(now_ms.saturating_add(self.scroll_decay_ms));
    }
}
