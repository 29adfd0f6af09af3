//! Visible-range tracking and the scroll policies built on it.

use serde::{Deserialize, Serialize};

/// Items from the end that still count as "at the bottom".
pub const DEFAULT_NEAR_BOTTOM_SLACK: usize = 3;
/// First visible index at or below which older history is requested.
pub const DEFAULT_LOAD_OLDER_THRESHOLD: usize = 5;

/// Visible index range of the rendered message list, inclusive on both ends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Viewport {
    pub first_visible: usize,
    pub last_visible: usize,
}

impl Viewport {
    pub fn new(first_visible: usize, last_visible: usize) -> Self {
        Self {
            first_visible: first_visible.min(last_visible),
            last_visible: last_visible.max(first_visible),
        }
    }

    /// The same rows after `rows` items were inserted above them.
    pub fn shifted_down(self, rows: usize) -> Self {
        Self {
            first_visible: self.first_visible.saturating_add(rows),
            last_visible: self.last_visible.saturating_add(rows),
        }
    }
}

/// Thresholds deciding when to auto-scroll and when to page backward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScrollPolicy {
    pub near_bottom_slack: usize,
    pub load_older_threshold: usize,
}

impl Default for ScrollPolicy {
    fn default() -> Self {
        Self {
            near_bottom_slack: DEFAULT_NEAR_BOTTOM_SLACK,
            load_older_threshold: DEFAULT_LOAD_OLDER_THRESHOLD,
        }
    }
}

impl ScrollPolicy {
    /// Whether the viewer sits close enough to the end of a `len`-item list
    /// that new content should scroll into view.
    ///
    /// An unknown viewport or an empty list counts as at the bottom: a fresh
    /// view starts pinned to the newest message.
    pub fn is_near_bottom(&self, viewport: Option<Viewport>, len: usize) -> bool {
        let Some(viewport) = viewport else {
            return true;
        };
        if len == 0 {
            return true;
        }
        viewport.last_visible.saturating_add(self.near_bottom_slack) >= len
    }

    /// Whether the viewer is close enough to the top to fetch older history.
    pub fn should_load_older(&self, viewport: Viewport) -> bool {
        viewport.first_visible <= self.load_older_threshold
    }
}
