use crate::settings::SyncSettings;

/// Near-bottom distance that resumes follow mode.
const FOLLOW_RESUME_THRESHOLD: f32 = 24.0;
/// Ignores floating-point scroll jitter.
const SCROLL_DELTA_EPSILON: f32 = 1.0;
const NUDGE_PX: f32 = 1.0;

/// Scroll geometry of the transcript container. `scroll_top` grows downward.
pub trait Viewport {
    fn scroll_height(&self) -> f32;
    fn scroll_top(&self) -> f32;
    fn client_height(&self) -> f32;
    fn set_scroll_top(&mut self, top: f32);
}

fn max_top(viewport: &dyn Viewport) -> f32 {
    (viewport.scroll_height() - viewport.client_height()).max(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorSnapshot {
    pub scroll_height: f32,
    pub scroll_top: f32,
}

impl AnchorSnapshot {
    pub fn capture(viewport: &dyn Viewport) -> Self {
        Self {
            scroll_height: viewport.scroll_height(),
            scroll_top: viewport.scroll_top(),
        }
    }

    /// Top that keeps the same content under the viewport once `scroll_height` grew above it.
    pub fn restored_top(&self, scroll_height: f32) -> f32 {
        self.scroll_top + (scroll_height - self.scroll_height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PendingScroll {
    None,
    Preserve(AnchorSnapshot),
    ScrollToEnd,
}

/// Keeps the visible content steady across head insertions and follows the tail
/// while the user stays near the bottom.
#[derive(Debug, Clone)]
pub struct ScrollAnchor {
    pending: PendingScroll,
    nudge: bool,
    load_older_threshold: f32,
    follow_bottom: bool,
    last_scroll_top: f32,
    last_max_top: f32,
}

impl ScrollAnchor {
    pub fn new(nudge: bool, load_older_threshold: f32) -> Self {
        Self {
            pending: PendingScroll::None,
            nudge,
            load_older_threshold,
            follow_bottom: true,
            last_scroll_top: 0.0,
            last_max_top: 0.0,
        }
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self::new(settings.scroll_nudge, settings.load_older_threshold_px)
    }

    pub fn is_following_bottom(&self) -> bool {
        self.follow_bottom
    }

    pub fn has_pending_adjustment(&self) -> bool {
        self.pending != PendingScroll::None
    }

    /// Records geometry right before an older page is inserted at the head.
    /// A first-load scroll-to-end that has not run yet takes precedence.
    pub fn capture(&mut self, viewport: &dyn Viewport) {
        if self.pending == PendingScroll::ScrollToEnd {
            return;
        }
        self.pending = PendingScroll::Preserve(AnchorSnapshot::capture(viewport));
    }

    /// Scrolls to the end on the next layout that has content.
    pub fn defer_scroll_to_end(&mut self) {
        self.pending = PendingScroll::ScrollToEnd;
        self.follow_bottom = true;
    }

    /// Call after the mutation has been laid out. Returns the top that was applied, if any.
    pub fn on_layout(&mut self, viewport: &mut dyn Viewport, has_content: bool) -> Option<f32> {
        let target = match self.pending {
            PendingScroll::Preserve(snapshot) => {
                self.pending = PendingScroll::None;
                Some(snapshot.restored_top(viewport.scroll_height()))
            }
            PendingScroll::ScrollToEnd if has_content => {
                self.pending = PendingScroll::None;
                self.follow_bottom = true;
                Some(max_top(viewport))
            }
            PendingScroll::ScrollToEnd => None,
            PendingScroll::None => {
                let content_grew = self.update_follow_state(viewport);
                let off_bottom =
                    (max_top(viewport) - viewport.scroll_top()).abs() > SCROLL_DELTA_EPSILON;
                (self.follow_bottom && content_grew && off_bottom).then(|| max_top(viewport))
            }
        };

        let applied = target.map(|target| self.set_top(viewport, target));
        self.remember(viewport);
        applied
    }

    /// Call on user scroll. Returns `true` when the viewport is close enough to the top
    /// that the next older page should load.
    pub fn on_scroll(&mut self, viewport: &dyn Viewport) -> bool {
        self.update_follow_state(viewport);
        self.remember(viewport);
        self.should_load_older(viewport)
    }

    pub fn should_load_older(&self, viewport: &dyn Viewport) -> bool {
        self.pending == PendingScroll::None && viewport.scroll_top() <= self.load_older_threshold
    }

    fn set_top(&self, viewport: &mut dyn Viewport, target: f32) -> f32 {
        let target = target.clamp(0.0, max_top(viewport));
        if self.nudge {
            let jiggle = if target + NUDGE_PX <= max_top(viewport) {
                target + NUDGE_PX
            } else {
                target - NUDGE_PX
            };
            viewport.set_scroll_top(jiggle.max(0.0));
        }
        viewport.set_scroll_top(target);
        target
    }

    fn remember(&mut self, viewport: &dyn Viewport) {
        self.last_scroll_top = viewport.scroll_top();
        self.last_max_top = max_top(viewport);
    }

    /// Returns whether the scrollable range changed since the last observation.
    fn update_follow_state(&mut self, viewport: &dyn Viewport) -> bool {
        let top_delta = viewport.scroll_top() - self.last_scroll_top;
        let content_changed = (max_top(viewport) - self.last_max_top).abs() > SCROLL_DELTA_EPSILON;
        let user_scrolled_up = top_delta < -SCROLL_DELTA_EPSILON && !content_changed;
        let user_scrolled_down = top_delta > SCROLL_DELTA_EPSILON && !content_changed;

        if content_changed && self.was_near_bottom() {
            self.follow_bottom = true;
        } else if self.follow_bottom {
            if user_scrolled_up {
                self.follow_bottom = false;
            }
        } else if user_scrolled_down && is_near_bottom(viewport) {
            self.follow_bottom = true;
        }

        content_changed
    }

    fn was_near_bottom(&self) -> bool {
        self.last_max_top - self.last_scroll_top <= FOLLOW_RESUME_THRESHOLD
    }
}

fn is_near_bottom(viewport: &dyn Viewport) -> bool {
    max_top(viewport) - viewport.scroll_top() <= FOLLOW_RESUME_THRESHOLD
}
