//! Per-category rate limiting with quiet hours
//!
//! Three independent rolling one-minute windows. During configured quiet
//! hours the forwarding budget shrinks; quiet state is evaluated once per
//! minute against synced time and never engages while the clock is unsynced.

use embermesh_core::config::QuietHours;
use tracing::{debug, info};

/// Window length
pub const WINDOW_MS: u64 = 60_000;

/// Login attempts per window
pub const LOGIN_PER_WINDOW: u32 = 5;

/// Requests per window
pub const REQUEST_PER_WINDOW: u32 = 30;

/// Forwards per window
pub const FORWARD_PER_WINDOW: u32 = 100;

/// Forwards per window during quiet hours
pub const FORWARD_QUIET_PER_WINDOW: u32 = 30;

/// Traffic category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Anonymous login attempts
    Login,
    /// Authenticated requests
    Request,
    /// Relayed packets
    Forward,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    max: u32,
    count: u32,
    start_ms: u64,
    allowed: u64,
    blocked: u64,
}

impl Window {
    fn new(max: u32) -> Window {
        Window {
            max,
            count: 0,
            start_ms: 0,
            allowed: 0,
            blocked: 0,
        }
    }

    fn roll(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.start_ms) >= WINDOW_MS {
            self.count = 0;
            self.start_ms = now_ms;
        }
    }

    fn allow(&mut self, now_ms: u64) -> bool {
        self.roll(now_ms);
        if self.count < self.max {
            self.count += 1;
            self.allowed += 1;
            true
        } else {
            self.blocked += 1;
            false
        }
    }

    fn would_allow(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.start_ms) >= WINDOW_MS || self.count < self.max
    }
}

/// Totals per category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimiterStats {
    /// Operations admitted
    pub allowed: u64,
    /// Operations refused
    pub blocked: u64,
}

/// Windowed rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    login: Window,
    request: Window,
    forward: Window,
    quiet_hours: Option<QuietHours>,
    quiet_active: bool,
}

impl RateLimiter {
    /// Limiter with default budgets
    pub fn new(quiet_hours: Option<QuietHours>) -> RateLimiter {
        RateLimiter {
            login: Window::new(LOGIN_PER_WINDOW),
            request: Window::new(REQUEST_PER_WINDOW),
            forward: Window::new(FORWARD_PER_WINDOW),
            quiet_hours,
            quiet_active: false,
        }
    }

    fn window(&mut self, category: Category) -> &mut Window {
        match category {
            Category::Login => &mut self.login,
            Category::Request => &mut self.request,
            Category::Forward => &mut self.forward,
        }
    }

    /// Consume budget; false when the category is exhausted
    pub fn allow(&mut self, category: Category, now_ms: u64) -> bool {
        let admitted = self.window(category).allow(now_ms);
        if !admitted {
            debug!(?category, "rate limit exceeded");
        }
        admitted
    }

    /// Peek without consuming
    pub fn would_allow(&self, category: Category, now_ms: u64) -> bool {
        match category {
            Category::Login => self.login.would_allow(now_ms),
            Category::Request => self.request.would_allow(now_ms),
            Category::Forward => self.forward.would_allow(now_ms),
        }
    }

    /// Re-evaluate quiet hours against the synced hour of day (None while
    /// unsynced, which always leaves quiet hours disengaged)
    pub fn evaluate_quiet(&mut self, hour: Option<u8>) {
        let active = match (self.quiet_hours, hour) {
            (Some(window), Some(h)) => window.contains(h),
            _ => false,
        };
        if active != self.quiet_active {
            info!(active, "quiet hours state changed");
            self.quiet_active = active;
            self.forward.max = if active {
                FORWARD_QUIET_PER_WINDOW
            } else {
                FORWARD_PER_WINDOW
            };
        }
    }

    /// True while the reduced forward budget is in effect
    pub fn quiet_active(&self) -> bool {
        self.quiet_active
    }

    /// Totals for one category
    pub fn stats(&self, category: Category) -> LimiterStats {
        let w = match category {
            Category::Login => &self.login,
            Category::Request => &self.request,
            Category::Forward => &self.forward,
        };
        LimiterStats {
            allowed: w.allowed,
            blocked: w.blocked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budgets_are_independent() {
        let mut rl = RateLimiter::new(None);
        for _ in 0..LOGIN_PER_WINDOW {
            assert!(rl.allow(Category::Login, 0));
        }
        assert!(!rl.allow(Category::Login, 1));
        // Requests unaffected by exhausted logins.
        assert!(rl.allow(Category::Request, 1));
        assert_eq!(rl.stats(Category::Login).blocked, 1);
    }

    #[test]
    fn window_resets_after_a_minute() {
        let mut rl = RateLimiter::new(None);
        for _ in 0..LOGIN_PER_WINDOW {
            rl.allow(Category::Login, 0);
        }
        assert!(!rl.allow(Category::Login, WINDOW_MS - 1));
        assert!(rl.allow(Category::Login, WINDOW_MS));
    }

    #[test]
    fn would_allow_does_not_consume() {
        let mut rl = RateLimiter::new(None);
        for _ in 0..10 {
            assert!(rl.would_allow(Category::Login, 0));
        }
        assert!(rl.allow(Category::Login, 0));
    }

    #[test]
    fn quiet_hours_shrink_forward_budget() {
        let quiet = QuietHours {
            start_hour: 22,
            end_hour: 6,
        };
        let mut rl = RateLimiter::new(Some(quiet));
        rl.evaluate_quiet(Some(23));
        assert!(rl.quiet_active());
        for _ in 0..FORWARD_QUIET_PER_WINDOW {
            assert!(rl.allow(Category::Forward, 0));
        }
        assert!(!rl.allow(Category::Forward, 1));

        // Morning: budget restored.
        rl.evaluate_quiet(Some(8));
        assert!(!rl.quiet_active());
        assert!(rl.allow(Category::Forward, WINDOW_MS));
    }

    #[test]
    fn quiet_hours_never_engage_unsynced() {
        let quiet = QuietHours {
            start_hour: 0,
            end_hour: 23,
        };
        let mut rl = RateLimiter::new(Some(quiet));
        rl.evaluate_quiet(None);
        assert!(!rl.quiet_active());
    }

    #[test]
    fn login_budget_is_stricter_than_request() {
        assert!(LOGIN_PER_WINDOW < REQUEST_PER_WINDOW);
        assert!(REQUEST_PER_WINDOW < FORWARD_PER_WINDOW);
    }
}
