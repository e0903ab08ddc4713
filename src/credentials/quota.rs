use std::time::Duration;
use tokio::time::Instant;

/// Fixed-window usage counter for one quota dimension
///
/// The window resets to zero once its length has elapsed since
/// `window_start`. This is an approximation of the provider's true
/// sliding-window limiting; the safety-margined ceiling (a configured
/// fraction of the nominal limit) absorbs boundary bursts.
#[derive(Debug, Clone)]
pub struct QuotaWindow {
    used: f64,
    ceiling: f64,
    length: Duration,
    window_start: Instant,
}

impl QuotaWindow {
    /// Create an empty window starting at `now`
    pub fn new(length: Duration, ceiling: f64, now: Instant) -> Self {
        Self {
            used: 0.0,
            ceiling,
            length,
            window_start: now,
        }
    }

    /// Reset counters when the window has elapsed
    fn roll(&mut self, now: Instant) {
        if now.duration_since(self.window_start) >= self.length {
            self.used = 0.0;
            self.window_start = now;
        }
    }

    /// Whether `amount` more usage fits strictly under the ceiling
    pub fn admits(&mut self, amount: f64, now: Instant) -> bool {
        self.roll(now);
        self.used + amount < self.ceiling
    }

    /// Remaining capacity in the current window
    pub fn headroom(&mut self, now: Instant) -> f64 {
        self.roll(now);
        (self.ceiling - self.used).max(0.0)
    }

    /// Record usage; rolls the window first so a commit after rollover
    /// lands in the fresh window
    pub fn commit(&mut self, amount: f64, now: Instant) {
        self.roll(now);
        self.used += amount;
    }

    /// Usage recorded in the current window
    pub fn used(&self) -> f64 {
        self.used
    }

    /// Configured ceiling
    pub fn ceiling(&self) -> f64 {
        self.ceiling
    }

    /// Time until the current window rolls over
    pub fn until_reset(&self, now: Instant) -> Duration {
        self.length
            .saturating_sub(now.duration_since(self.window_start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_admits_strictly_under_ceiling() {
        let now = Instant::now();
        let mut window = QuotaWindow::new(MINUTE, 4.5, now);

        assert!(window.admits(1.0, now));
        window.commit(1.0, now);
        window.commit(1.0, now);
        window.commit(1.0, now);
        assert!(window.admits(1.0, now));
        window.commit(1.0, now);

        // 4.0 used, 4.0 + 1.0 >= 4.5
        assert!(!window.admits(1.0, now));
    }

    #[test]
    fn test_headroom_never_negative() {
        let now = Instant::now();
        let mut window = QuotaWindow::new(MINUTE, 10.0, now);
        window.commit(15.0, now);
        assert_eq!(window.headroom(now), 0.0);
    }

    #[test]
    fn test_window_rolls_after_length() {
        let now = Instant::now();
        let mut window = QuotaWindow::new(MINUTE, 5.0, now);
        window.commit(4.0, now);
        assert!(!window.admits(2.0, now));

        let later = now + Duration::from_secs(61);
        assert!(window.admits(2.0, later));
        assert_eq!(window.used(), 0.0);
    }

    #[test]
    fn test_commit_after_rollover_lands_in_fresh_window() {
        let now = Instant::now();
        let mut window = QuotaWindow::new(MINUTE, 5.0, now);
        window.commit(4.0, now);

        let later = now + Duration::from_secs(90);
        window.commit(1.0, later);
        assert_eq!(window.used(), 1.0);
    }

    #[test]
    fn test_until_reset_counts_down() {
        let now = Instant::now();
        let window = QuotaWindow::new(MINUTE, 5.0, now);
        let mid = now + Duration::from_secs(20);
        assert_eq!(window.until_reset(mid), Duration::from_secs(40));
    }
}
