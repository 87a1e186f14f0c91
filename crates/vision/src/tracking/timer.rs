use std::time::{Duration, Instant};

/// Monotonic stopwatch measuring how long an object has been still.
///
/// An idle timer reports zero elapsed and never exceeds any limit. Every query
/// takes the current instant so callers can replay time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MovementTimer {
    started: Option<Instant>,
}

impl MovementTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    pub fn start_if_idle_at(&mut self, now: Instant) {
        if self.started.is_none() {
            self.started = Some(now);
        }
    }

    pub fn elapsed_at(&self, now: Instant) -> Duration {
        self.started
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default()
    }

    pub fn elapsed_secs_at(&self, now: Instant) -> f32 {
        self.elapsed_at(now).as_secs_f32()
    }

    pub fn reset(&mut self) {
        self.started = None;
    }

    pub fn has_exceeded_at(&self, limit: Duration, now: Instant) -> bool {
        self.started.is_some() && self.elapsed_at(now) > limit
    }

    /// Rebase the start so the timer reads `prior_elapsed` at `now`.
    pub fn reload_from_at(&mut self, prior_elapsed: Duration, now: Instant) {
        self.started = Some(now.checked_sub(prior_elapsed).unwrap_or(now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_timer_reports_zero_and_never_exceeds() {
        let timer = MovementTimer::new();
        let later = Instant::now() + Duration::from_secs(100);
        assert_eq!(timer.elapsed_at(later), Duration::ZERO);
        assert!(!timer.has_exceeded_at(Duration::ZERO, later));
        assert!(!timer.is_running());
    }

    #[test]
    fn start_if_idle_keeps_the_first_start() {
        let t0 = Instant::now();
        let mut timer = MovementTimer::new();
        timer.start_if_idle_at(t0);
        timer.start_if_idle_at(t0 + Duration::from_secs(3));
        assert_eq!(timer.elapsed_at(t0 + Duration::from_secs(4)), Duration::from_secs(4));
    }

    #[test]
    fn exceeds_only_strictly_after_limit() {
        let t0 = Instant::now();
        let mut timer = MovementTimer::new();
        timer.start_if_idle_at(t0);
        let limit = Duration::from_secs(5);
        assert!(!timer.has_exceeded_at(limit, t0 + limit));
        assert!(timer.has_exceeded_at(limit, t0 + limit + Duration::from_millis(1)));
        timer.reset();
        assert!(!timer.has_exceeded_at(limit, t0 + Duration::from_secs(60)));
    }

    #[test]
    fn reload_preserves_elapsed_time() {
        let now = Instant::now() + Duration::from_secs(30);
        let mut timer = MovementTimer::new();
        timer.reload_from_at(Duration::from_secs(7), now);
        assert!(timer.is_running());
        assert_eq!(timer.elapsed_at(now), Duration::from_secs(7));
        assert_eq!(
            timer.elapsed_at(now + Duration::from_secs(1)),
            Duration::from_secs(8)
        );
    }
}
