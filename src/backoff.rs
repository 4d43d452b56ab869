use std::time::Duration;

/// Reconnect delay schedule: doubles from `initial` up to `max`, never shrinking
/// until [`Backoff::reset`]. `max_attempts == 0` means unbounded.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        let max = max.max(initial);
        Backoff {
            initial,
            max,
            max_attempts,
            attempt: 0,
            current: initial,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts != 0 && self.attempt >= self.max_attempts {
            return None;
        }
        let delay = self.current;
        self.attempt += 1;
        self.current = self.current.saturating_mul(2).min(self.max);
        Some(delay)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_never_decrease_and_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(700), 0);
        let delays: Vec<_> = (0..6).filter_map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            [100, 200, 400, 700, 700, 700].map(Duration::from_millis).to_vec()
        );
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn exhausts_after_max_attempts_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(4), 2);
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }
}
