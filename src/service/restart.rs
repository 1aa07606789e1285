//! Auto-restart backoff policy
//!
//! Pure bookkeeping for the monitor's restart decisions. Instants are
//! passed in rather than read, so the policy is testable without real
//! time.

use std::time::{Duration, Instant};

/// Consecutive failed restarts tolerated before giving up
pub const DEFAULT_MAX_RESTARTS: u32 = 5;

/// Quiet period after which the attempt counter resets
pub const DEFAULT_RESET_WINDOW: Duration = Duration::from_secs(600);

/// Upper bound on the backoff delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

const BASE_DELAY: Duration = Duration::from_secs(1);

/// Restart attempt counter with a reset window and a hard cap
///
/// The cap exists so a persistently broken configuration (say, an
/// occupied port) cannot spin the process in a hot restart loop.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    attempts: u32,
    last_restart: Option<Instant>,
    max_restarts: u32,
    reset_window: Duration,
    max_delay: Duration,
}

impl RestartPolicy {
    pub fn new(max_restarts: u32, reset_window: Duration, max_delay: Duration) -> Self {
        Self {
            attempts: 0,
            last_restart: None,
            max_restarts,
            reset_window,
            max_delay,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether another automatic restart may run at `now`
    ///
    /// Resets the attempt counter first if the last restart is older
    /// than the reset window.
    pub fn should_restart(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_restart {
            if now.duration_since(last) > self.reset_window {
                self.attempts = 0;
            }
        }
        self.attempts < self.max_restarts
    }

    /// Delay before the next attempt: `attempts x 1s`, capped
    pub fn next_delay(&self) -> Duration {
        (BASE_DELAY * self.attempts).min(self.max_delay)
    }

    /// Record that an attempt is being made at `now`
    pub fn record_attempt(&mut self, now: Instant) {
        self.attempts += 1;
        self.last_restart = Some(now);
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RESTARTS, DEFAULT_RESET_WINDOW, DEFAULT_MAX_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_linearly_and_caps() {
        let mut policy = RestartPolicy::new(10, Duration::from_secs(600), Duration::from_secs(3));
        let base = Instant::now();

        assert_eq!(policy.next_delay(), Duration::ZERO);
        policy.record_attempt(base);
        assert_eq!(policy.next_delay(), Duration::from_secs(1));
        policy.record_attempt(base);
        assert_eq!(policy.next_delay(), Duration::from_secs(2));
        policy.record_attempt(base);
        policy.record_attempt(base);
        policy.record_attempt(base);
        assert_eq!(policy.next_delay(), Duration::from_secs(3));
    }

    #[test]
    fn test_gives_up_at_the_cap() {
        let mut policy = RestartPolicy::new(3, Duration::from_secs(600), Duration::from_secs(30));
        let base = Instant::now();

        for _ in 0..3 {
            assert!(policy.should_restart(base));
            policy.record_attempt(base);
        }
        assert!(!policy.should_restart(base));
        assert_eq!(policy.attempts(), 3);
    }

    #[test]
    fn test_counter_resets_after_quiet_window() {
        let window = Duration::from_secs(60);
        let mut policy = RestartPolicy::new(2, window, Duration::from_secs(30));
        let base = Instant::now();

        policy.record_attempt(base);
        policy.record_attempt(base);
        assert!(!policy.should_restart(base + Duration::from_secs(1)));

        // Quiet past the window: the cap opens up again
        assert!(policy.should_restart(base + window + Duration::from_secs(1)));
        assert_eq!(policy.attempts(), 0);
        assert_eq!(policy.next_delay(), Duration::ZERO);
    }
}
