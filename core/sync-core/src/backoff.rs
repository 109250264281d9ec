//! Reconnect delay calculation for the push channel.
//!
//! Deterministic doubling between a floor and a ceiling, no jitter. A single
//! successful open resets the sequence.

use std::cmp;
use std::time::Duration;

pub const BACKOFF_FLOOR_MS: u64 = 1_000;
pub const BACKOFF_CEILING_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Success,
    Failure,
}

/// Pure step: the delay to use after `outcome`, given the current delay.
pub fn next_delay(current: Duration, outcome: ConnectOutcome, floor: Duration, ceiling: Duration) -> Duration {
    match outcome {
        ConnectOutcome::Success => floor,
        ConnectOutcome::Failure => cmp::min(current.saturating_mul(2), ceiling),
    }
}

/// Tracks the delay for the next reconnect attempt.
#[derive(Debug, Clone)]
pub struct ReconnectionPolicy {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(BACKOFF_FLOOR_MS),
            Duration::from_millis(BACKOFF_CEILING_MS),
        )
    }
}

impl ReconnectionPolicy {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = cmp::max(floor, ceiling);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// Delay the next failure will wait.
    pub fn current_delay(&self) -> Duration {
        self.current
    }

    /// Records a failed attempt and returns how long to wait before retrying.
    pub fn on_failure(&mut self) -> Duration {
        let delay = self.current;
        self.current = next_delay(self.current, ConnectOutcome::Failure, self.floor, self.ceiling);
        delay
    }

    /// Records a successful open; the next failure waits the floor again.
    pub fn on_success(&mut self) {
        self.current = next_delay(self.current, ConnectOutcome::Success, self.floor, self.ceiling);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn consecutive_failures_double_until_ceiling() {
        let mut policy = ReconnectionPolicy::default();
        let delays: Vec<u64> = (0..8)
            .map(|_| policy.on_failure().as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000, 30_000]
        );
    }

    #[test]
    fn success_resets_to_floor() {
        let mut policy = ReconnectionPolicy::default();
        policy.on_failure();
        policy.on_failure();
        policy.on_failure();
        assert_eq!(policy.current_delay(), ms(8_000));

        policy.on_success();
        assert_eq!(policy.on_failure(), ms(1_000));
        assert_eq!(policy.on_failure(), ms(2_000));
    }

    #[test]
    fn failure_sequence_is_non_decreasing_and_bounded() {
        let mut policy = ReconnectionPolicy::new(ms(300), ms(5_000));
        let mut previous = Duration::ZERO;
        for _ in 0..50 {
            let delay = policy.on_failure();
            assert!(delay >= previous);
            assert!(delay <= ms(5_000));
            previous = delay;
        }
        assert_eq!(previous, ms(5_000));
    }

    #[test]
    fn next_delay_is_pure() {
        let floor = ms(BACKOFF_FLOOR_MS);
        let ceiling = ms(BACKOFF_CEILING_MS);
        assert_eq!(next_delay(ms(4_000), ConnectOutcome::Failure, floor, ceiling), ms(8_000));
        assert_eq!(next_delay(ms(20_000), ConnectOutcome::Failure, floor, ceiling), ceiling);
        assert_eq!(next_delay(ms(20_000), ConnectOutcome::Success, floor, ceiling), floor);
    }

    #[test]
    fn ceiling_below_floor_is_raised_to_floor() {
        let mut policy = ReconnectionPolicy::new(ms(2_000), ms(500));
        assert_eq!(policy.on_failure(), ms(2_000));
        assert_eq!(policy.on_failure(), ms(2_000));
    }
}
