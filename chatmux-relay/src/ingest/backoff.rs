//! Restart delay for harvester subprocesses
//!
//! **Backoff Strategy:**
//! - First delay: `base`
//! - Multiplier: 2 (exponential)
//! - Ceiling: `max`
//! - Reset to `base` after a healthy run

use std::time::Duration;

/// Delay that follows `current`
///
/// Never below `base`, never above `max`. A `max` smaller than `base` is treated as `base`.
pub fn next_backoff(current: Duration, base: Duration, max: Duration) -> Duration {
    let max = max.max(base);
    if current < base {
        return base;
    }
    current.saturating_mul(2).min(max)
}

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
        }
    }

    /// Delay to wait now; advances the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = next_backoff(self.current, self.base, self.max);
        delay
    }

    /// Delay the next call to [`Backoff::next_delay`] will return
    pub fn peek(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_delays_double_until_capped() {
        let mut backoff = Backoff::new(ms(100), ms(1000));
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000, 1000]);
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut backoff = Backoff::new(ms(50), ms(400));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.peek(), ms(200));

        backoff.reset();
        assert_eq!(backoff.next_delay(), ms(50));
    }

    #[test]
    fn test_next_backoff_bounds() {
        assert_eq!(next_backoff(Duration::ZERO, ms(10), ms(100)), ms(10));
        assert_eq!(next_backoff(ms(60), ms(10), ms(100)), ms(100));
        // max below base collapses to base
        assert_eq!(next_backoff(ms(10), ms(10), ms(5)), ms(10));
        assert_eq!(next_backoff(Duration::MAX, ms(10), ms(100)), ms(100));
    }
}
