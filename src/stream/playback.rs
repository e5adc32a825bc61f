//! Backlog-adaptive typewriter rate.
//!
//! Small backlogs play at roughly typing speed. Large ones (a backgrounded
//! tab, a burst from the network) catch up quickly instead of trickling.

use std::time::Duration;

use crate::core::config::PlaybackConfig;

/// Release rate in characters per second for a given backlog.
#[must_use]
pub fn release_rate(config: &PlaybackConfig, backlog: usize) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let backlog = backlog as f64;
    let rate = config.base_rate + config.sqrt_gain * backlog.sqrt() + config.linear_gain * backlog;
    rate.min(config.rate_cap)
}

/// Characters to release after `elapsed`: at least one while a backlog
/// exists, never more than the backlog.
#[must_use]
pub fn chars_to_release(config: &PlaybackConfig, backlog: usize, elapsed: Duration) -> usize {
    if backlog == 0 {
        return 0;
    }
    let budget = release_rate(config, backlog) * elapsed.as_secs_f64();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let budget = budget.floor().max(0.0) as usize;
    budget.clamp(1, backlog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_grows_with_backlog() {
        let config = PlaybackConfig::default();
        let small = release_rate(&config, 4);
        let large = release_rate(&config, 400);
        assert!((small - (40.0 + 8.0 * 2.0 + 2.0 * 4.0)).abs() < f64::EPSILON);
        assert!(large > small);
    }

    #[test]
    fn test_rate_is_capped() {
        let config = PlaybackConfig::default();
        assert!((release_rate(&config, 1_000_000) - config.rate_cap).abs() < f64::EPSILON);
    }

    #[test]
    fn test_minimum_one_char_per_tick() {
        let config = PlaybackConfig::default();
        assert_eq!(chars_to_release(&config, 5, Duration::ZERO), 1);
        assert_eq!(chars_to_release(&config, 0, Duration::from_secs(1)), 0);
    }

    #[test]
    fn test_release_never_exceeds_backlog() {
        let config = PlaybackConfig::default();
        assert_eq!(chars_to_release(&config, 11, Duration::from_secs(10)), 11);
    }

    #[test]
    fn test_frame_release_at_default_rate() {
        let config = PlaybackConfig::default();
        // 100 chars: 40 + 80 + 200 = 320 chars/s, 16 ms frame.
        assert_eq!(chars_to_release(&config, 100, Duration::from_millis(16)), 5);
    }
}
