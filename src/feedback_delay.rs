use std::cmp::min;
use std::time::Duration;
use crate::clock::nanos;

/// Decides how long the receiver waits before (re-)sending a NAK for a gap. Waiting a little
///  gives reordered frames a chance to fill the gap without a re-send.
pub trait FeedbackDelayGenerator: Send {
    /// delay for a newly detected gap; resets any backoff state
    fn initial_delay_ns(&mut self) -> i64;

    /// delay before the next NAK for a gap that is still open
    fn retry_delay_ns(&mut self) -> i64;
}

pub struct StaticDelayGenerator {
    delay_ns: i64,
}

impl StaticDelayGenerator {
    pub fn new(delay: Duration) -> StaticDelayGenerator {
        StaticDelayGenerator {
            delay_ns: nanos(delay),
        }
    }
}

impl FeedbackDelayGenerator for StaticDelayGenerator {
    fn initial_delay_ns(&mut self) -> i64 {
        self.delay_ns
    }

    fn retry_delay_ns(&mut self) -> i64 {
        self.delay_ns
    }
}

/// Grows the delay between NAKs for the same gap by a factor (in eighths) up to a limit
pub struct BackoffDelayGenerator {
    current_delay_ns: i64,

    config_initial_delay_ns: i64,
    config_max_delay_ns: i64,
    config_factor_eighths: i64,
}

impl BackoffDelayGenerator {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> BackoffDelayGenerator {
        let result = BackoffDelayGenerator {
            current_delay_ns: nanos(initial_delay),
            config_initial_delay_ns: nanos(initial_delay),
            config_max_delay_ns: nanos(max_delay),
            config_factor_eighths: 8*2,
        };

        assert!(result.config_factor_eighths >= 8);

        result
    }
}

impl FeedbackDelayGenerator for BackoffDelayGenerator {
    fn initial_delay_ns(&mut self) -> i64 {
        self.current_delay_ns = self.config_initial_delay_ns;
        self.current_delay_ns
    }

    fn retry_delay_ns(&mut self) -> i64 {
        // an initial delay of zero must not get stuck at zero
        let grown = (self.current_delay_ns.max(1).saturating_mul(self.config_factor_eighths)) >> 3;
        self.current_delay_ns = min(grown, self.config_max_delay_ns);
        self.current_delay_ns
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_static() {
        let mut generator = StaticDelayGenerator::new(Duration::from_millis(5));
        assert_eq!(generator.initial_delay_ns(), 5_000_000);
        assert_eq!(generator.retry_delay_ns(), 5_000_000);
        assert_eq!(generator.retry_delay_ns(), 5_000_000);
    }

    #[rstest]
    #[case::double(10, 10, 1000, 16, 20)]
    #[case::double_capped(800, 10, 1000, 16, 1000)]
    #[case::at_max(1000, 10, 1000, 16, 1000)]
    #[case::factor_1_5(12, 10, 1000, 12, 18)]
    #[case::factor_1_5_capped(999, 10, 1000, 12, 1000)]
    #[case::from_zero(0, 0, 1000, 16, 2)]
    fn test_retry_delay(
        #[case] current_delay_ns: i64,
        #[case] config_initial_delay_ns: i64,
        #[case] config_max_delay_ns: i64,
        #[case] config_factor_eighths: i64,
        #[case] expected: i64,
    ) {
        let mut generator = BackoffDelayGenerator {
            current_delay_ns,
            config_initial_delay_ns,
            config_max_delay_ns,
            config_factor_eighths,
        };

        assert_eq!(generator.retry_delay_ns(), expected);
        assert_eq!(generator.current_delay_ns, expected);
    }

    #[test]
    fn test_initial_resets() {
        let mut generator = BackoffDelayGenerator::new(Duration::from_nanos(10), Duration::from_nanos(1000));
        assert_eq!(generator.retry_delay_ns(), 20);
        assert_eq!(generator.retry_delay_ns(), 40);
        assert_eq!(generator.initial_delay_ns(), 10);
        assert_eq!(generator.retry_delay_ns(), 20);
    }
}
