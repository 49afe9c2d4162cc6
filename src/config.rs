use std::cmp::min;
use std::time::Duration;
use anyhow::bail;
use crate::frame::FRAME_ALIGNMENT;

/// Selects the receive window strategy that new images are created with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionControlKind {
    /// a fixed window that is advertised unchanged for the image's entire life
    Static,
    /// AIMD adapted from High Speed TCP, see [crate::congestion_control::hs_congestion_control]
    HighSpeed,
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Number of term buffers in each image's log. The log can hold at most
    ///  `term_count * term_length` bytes of data that was not cleaned yet, and the advertised
    ///  window is capped at half a term, so two terms are the bare minimum.
    pub term_count: usize,

    /// This is the upper bound for the receive window advertised in status messages. The
    ///  effective window is additionally capped at half the term length of each image (see
    ///  [ReceiverConfig::effective_window_length]).
    pub receiver_window_length: i32,

    /// An image that receives neither data nor heartbeats for this long becomes inactive
    pub image_liveness_timeout: Duration,
    /// grace period between an image becoming inactive and the release of its resources, giving
    ///  subscribers time to drain and deregister
    pub image_linger_timeout: Duration,

    /// A status message is sent at least this often, even if the window did not move
    pub status_message_timeout: Duration,
    pub conductor_tick_interval: Duration,

    /// Delay before the first NAK for a newly detected gap. Regular out-of-order arrival
    ///  should get a chance to fill the gap before a re-send is requested.
    pub nak_delay: Duration,
    /// upper bound for the backoff between repeated NAKs for the same gap
    pub nak_max_backoff: Duration,

    pub rttm_interval: Duration,

    pub receiver_id: i64,
    pub congestion_control: CongestionControlKind,

    /// maximum number of counters the counters registry hands out
    pub counters_capacity: usize,
}

impl ReceiverConfig {
    pub fn default_config() -> ReceiverConfig {
        ReceiverConfig {
            term_count: 3,
            receiver_window_length: 128 * 1024,
            image_liveness_timeout: Duration::from_secs(10),
            image_linger_timeout: Duration::from_secs(5),
            status_message_timeout: Duration::from_millis(200),
            conductor_tick_interval: Duration::from_millis(1),
            nak_delay: Duration::from_millis(60),
            nak_max_backoff: Duration::from_secs(1),
            rttm_interval: Duration::from_millis(10),
            receiver_id: 0,
            congestion_control: CongestionControlKind::Static,
            counters_capacity: 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.term_count < 2 {
            bail!("term count must be at least 2, was {}", self.term_count);
        }
        if self.receiver_window_length < FRAME_ALIGNMENT || self.receiver_window_length % FRAME_ALIGNMENT != 0 {
            bail!("receiver window length must be a positive multiple of {} bytes, was {}", FRAME_ALIGNMENT, self.receiver_window_length);
        }
        if self.image_liveness_timeout.is_zero() {
            bail!("image liveness timeout must not be zero");
        }
        if self.status_message_timeout.is_zero() || self.status_message_timeout >= self.image_liveness_timeout {
            bail!("status message timeout must be between zero and the image liveness timeout, was {:?}", self.status_message_timeout);
        }
        if self.conductor_tick_interval.is_zero() {
            bail!("conductor tick interval must not be zero");
        }
        if self.nak_max_backoff < self.nak_delay {
            bail!("NAK backoff limit {:?} is below the initial NAK delay {:?}", self.nak_max_backoff, self.nak_delay);
        }
        if self.counters_capacity == 0 {
            bail!("counters capacity must not be zero");
        }

        Ok(())
    }

    pub fn effective_window_length(&self, term_length: i32) -> i32 {
        min(self.receiver_window_length, term_length / 2)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ReceiverConfig::default_config().validate().is_ok());
    }

    #[rstest]
    #[case::single_term(|c: &mut ReceiverConfig| c.term_count = 1)]
    #[case::tiny_window(|c: &mut ReceiverConfig| c.receiver_window_length = 16)]
    #[case::unaligned_window(|c: &mut ReceiverConfig| c.receiver_window_length = 64 * 1024 + 8)]
    #[case::no_liveness(|c: &mut ReceiverConfig| c.image_liveness_timeout = Duration::ZERO)]
    #[case::sm_after_liveness(|c: &mut ReceiverConfig| c.status_message_timeout = Duration::from_secs(20))]
    #[case::no_tick(|c: &mut ReceiverConfig| c.conductor_tick_interval = Duration::ZERO)]
    #[case::backoff_below_delay(|c: &mut ReceiverConfig| c.nak_max_backoff = Duration::from_millis(1))]
    #[case::no_counters(|c: &mut ReceiverConfig| c.counters_capacity = 0)]
    fn test_validate_rejects(#[case] tweak: fn(&mut ReceiverConfig)) {
        let mut config = ReceiverConfig::default_config();
        tweak(&mut config);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::capped_by_term(64 * 1024, 32 * 1024)]
    #[case::exactly_half(256 * 1024, 128 * 1024)]
    #[case::capped_by_config(1024 * 1024, 128 * 1024)]
    fn test_effective_window_length(#[case] term_length: i32, #[case] expected: i32) {
        assert_eq!(ReceiverConfig::default_config().effective_window_length(term_length), expected);
    }
}
