//! Strategies that decide the receive window an image advertises to the sender.
//!
//! A strategy is called from two contexts: RTT samples arrive on the receive path, window
//!  decisions are made by rebuild tracking in the scheduler. Implementations therefore take
//!  `&self` and keep their mutable state in atomics.

pub mod hs_congestion_control;
pub mod static_window;

use std::net::SocketAddr;
use std::sync::Arc;
#[cfg(test)] use mockall::automock;
use crate::config::{CongestionControlKind, ReceiverConfig};
use crate::congestion_control::hs_congestion_control::HsCongestionControl;
use crate::congestion_control::static_window::StaticWindowCongestionControl;

/// What rebuild tracking observed during one tick
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RebuildSample {
    pub now_ns: i64,
    /// the slowest subscriber's position, capped at the rebuilt position
    pub consumption_position: i64,
    pub last_status_message_position: i64,
    pub window_length: i32,
    pub hwm_position: i64,
    pub loss_occurred: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CongestionOutcome {
    pub window_length: i32,
    /// send a status message right away instead of waiting for the regular cadence
    pub force_status_message: bool,
}

#[cfg_attr(test, automock)]
pub trait CongestionControl: Send + Sync + 'static {
    fn initial_window_length(&self) -> i32;
    fn max_window_length(&self) -> i32;

    fn should_measure_rtt(&self, now_ns: i64) -> bool;
    fn on_rttm_sent(&self, now_ns: i64);
    fn on_rttm(&self, now_ns: i64, rtt_ns: i64, source: SocketAddr);

    fn on_track_rebuild(&self, sample: &RebuildSample) -> CongestionOutcome;
}

pub fn create(config: &ReceiverConfig, term_length: i32, mtu_length: i32) -> Arc<dyn CongestionControl> {
    let max_window_length = config.effective_window_length(term_length);
    match config.congestion_control {
        CongestionControlKind::Static => Arc::new(StaticWindowCongestionControl::new(max_window_length)),
        CongestionControlKind::HighSpeed => Arc::new(HsCongestionControl::new(max_window_length, mtu_length, config.rttm_interval)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create() {
        let mut config = ReceiverConfig::default_config();

        let static_window = create(&config, 65536, 1408);
        assert_eq!(static_window.max_window_length(), 32768);
        assert_eq!(static_window.initial_window_length(), 32768);
        assert!(!static_window.should_measure_rtt(i64::MAX));

        config.congestion_control = CongestionControlKind::HighSpeed;
        let hs = create(&config, 1024 * 1024, 1408);
        assert_eq!(hs.max_window_length(), 128 * 1024);
        assert!(hs.initial_window_length() <= 128 * 1024);
        assert!(hs.should_measure_rtt(i64::MAX));
    }
}
