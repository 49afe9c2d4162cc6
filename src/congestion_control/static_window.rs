use std::net::SocketAddr;
use crate::congestion_control::{CongestionControl, CongestionOutcome, RebuildSample};

/// Advertises the same window for the image's entire life and ignores RTT
pub struct StaticWindowCongestionControl {
    window_length: i32,
}

impl StaticWindowCongestionControl {
    pub fn new(window_length: i32) -> StaticWindowCongestionControl {
        StaticWindowCongestionControl { window_length }
    }
}

impl CongestionControl for StaticWindowCongestionControl {
    fn initial_window_length(&self) -> i32 {
        self.window_length
    }

    fn max_window_length(&self) -> i32 {
        self.window_length
    }

    fn should_measure_rtt(&self, _now_ns: i64) -> bool {
        false
    }

    fn on_rttm_sent(&self, _now_ns: i64) {}

    fn on_rttm(&self, _now_ns: i64, _rtt_ns: i64, _source: SocketAddr) {}

    fn on_track_rebuild(&self, _sample: &RebuildSample) -> CongestionOutcome {
        CongestionOutcome {
            window_length: self.window_length,
            force_status_message: false,
        }
    }
}
