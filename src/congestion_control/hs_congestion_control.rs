//! This is an adaptation of Sally Floyd's High Speed TCP (RFC 3649) congestion control to the
//!  receive window. See https://www.icir.org/floyd/hstcp.html
//!
//! The idea is to use AIMD with 'adaptive' increments / decrement factors, adding a bigger
//!  amount and decreasing by a smaller factor the larger cwnd is. cwnd is counted in MTU sized
//!  frames, and the advertised window is `cwnd * mtu`, capped at the image's maximum window.
//!
//! On the receive side there are no ACKs. A rebuild tick that advanced without loss plays the
//!  role of an ACK, and a newly detected gap plays the role of a loss event. Both are applied
//!  at most once per smoothed RTT, which is measured with RTT measurement frames.

use std::cmp::{max, min};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};
use crate::clock::nanos;
use crate::congestion_control::{CongestionControl, CongestionOutcome, RebuildSample};
use crate::safe_converter::PrecheckedCast;

/// From AIMD tables in RFC 3649 appendix B, with fixed-point MD scaled at << 8
/// (implementation idea from John Heffner's Linux kernel implementation).
///
/// The first value of the pair is the cwnd value up to which the entry applies. The index in the
///  list plus 1 is the additive increment (AI). The second value of the pair is the variable
///  part `b` for the multiplicative decrease  w <- w * (1 - b(w)), fixed-point encoded.
const AIMD_VALUES: [(u32, u32); 73] = [
    (     38,  128, /*  0.50 */ ),
    (    118,  112, /*  0.44 */ ),
    (    221,  104, /*  0.41 */ ),
    (    347,   98, /*  0.38 */ ),
    (    495,   93, /*  0.37 */ ),
    (    663,   89, /*  0.35 */ ),
    (    851,   86, /*  0.34 */ ),
    (   1058,   83, /*  0.33 */ ),
    (   1284,   81, /*  0.32 */ ),
    (   1529,   78, /*  0.31 */ ),
    (   1793,   76, /*  0.30 */ ),
    (   2076,   74, /*  0.29 */ ),
    (   2378,   72, /*  0.28 */ ),
    (   2699,   71, /*  0.28 */ ),
    (   3039,   69, /*  0.27 */ ),
    (   3399,   68, /*  0.27 */ ),
    (   3778,   66, /*  0.26 */ ),
    (   4177,   65, /*  0.26 */ ),
    (   4596,   64, /*  0.25 */ ),
    (   5036,   62, /*  0.25 */ ),
    (   5497,   61, /*  0.24 */ ),
    (   5979,   60, /*  0.24 */ ),
    (   6483,   59, /*  0.23 */ ),
    (   7009,   58, /*  0.23 */ ),
    (   7558,   57, /*  0.22 */ ),
    (   8130,   56, /*  0.22 */ ),
    (   8726,   55, /*  0.22 */ ),
    (   9346,   54, /*  0.21 */ ),
    (   9991,   53, /*  0.21 */ ),
    (  10661,   52, /*  0.21 */ ),
    (  11358,   52, /*  0.20 */ ),
    (  12082,   51, /*  0.20 */ ),
    (  12834,   50, /*  0.20 */ ),
    (  13614,   49, /*  0.19 */ ),
    (  14424,   48, /*  0.19 */ ),
    (  15265,   48, /*  0.19 */ ),
    (  16137,   47, /*  0.19 */ ),
    (  17042,   46, /*  0.18 */ ),
    (  17981,   45, /*  0.18 */ ),
    (  18955,   45, /*  0.18 */ ),
    (  19965,   44, /*  0.17 */ ),
    (  21013,   43, /*  0.17 */ ),
    (  22101,   43, /*  0.17 */ ),
    (  23230,   42, /*  0.17 */ ),
    (  24402,   41, /*  0.16 */ ),
    (  25618,   41, /*  0.16 */ ),
    (  26881,   40, /*  0.16 */ ),
    (  28193,   39, /*  0.16 */ ),
    (  29557,   39, /*  0.15 */ ),
    (  30975,   38, /*  0.15 */ ),
    (  32450,   38, /*  0.15 */ ),
    (  33986,   37, /*  0.15 */ ),
    (  35586,   36, /*  0.14 */ ),
    (  37253,   36, /*  0.14 */ ),
    (  38992,   35, /*  0.14 */ ),
    (  40808,   35, /*  0.14 */ ),
    (  42707,   34, /*  0.13 */ ),
    (  44694,   33, /*  0.13 */ ),
    (  46776,   33, /*  0.13 */ ),
    (  48961,   32, /*  0.13 */ ),
    (  51258,   32, /*  0.13 */ ),
    (  53677,   31, /*  0.12 */ ),
    (  56230,   30, /*  0.12 */ ),
    (  58932,   30, /*  0.12 */ ),
    (  61799,   29, /*  0.12 */ ),
    (  64851,   28, /*  0.11 */ ),
    (  68113,   28, /*  0.11 */ ),
    (  71617,   27, /*  0.11 */ ),
    (  75401,   26, /*  0.10 */ ),
    (  79517,   26, /*  0.10 */ ),
    (  84035,   25, /*  0.10 */ ),
    (  89053,   24, /*  0.10 */ ),
    ( u32::MAX, 23, /*  0.09 */ ),
];

/// The AIMD state proper. It is a plain value so the strategy can keep it in a single atomic
///  word; the AIMD table index is derived from cwnd rather than stored.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct HsWindow {
    cwnd: u32,
    cwnd_cnt: u32,
}

impl HsWindow {
    fn initial(cwnd_limit: u32) -> HsWindow {
        assert!(cwnd_limit >= 2);

        const START_CWND: u32 = 100;

        let cwnd = if cwnd_limit <= AIMD_VALUES[0].0 {
            cwnd_limit
        }
        else {
            min(cwnd_limit, START_CWND)
        };

        HsWindow { cwnd, cwnd_cnt: 0 }
    }

    fn from_bits(bits: u64) -> HsWindow {
        HsWindow {
            cwnd: (bits >> 32) as u32,
            cwnd_cnt: bits as u32,
        }
    }

    fn to_bits(self) -> u64 {
        (u64::from(self.cwnd) << 32) | u64::from(self.cwnd_cnt)
    }

    fn ai(&self) -> usize {
        AIMD_VALUES.iter()
            .position(|&(upper, _)| self.cwnd <= upper)
            .unwrap_or(AIMD_VALUES.len() - 1)
    }

    fn is_slow_start(&self) -> bool {
        self.cwnd <= AIMD_VALUES[0].0
    }

    /// `frames_in_flight` is the number of MTU sized frames between the consumption position
    ///  and the high-water mark, i.e. how much of the window the sender actually uses
    fn on_ack(&mut self, cwnd_limit: u32, frames_in_flight: u32) {
        if self.cwnd >= cwnd_limit {
            return;
        }

        if self.is_slow_start() {
            // in slow start, half the window being in use is enough reason to grow it
            if self.cwnd > 2*frames_in_flight {
                trace!("slow start - less than cwnd/2 frames in flight -> no adjustment");
                return;
            }
            self.cwnd += 1;
        }
        else {
            // in the spirit of RFC 2861, a window that is not used fully says nothing about
            //  available bandwidth
            if self.cwnd > frames_in_flight {
                trace!("congestion avoidance - less than cwnd frames in flight -> no adjustment");
                return;
            }

            let increment: u32 = (self.ai() + 1).prechecked_cast();
            self.cwnd_cnt += increment;
            while self.cwnd_cnt >= self.cwnd {
                self.cwnd_cnt -= self.cwnd;
                self.cwnd += 1;
            }
        }

        self.cwnd = min(self.cwnd, cwnd_limit);
    }

    fn on_loss(&mut self) {
        let b = AIMD_VALUES[self.ai()].1;
        let capped_product = self.cwnd.checked_mul(b)
            .unwrap_or(u32::MAX);

        self.cwnd = max(2, self.cwnd - (capped_product >> 8));
        // a leftover counter could let cwnd jump right back up
        self.cwnd_cnt = 0;
    }
}

pub struct HsCongestionControl {
    mtu_length: i32,
    max_window_length: i32,
    cwnd_limit: u32,
    rttm_interval_ns: i64,

    window: AtomicU64,
    smoothed_rtt_ns: AtomicI64,
    last_rttm_sent_ns: AtomicI64,
    last_adjustment_ns: AtomicI64,
}

impl HsCongestionControl {
    pub fn new(max_window_length: i32, mtu_length: i32, rttm_interval: Duration) -> HsCongestionControl {
        let cwnd_limit: u32 = max(2, max_window_length / mtu_length.max(1)).prechecked_cast();

        HsCongestionControl {
            mtu_length,
            max_window_length,
            cwnd_limit,
            rttm_interval_ns: nanos(rttm_interval),
            window: AtomicU64::new(HsWindow::initial(cwnd_limit).to_bits()),
            smoothed_rtt_ns: AtomicI64::new(0),
            last_rttm_sent_ns: AtomicI64::new(i64::MIN),
            last_adjustment_ns: AtomicI64::new(i64::MIN),
        }
    }

    pub fn cwnd(&self) -> u32 {
        HsWindow::from_bits(self.window.load(Ordering::Acquire)).cwnd
    }

    pub fn smoothed_rtt_ns(&self) -> i64 {
        self.smoothed_rtt_ns.load(Ordering::Acquire)
    }

    fn window_length_for(&self, cwnd: u32) -> i32 {
        let cwnd: i64 = cwnd.into();
        min(cwnd * i64::from(self.mtu_length), i64::from(self.max_window_length)).prechecked_cast()
    }
}

impl CongestionControl for HsCongestionControl {
    fn initial_window_length(&self) -> i32 {
        self.window_length_for(self.cwnd())
    }

    fn max_window_length(&self) -> i32 {
        self.max_window_length
    }

    fn should_measure_rtt(&self, now_ns: i64) -> bool {
        now_ns.saturating_sub(self.last_rttm_sent_ns.load(Ordering::Acquire)) >= self.rttm_interval_ns
    }

    fn on_rttm_sent(&self, now_ns: i64) {
        self.last_rttm_sent_ns.store(now_ns, Ordering::Release);
    }

    fn on_rttm(&self, _now_ns: i64, rtt_ns: i64, source: SocketAddr) {
        let previous = self.smoothed_rtt_ns.load(Ordering::Acquire);
        let smoothed = if previous == 0 {
            rtt_ns
        }
        else {
            previous - (previous >> 3) + (rtt_ns >> 3)
        };
        trace!("RTT sample from {}: {}ns, smoothed {}ns", source, rtt_ns, smoothed);
        self.smoothed_rtt_ns.store(smoothed, Ordering::Release);
    }

    fn on_track_rebuild(&self, sample: &RebuildSample) -> CongestionOutcome {
        let previous = HsWindow::from_bits(self.window.load(Ordering::Acquire));
        let mut window = previous;

        let last_adjustment_ns = self.last_adjustment_ns.load(Ordering::Relaxed);
        if sample.now_ns.saturating_sub(last_adjustment_ns) >= self.smoothed_rtt_ns() {
            if sample.loss_occurred {
                window.on_loss();
                debug!("loss -> adjusting cwnd downwards to {}", window.cwnd);
            }
            else {
                let in_flight = (sample.hwm_position - sample.consumption_position).max(0);
                let frames_in_flight = (in_flight + i64::from(self.mtu_length) - 1) / i64::from(self.mtu_length);
                window.on_ack(self.cwnd_limit, frames_in_flight.min(i64::from(u32::MAX)).prechecked_cast());
            }
            self.last_adjustment_ns.store(sample.now_ns, Ordering::Relaxed);
        }

        if window != previous {
            self.window.store(window.to_bits(), Ordering::Release);
        }

        let window_length = self.window_length_for(window.cwnd);
        if window_length != sample.window_length {
            debug!("receive window {} -> {}", sample.window_length, window_length);
        }
        CongestionOutcome {
            window_length,
            force_status_message: window_length != sample.window_length,
        }
    }
}
