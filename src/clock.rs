use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use crate::safe_converter::PrecheckedCast;

/// Monotonic time in nanoseconds since an arbitrary, clock specific epoch. All timestamps that
///  are compared with each other must come from the same clock.
pub trait NanoClock: Send + Sync + 'static {
    fn nano_time(&self) -> i64;
}

pub struct SystemNanoClock {
    epoch: Instant,
}

impl SystemNanoClock {
    pub fn new() -> SystemNanoClock {
        SystemNanoClock {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemNanoClock {
    fn default() -> Self {
        Self::new()
    }
}

impl NanoClock for SystemNanoClock {
    fn nano_time(&self) -> i64 {
        nanos(self.epoch.elapsed())
    }
}

/// A clock that only moves when it is advanced, for driving timeouts deterministically.
#[derive(Default)]
pub struct CachedNanoClock {
    now: AtomicI64,
}

impl CachedNanoClock {
    pub fn new(now: i64) -> CachedNanoClock {
        CachedNanoClock {
            now: AtomicI64::new(now),
        }
    }

    pub fn advance(&self, delta: Duration) {
        self.now.fetch_add(nanos(delta), Ordering::AcqRel);
    }
}

impl NanoClock for CachedNanoClock {
    fn nano_time(&self) -> i64 {
        self.now.load(Ordering::Acquire)
    }
}

/// durations are capped at ~292 years
pub fn nanos(duration: Duration) -> i64 {
    duration.as_nanos().min(i64::MAX as u128).prechecked_cast()
}
