//! Counters shared between the image and the rest of the driver.
//!
//! An [AtomicCounter] is used both for diagnostic counters (heartbeats received, flow control
//!  under-runs etc.) and for positions (receiver high-water mark, rebuilt position, subscriber
//!  positions). Each counter lives on its own cache line, and each one has exactly one writer;
//!  readers in other contexts use acquire loads.
//!
//! Counters are allocated and freed through the [CountersManager]. Images *reference* their
//!  counters, they never own them.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use anyhow::bail;
use crossbeam_utils::CachePadded;
use num_enum::IntoPrimitive;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

pub const SYSTEM_COUNTER_TYPE_ID: i32 = 0;
pub const RECEIVER_HWM_TYPE_ID: i32 = 3;
pub const SUBSCRIBER_POSITION_TYPE_ID: i32 = 4;
pub const RECEIVER_POS_TYPE_ID: i32 = 5;

#[derive(Debug)]
pub struct AtomicCounter {
    id: i32,
    value: CachePadded<AtomicI64>,
}

impl AtomicCounter {
    pub fn new(id: i32, initial_value: i64) -> AtomicCounter {
        AtomicCounter {
            id,
            value: CachePadded::new(AtomicI64::new(initial_value)),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// read without ordering guarantees - only for the counter's single writer
    pub fn get_plain(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn set_ordered(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    /// returns the value *before* the increment
    pub fn increment_ordered(&self) -> i64 {
        self.value.fetch_add(1, Ordering::Release)
    }

    /// Set the counter to `proposed` if that is greater than the current value. Returns `true`
    ///  iff the value was changed, i.e. the counter never moves backwards.
    pub fn propose_max_ordered(&self, proposed: i64) -> bool {
        let mut current = self.value.load(Ordering::Relaxed);
        while current < proposed {
            match self.value.compare_exchange_weak(current, proposed, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }
}

struct CounterEntry {
    type_id: i32,
    label: String,
    counter: Arc<AtomicCounter>,
}

#[derive(Default)]
struct CountersTable {
    next_id: i32,
    free_ids: Vec<i32>,
    entries: FxHashMap<i32, CounterEntry>,
}

/// The process-wide counters registry. Allocation and release happen on the control path only,
///  so the table is guarded by a mutex; the counters themselves are lock-free.
pub struct CountersManager {
    capacity: usize,
    table: Mutex<CountersTable>,
}

impl CountersManager {
    pub fn new(capacity: usize) -> CountersManager {
        CountersManager {
            capacity,
            table: Mutex::new(CountersTable::default()),
        }
    }

    pub fn allocate(&self, type_id: i32, label: impl Into<String>) -> anyhow::Result<Arc<AtomicCounter>> {
        let label = label.into();
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);

        if table.entries.len() >= self.capacity {
            warn!("unable to allocate counter '{}': all {} counters are in use", label, self.capacity);
            bail!("unable to allocate counter '{}': all {} counters are in use", label, self.capacity);
        }

        let id = match table.free_ids.pop() {
            Some(id) => id,
            None => {
                let id = table.next_id;
                table.next_id += 1;
                id
            }
        };

        trace!("allocated counter #{} of type {}: {}", id, type_id, label);
        let counter = Arc::new(AtomicCounter::new(id, 0));
        table.entries.insert(id, CounterEntry {
            type_id,
            label,
            counter: counter.clone(),
        });
        Ok(counter)
    }

    /// Release a counter id for reuse. The counter's current holders keep a valid (but
    ///  unregistered) counter.
    pub fn free(&self, counter_id: i32) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        match table.entries.remove(&counter_id) {
            Some(entry) => {
                trace!("freed counter #{}: {}", counter_id, entry.label);
                table.free_ids.push(counter_id);
            }
            None => {
                debug!("counter #{} is not allocated - ignoring", counter_id);
            }
        }
    }

    pub fn label(&self, counter_id: i32) -> Option<String> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.entries.get(&counter_id)
            .map(|entry| entry.label.clone())
    }

    pub fn type_id(&self, counter_id: i32) -> Option<i32> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.entries.get(&counter_id)
            .map(|entry| entry.type_id)
    }

    pub fn value(&self, counter_id: i32) -> Option<i64> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.entries.get(&counter_id)
            .map(|entry| entry.counter.get())
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
            .entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive)]
#[repr(usize)]
pub enum SystemCounterId {
    HeartbeatsReceived,
    FlowControlUnderRuns,
    FlowControlOverRuns,
    StatusMessagesSent,
    NakMessagesSent,
    RttmsSent,
    InvalidPackets,
    LossGapFills,
}

impl SystemCounterId {
    pub const ALL: [SystemCounterId; 8] = [
        SystemCounterId::HeartbeatsReceived,
        SystemCounterId::FlowControlUnderRuns,
        SystemCounterId::FlowControlOverRuns,
        SystemCounterId::StatusMessagesSent,
        SystemCounterId::NakMessagesSent,
        SystemCounterId::RttmsSent,
        SystemCounterId::InvalidPackets,
        SystemCounterId::LossGapFills,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            SystemCounterId::HeartbeatsReceived => "Heartbeats received",
            SystemCounterId::FlowControlUnderRuns => "Flow control under runs",
            SystemCounterId::FlowControlOverRuns => "Flow control over runs",
            SystemCounterId::StatusMessagesSent => "Status messages sent",
            SystemCounterId::NakMessagesSent => "NAKs sent",
            SystemCounterId::RttmsSent => "RTT measurements sent",
            SystemCounterId::InvalidPackets => "Invalid packets",
            SystemCounterId::LossGapFills => "Loss gap fills",
        }
    }
}

/// The driver-wide diagnostic counters, allocated once and shared by all images
pub struct SystemCounters {
    counters: Vec<Arc<AtomicCounter>>,
}

impl SystemCounters {
    pub fn new(counters_manager: &CountersManager) -> anyhow::Result<SystemCounters> {
        let counters = SystemCounterId::ALL.iter()
            .map(|id| counters_manager.allocate(SYSTEM_COUNTER_TYPE_ID, id.label()))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(SystemCounters { counters })
    }

    pub fn get(&self, id: SystemCounterId) -> Arc<AtomicCounter> {
        let idx: usize = id.into();
        self.counters[idx].clone()
    }

    pub fn value(&self, id: SystemCounterId) -> i64 {
        let idx: usize = id.into();
        self.counters[idx].get()
    }
}
