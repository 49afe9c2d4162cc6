use tracing::{debug, trace};
use crate::buffers::term_buffer::TermBuffer;
use crate::feedback_delay::FeedbackDelayGenerator;
use crate::position::compute_term_id_from_position;
use crate::term_gap_scanner::scan_for_gap;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Gap {
    pub term_id: i32,
    pub term_offset: i32,
    pub length: i32,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ScanOutcome {
    /// offset in the scanned term up to which data is contiguous
    pub rebuild_offset: i32,
    /// a gap was detected that was not known before
    pub loss_found: bool,
    /// the previously tracked gap is no longer there
    pub gap_filled: bool,
}

/// Tracks the first gap between the rebuilt position and the high-water mark, and decides when
///  feedback (a NAK, or filling the gap for unreliable streams) is due for it.
///
/// Only one gap is tracked at a time: the one that blocks the rebuilt position. Gaps further
///  up are picked up once the earlier ones are resolved.
pub struct LossDetector {
    delay_generator: Box<dyn FeedbackDelayGenerator>,
    active_gap: Option<Gap>,
    deadline_ns: i64,
}

impl LossDetector {
    pub fn new(delay_generator: Box<dyn FeedbackDelayGenerator>) -> LossDetector {
        LossDetector {
            delay_generator,
            active_gap: None,
            deadline_ns: i64::MAX,
        }
    }

    pub fn active_gap(&self) -> Option<Gap> {
        self.active_gap
    }

    /// Scans the term containing `rebuild_position`, up to the high-water mark or the end of
    ///  the term, whichever comes first.
    ///
    /// Returns the outcome and, if feedback for the active gap is due at `now_ns`, the gap.
    #[allow(clippy::too_many_arguments)]
    pub fn scan(
        &mut self,
        term_buffer: &TermBuffer,
        rebuild_position: i64,
        hwm_position: i64,
        now_ns: i64,
        term_length_mask: i32,
        position_bits_to_shift: u32,
        initial_term_id: i32,
    ) -> (ScanOutcome, Option<Gap>) {
        let rebuild_offset = (rebuild_position & i64::from(term_length_mask)) as i32;

        if rebuild_position >= hwm_position {
            let gap_filled = self.active_gap.take().is_some();
            return (ScanOutcome { rebuild_offset, loss_found: false, gap_filled }, None);
        }

        let rebuild_term_count = rebuild_position >> position_bits_to_shift;
        let hwm_term_count = hwm_position >> position_bits_to_shift;
        let rebuild_term_id = compute_term_id_from_position(rebuild_position, position_bits_to_shift, initial_term_id);
        let limit_offset = if rebuild_term_count == hwm_term_count {
            (hwm_position & i64::from(term_length_mask)) as i32
        }
        else {
            term_length_mask + 1
        };

        let mut scanned_gap = None;
        let rebuild_offset = scan_for_gap(term_buffer, rebuild_term_id, rebuild_offset, limit_offset, |term_id, term_offset, length| {
            scanned_gap = Some(Gap { term_id, term_offset, length });
        });

        let mut outcome = ScanOutcome { rebuild_offset, loss_found: false, gap_filled: false };
        let Some(gap) = scanned_gap else {
            outcome.gap_filled = self.active_gap.take().is_some();
            return (outcome, None);
        };

        match self.active_gap {
            Some(active) if active.term_id == gap.term_id && active.term_offset == gap.term_offset => {
                // the same gap, possibly partially filled from the end
                self.active_gap = Some(gap);
            }
            previous => {
                if previous.is_some() {
                    outcome.gap_filled = true;
                }
                debug!("detected gap {:?}", gap);
                self.active_gap = Some(gap);
                self.deadline_ns = now_ns.saturating_add(self.delay_generator.initial_delay_ns());
                outcome.loss_found = true;
            }
        }

        if now_ns >= self.deadline_ns {
            self.deadline_ns = now_ns.saturating_add(self.delay_generator.retry_delay_ns());
            trace!("feedback for gap {:?} is due, next one at {}", gap, self.deadline_ns);
            return (outcome, Some(gap));
        }

        (outcome, None)
    }
}
