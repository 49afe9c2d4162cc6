use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use anyhow::bail;
use tracing::{debug, error};
use crate::buffers::term_buffer::TermBuffer;
use crate::position::{check_term_length, compute_term_offset_from_position, index_by_position, position_bits_to_shift};
use crate::safe_converter::PrecheckedCast;

/// The log's metadata region: immutable geometry plus the few fields that are published for
///  consumers of the log.
pub struct LogMetadata {
    pub initial_term_id: i32,
    pub term_length: i32,
    pub mtu_length: i32,
    pub correlation_id: i64,
    /// number of completed term rotations, i.e. `active term id - initial term id`
    active_term_count: AtomicI32,
    /// `i64::MAX` until the sender signals the end of the stream
    end_of_stream_position: AtomicI64,
}

impl LogMetadata {
    pub fn active_term_count(&self) -> i32 {
        self.active_term_count.load(Ordering::Acquire)
    }

    /// written by rebuild tracking only
    pub fn set_active_term_count(&self, term_count: i32) {
        self.active_term_count.store(term_count, Ordering::Release);
    }

    pub fn end_of_stream_position(&self) -> i64 {
        self.end_of_stream_position.load(Ordering::Acquire)
    }

    /// The first end-of-stream signal wins; repeated signals (e.g. from heartbeats) leave the
    ///  recorded position unchanged.
    pub fn set_end_of_stream_position(&self, position: i64) -> bool {
        self.end_of_stream_position
            .compare_exchange(i64::MAX, position, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

/// A fixed number of equally sized term buffers, used round robin as the stream advances,
///  plus the metadata region.
pub struct LogBuffers {
    terms: Vec<TermBuffer>,
    metadata: LogMetadata,
    position_bits_to_shift: u32,
    is_closed: AtomicBool,
}

impl LogBuffers {
    pub fn create(
        term_count: usize,
        term_length: i32,
        initial_term_id: i32,
        active_term_id: i32,
        mtu_length: i32,
        correlation_id: i64,
    ) -> anyhow::Result<LogBuffers> {
        check_term_length(term_length)?;
        if term_count < 2 {
            bail!("a log needs at least two terms, requested {}", term_count);
        }
        let term_length_usize: usize = term_length.prechecked_cast();
        if term_length_usize.checked_mul(term_count).filter(|&total| total <= isize::MAX as usize).is_none() {
            bail!("log of {} terms of {} bytes exceeds the addressable size", term_count, term_length);
        }

        let terms = (0..term_count)
            .map(|_| TermBuffer::new(term_length_usize))
            .collect::<anyhow::Result<Vec<_>>>()?;

        debug!("created log #{}: {} terms of {} bytes, initial term id {}", correlation_id, term_count, term_length, initial_term_id);

        Ok(LogBuffers {
            terms,
            metadata: LogMetadata {
                initial_term_id,
                term_length,
                mtu_length,
                correlation_id,
                active_term_count: AtomicI32::new(active_term_id.wrapping_sub(initial_term_id)),
                end_of_stream_position: AtomicI64::new(i64::MAX),
            },
            position_bits_to_shift: position_bits_to_shift(term_length),
            is_closed: AtomicBool::new(false),
        })
    }

    pub fn metadata(&self) -> &LogMetadata {
        &self.metadata
    }

    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    pub fn term_length(&self) -> i32 {
        self.metadata.term_length
    }

    pub fn capacity(&self) -> i64 {
        i64::from(self.metadata.term_length) * self.terms.len() as i64
    }

    pub fn term_buffer(&self, index: usize) -> &TermBuffer {
        &self.terms[index]
    }

    pub fn term_buffer_for_position(&self, position: i64) -> &TermBuffer {
        &self.terms[index_by_position(position, self.position_bits_to_shift, self.terms.len())]
    }

    /// Zero fills `[from_position, upto_position)`, which may span several terms but must not
    ///  exceed the log's capacity. Both positions must be 8 byte aligned.
    pub fn clean(&self, from_position: i64, upto_position: i64) {
        debug_assert!(upto_position - from_position <= self.capacity());

        let term_length = i64::from(self.metadata.term_length);
        let mut position = from_position;
        while position < upto_position {
            let term_offset = compute_term_offset_from_position(position, self.position_bits_to_shift);
            let length = (term_length - i64::from(term_offset)).min(upto_position - position);

            self.term_buffer_for_position(position)
                .set_memory_zero(term_offset.prechecked_cast(), length.prechecked_cast());
            position += length;
        }
    }

    /// Marks the log as released. Storage itself is returned when the last reference is gone,
    ///  so a reader that is still around never sees freed memory. Closing twice is a bug that
    ///  is reported and otherwise ignored.
    pub fn close(&self) -> bool {
        if self.is_closed.swap(true, Ordering::AcqRel) {
            error!("log #{} was closed more than once - this is a bug", self.metadata.correlation_id);
            return false;
        }
        debug!("closed log #{}", self.metadata.correlation_id);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn frame(length: i32) -> Vec<u8> {
        let mut result = vec![1; length as usize];
        result[..4].copy_from_slice(&length.to_le_bytes());
        result
    }

    #[rstest]
    #[case::ok(3, 65536, true)]
    #[case::two_terms(2, 65536, true)]
    #[case::one_term(1, 65536, false)]
    #[case::not_power_of_two(3, 65536 + 32, false)]
    #[case::too_small(3, 1024, false)]
    fn test_create(#[case] term_count: usize, #[case] term_length: i32, #[case] expected_ok: bool) {
        assert_eq!(LogBuffers::create(term_count, term_length, 5, 5, 1408, 1).is_ok(), expected_ok);
    }

    #[test]
    fn test_active_term_count() {
        let log = LogBuffers::create(3, 65536, 10, 12, 1408, 1).unwrap();
        assert_eq!(log.metadata().active_term_count(), 2);
        log.metadata().set_active_term_count(5);
        assert_eq!(log.metadata().active_term_count(), 5);
    }

    #[test]
    fn test_end_of_stream_position() {
        let log = LogBuffers::create(3, 65536, 0, 0, 1408, 1).unwrap();
        assert_eq!(log.metadata().end_of_stream_position(), i64::MAX);
        assert!(log.metadata().set_end_of_stream_position(1024));
        assert!(!log.metadata().set_end_of_stream_position(2048));
        assert_eq!(log.metadata().end_of_stream_position(), 1024);
    }

    #[test]
    fn test_term_buffer_for_position() {
        let log = LogBuffers::create(3, 65536, 0, 0, 1408, 1).unwrap();
        assert!(std::ptr::eq(log.term_buffer_for_position(65536 * 4 + 10), log.term_buffer(1)));
    }

    #[test]
    fn test_clean_across_terms() {
        let log = LogBuffers::create(3, 65536, 0, 0, 1408, 1).unwrap();
        assert!(log.term_buffer(0).put_frame(65536 - 64, &frame(64)));
        assert!(log.term_buffer(1).put_frame(0, &frame(64)));
        assert!(log.term_buffer(1).put_frame(64, &frame(64)));

        log.clean(65536 - 64, 65536 + 64);

        assert_eq!(log.term_buffer(0).frame_length_volatile(65536 - 64), 0);
        assert_eq!(log.term_buffer(1).frame_length_volatile(0), 0);
        assert_eq!(log.term_buffer(1).frame_length_volatile(64), 64);
    }

    #[test]
    fn test_double_close() {
        let log = LogBuffers::create(3, 65536, 0, 0, 1408, 1).unwrap();
        assert!(!log.is_closed());
        assert!(log.close());
        assert!(log.is_closed());
        assert!(!log.close());
        assert!(log.is_closed());
    }
}
