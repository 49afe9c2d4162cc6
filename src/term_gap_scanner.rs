use crate::buffers::term_buffer::TermBuffer;
use crate::frame::FRAME_ALIGNMENT;
use crate::position::align;

/// Walks the published frames of a term from `rebuild_offset`, stopping at the first slot that
///  holds no frame yet, and returns that offset: everything below it is contiguous.
///
/// A frame that extends beyond `limit_offset` ends the scan without being counted. If the scan
///  stops at an empty slot below `limit_offset`, there is a gap. Its length is measured up to the next
///  published frame (or the limit), and it is reported to `on_gap` as
///  `(term_id, gap_offset, gap_length)`.
pub fn scan_for_gap(
    term_buffer: &TermBuffer,
    term_id: i32,
    rebuild_offset: i32,
    limit_offset: i32,
    mut on_gap: impl FnMut(i32, i32, i32),
) -> i32 {
    let mut offset = rebuild_offset;
    while offset < limit_offset {
        let frame_length = term_buffer.frame_length_volatile(offset);
        if frame_length <= 0 {
            break;
        }
        let next_offset = offset + align(frame_length, FRAME_ALIGNMENT);
        if next_offset > limit_offset {
            // written, but the high-water mark does not cover it yet
            return offset;
        }
        offset = next_offset;
    }

    let gap_begin = offset;
    if gap_begin < limit_offset {
        let mut gap_end = gap_begin + FRAME_ALIGNMENT;
        while gap_end < limit_offset && term_buffer.frame_length_volatile(gap_end) == 0 {
            gap_end += FRAME_ALIGNMENT;
        }
        on_gap(term_id, gap_begin, gap_end.min(limit_offset) - gap_begin);
    }

    gap_begin
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn term_with_frames(frames: &[(i32, i32)]) -> TermBuffer {
        let term = TermBuffer::new(65536).unwrap();
        for &(offset, length) in frames {
            let mut frame = vec![1u8; length as usize];
            frame[..4].copy_from_slice(&length.to_le_bytes());
            assert!(term.put_frame(offset, &frame));
        }
        term
    }

    #[rstest]
    #[case::empty(vec![], 0, 0, 0, None)]
    #[case::contiguous(vec![(0, 64), (64, 32)], 0, 96, 96, None)]
    #[case::unaligned_length(vec![(0, 40), (64, 32)], 0, 96, 96, None)]
    #[case::gap_in_middle(vec![(0, 64), (128, 64)], 0, 192, 64, Some((64, 64)))]
    #[case::gap_at_start(vec![(96, 32)], 0, 128, 0, Some((0, 96)))]
    #[case::gap_up_to_limit(vec![(0, 32)], 0, 256, 32, Some((32, 224)))]
    #[case::from_rebuild_offset(vec![(0, 32), (32, 32), (128, 32)], 32, 160, 64, Some((64, 64)))]
    #[case::first_gap_only(vec![(0, 32), (64, 32), (128, 32)], 0, 160, 32, Some((32, 32)))]
    #[case::end_of_term(vec![(65536 - 64, 64)], 65536 - 64, 65536, 65536, None)]
    #[case::frame_beyond_limit(vec![(0, 32), (32, 64)], 0, 64, 32, None)]
    fn test_scan_for_gap(
        #[case] frames: Vec<(i32, i32)>,
        #[case] rebuild_offset: i32,
        #[case] limit_offset: i32,
        #[case] expected_offset: i32,
        #[case] expected_gap: Option<(i32, i32)>,
    ) {
        let term = term_with_frames(&frames);

        let mut gap = None;
        let result = scan_for_gap(&term, 7, rebuild_offset, limit_offset, |term_id, offset, length| {
            assert_eq!(term_id, 7);
            assert!(gap.is_none());
            gap = Some((offset, length));
        });

        assert_eq!(result, expected_offset);
        assert_eq!(gap, expected_gap);
    }
}
