use tracing::trace;
use crate::buffers::term_buffer::TermBuffer;
use crate::frame::{FrameHeader, FrameType, CURRENT_VERSION, FRAME_ALIGNMENT, FRAME_HEADER_LENGTH};

/// Writes a received frame into its slot in the term. A slot whose first word is set already
///  is left alone, so a duplicate framed like the original never rewrites data a consumer may
///  be reading. A re-send framed differently can start inside an existing frame; it is refused
///  only if the word it starts at is non-zero.
///
/// Returns `true` if the frame was written by this call.
pub fn insert(term_buffer: &TermBuffer, term_offset: i32, frame: &[u8]) -> bool {
    if term_buffer.frame_length_volatile(term_offset) != 0 {
        trace!("frame at term offset {} is present already - skipping duplicate", term_offset);
        return false;
    }
    term_buffer.put_frame(term_offset, frame)
}

/// Fills a gap with a padding frame, treating the missing data as lost. Used for unreliable
///  streams, where gaps are skipped rather than repaired.
pub fn fill_gap_with_padding(term_buffer: &TermBuffer, term_offset: i32, length: i32) -> bool {
    debug_assert!(length >= FRAME_ALIGNMENT && length % FRAME_ALIGNMENT == 0);

    // Only the first header word is written: frame length, version, flags and type. It is
    //  published with a CAS against zero, so if the real frame arrives concurrently exactly one
    //  of the two wins, and the data frame's other words are never touched.
    let mut header = Vec::with_capacity(FRAME_HEADER_LENGTH);
    FrameHeader {
        frame_length: length,
        version: CURRENT_VERSION,
        flags: 0,
        frame_type: FrameType::Padding.into(),
    }.ser(&mut header);

    term_buffer.put_frame(term_offset, &header)
}
