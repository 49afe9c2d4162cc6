//! Translation between a stream position and its coordinates in the term log.
//!
//! A stream position is a monotonic byte offset into the (conceptually infinite) stream. The
//!  log divides the stream into terms of a fixed, power-of-two length; term ids start at an
//!  arbitrary `initial_term_id` and increase by one per term, wrapping around at `i32::MAX`.
//!  All functions here are pure and exact inverses of each other.

use anyhow::bail;

pub const TERM_MIN_LENGTH: i32 = 64 * 1024;
pub const TERM_MAX_LENGTH: i32 = 1024 * 1024 * 1024;

pub fn check_term_length(term_length: i32) -> anyhow::Result<()> {
    if term_length < TERM_MIN_LENGTH {
        bail!("term length {} is less than the minimum of {}", term_length, TERM_MIN_LENGTH);
    }
    if term_length > TERM_MAX_LENGTH {
        bail!("term length {} is greater than the maximum of {}", term_length, TERM_MAX_LENGTH);
    }
    if (term_length & (term_length - 1)) != 0 {
        bail!("term length {} is not a power of two", term_length);
    }
    Ok(())
}

pub fn position_bits_to_shift(term_length: i32) -> u32 {
    term_length.trailing_zeros()
}

/// the number of terms between the initial term and the given term
pub fn compute_term_count(term_id: i32, initial_term_id: i32) -> i64 {
    i64::from(term_id.wrapping_sub(initial_term_id))
}

pub fn compute_position(term_id: i32, term_offset: i32, position_bits_to_shift: u32, initial_term_id: i32) -> i64 {
    let term_count = compute_term_count(term_id, initial_term_id);
    (term_count << position_bits_to_shift) + i64::from(term_offset)
}

pub fn compute_term_id_from_position(position: i64, position_bits_to_shift: u32, initial_term_id: i32) -> i32 {
    ((position >> position_bits_to_shift) as i32).wrapping_add(initial_term_id)
}

pub fn compute_term_offset_from_position(position: i64, position_bits_to_shift: u32) -> i32 {
    let mask = (1i64 << position_bits_to_shift) - 1;
    (position & mask) as i32
}

/// index of the term buffer that holds the given term
pub fn index_by_term(initial_term_id: i32, term_id: i32, term_count: usize) -> usize {
    compute_term_count(term_id, initial_term_id).rem_euclid(term_count as i64) as usize
}

/// index of the term buffer that holds the given position
pub fn index_by_position(position: i64, position_bits_to_shift: u32, term_count: usize) -> usize {
    ((position >> position_bits_to_shift) as u64 % term_count as u64) as usize
}

/// round `value` up to the next multiple of `alignment`, which must be a power of two
pub fn align(value: i32, alignment: i32) -> i32 {
    (value + (alignment - 1)) & !(alignment - 1)
}
