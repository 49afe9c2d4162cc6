//! The image's term log: `term_count` term buffers of a power-of-two length, used round robin,
//!  and a small metadata region.

pub mod log_buffers;
pub mod term_buffer;
