//! Receive side of a reliable-UDP publication: rebuilds a sender's stream of frames into a
//!  term log for local subscribers, in the presence of reordering, duplication and loss.
//!
//! The moving parts:
//! * [publication_image] - per-publication state: the term log, positions, flow control, loss
//!   tracking and lifecycle
//! * [data_packet_dispatcher] - the receive loop that routes frames to images and sends their
//!   control frames
//! * [image_conductor] - the duty cycle that owns the images and drives rebuild tracking
//!
//! Everything in between (counters, congestion control, frame codecs, the log buffers) is
//!  public so that drivers can be assembled from the pieces.

pub mod buffers;
pub mod clock;
pub mod config;
pub mod congestion_control;
pub mod counters;
pub mod data_packet_dispatcher;
pub mod endpoint;
pub mod feedback_delay;
pub mod frame;
pub mod image_conductor;
pub mod loss_detector;
pub mod position;
pub mod publication_image;
pub mod safe_converter;
pub mod subscribeable;
pub mod term_gap_scanner;
pub mod term_rebuilder;
pub mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
