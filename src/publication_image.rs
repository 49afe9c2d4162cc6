//! The receive side of one publication: a term log that is rebuilt from out-of-order,
//!  duplicated and lost frames, plus the flow control, loss and lifecycle state around it.
//!
//! An image is touched from three contexts:
//! * the *receive* context inserts frames, handles RTT measurement replies, and sends the control
//!   frames (status messages, NAKs, RTT requests) that the scheduler asked for
//! * the *scheduler* (the conductor's duty cycle) tracks the rebuilt position, decides on status
//!   messages and NAKs, cleans the log, and drives the lifecycle
//! * any number of *consumers* read the log up to the rebuilt position
//!
//! There are no locks between these contexts. The image is split in two records to reflect that:
//!  [ImageHotPath] is shared (`Arc`) and holds only immutable data and atomics, each atomic with a
//!  single writer; [PublicationImage] is owned by the scheduler and holds everything only the
//!  scheduler touches.
//!
//! Values that consist of more than one word (the status message window, the pending loss) are
//!  published through a pair of change numbers: the writer increments `begin`, writes the
//!  fields, then sets `end`. A reader that sees equal change numbers around its reads has a
//!  consistent snapshot.

use std::cmp::{max, min};
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{fence, AtomicBool, AtomicI32, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use anyhow::bail;
use crossbeam_utils::CachePadded;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{debug, error, info, instrument, trace, warn};
use crate::buffers::log_buffers::LogBuffers;
use crate::clock::{nanos, NanoClock};
use crate::config::ReceiverConfig;
use crate::congestion_control::{CongestionControl, RebuildSample};
use crate::counters::{AtomicCounter, CountersManager, SystemCounterId, SystemCounters};
use crate::endpoint::ReceiveChannelEndpoint;
use crate::feedback_delay::{BackoffDelayGenerator, FeedbackDelayGenerator, StaticDelayGenerator};
use crate::frame::{self, FrameType, Nak, RttmHeader, StatusMessage, DATA_HEADER_LENGTH, FRAME_ALIGNMENT};
use crate::loss_detector::{Gap, LossDetector};
use crate::position::{align, check_term_length, compute_position, compute_term_id_from_position, index_by_term, position_bits_to_shift};
use crate::safe_converter::PrecheckedCast;
use crate::subscribeable::{Subscribeable, SubscriberPosition};
use crate::term_rebuilder;

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ImageStatus {
    /// created, waiting for the first subscriber
    Init,
    Active,
    /// no longer receiving: liveness timed out or the stream ended
    Inactive,
    /// waiting for consumers to let go before resources are released
    Linger,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InsertOutcome {
    Accepted,
    Heartbeat,
    /// behind the advertised window, i.e. a stale re-send or duplicate
    UnderRun,
    /// beyond the advertised window
    OverRun,
    /// neither the active term nor the one after it
    WrongTerm,
    Malformed,
    Closed,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RttmOutcome {
    Accepted { rtt_ns: i64 },
    NotAReply,
    WrongStream,
    WrongReceiver,
    /// the echoed timestamp is in the future
    Stale,
}

/// Everything that identifies a new image, as announced by the sender
#[derive(Debug, Clone)]
pub struct ImageParams {
    pub correlation_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub active_term_id: i32,
    pub initial_term_offset: i32,
    pub term_buffer_length: i32,
    pub sender_mtu_length: i32,
    pub is_reliable: bool,
    pub control_address: SocketAddr,
    pub source_address: SocketAddr,
}

/// written by the receive context only
struct ReceiverFields {
    last_packet_timestamp_ns: AtomicI64,
    is_end_of_stream: AtomicBool,
    last_sm_change_number: AtomicI64,
    last_loss_change_number: AtomicI64,
}

/// written by the scheduler only
struct ConductorFields {
    status: AtomicU8,
    clean_position: AtomicI64,

    begin_sm_change: AtomicI64,
    next_sm_position: AtomicI64,
    next_sm_window_length: AtomicI32,
    end_sm_change: AtomicI64,

    begin_loss_change: AtomicI64,
    loss_term_id: AtomicI32,
    loss_term_offset: AtomicI32,
    loss_length: AtomicI32,
    end_loss_change: AtomicI64,
}

/// The part of an image that is shared between the receive context, the scheduler and
///  consumers. See the module documentation.
pub struct ImageHotPath {
    correlation_id: i64,
    session_id: i32,
    stream_id: i32,
    initial_term_id: i32,
    term_length: i32,
    term_length_mask: i32,
    position_bits_to_shift: u32,
    mtu_length: i32,
    is_reliable: bool,
    receiver_id: i64,
    control_address: SocketAddr,
    source_address: SocketAddr,

    log: LogBuffers,
    hwm_position: Arc<AtomicCounter>,
    rebuilt_position: Arc<AtomicCounter>,

    receiver: CachePadded<ReceiverFields>,
    conductor: CachePadded<ConductorFields>,

    heartbeats_received: Arc<AtomicCounter>,
    flow_control_under_runs: Arc<AtomicCounter>,
    flow_control_over_runs: Arc<AtomicCounter>,
    status_messages_sent: Arc<AtomicCounter>,
    nak_messages_sent: Arc<AtomicCounter>,
    rttms_sent: Arc<AtomicCounter>,

    congestion_control: Arc<dyn CongestionControl>,
    clock: Arc<dyn NanoClock>,
}

impl Debug for ImageHotPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Image{{#{}:{}/{}@{:?}}}", self.correlation_id, self.session_id, self.stream_id, self.source_address)
    }
}

impl ImageHotPath {
    pub fn correlation_id(&self) -> i64 {
        self.correlation_id
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn term_length(&self) -> i32 {
        self.term_length
    }

    pub fn is_reliable(&self) -> bool {
        self.is_reliable
    }

    pub fn source_address(&self) -> SocketAddr {
        self.source_address
    }

    pub fn log(&self) -> &LogBuffers {
        &self.log
    }

    pub fn hwm_position(&self) -> i64 {
        self.hwm_position.get()
    }

    pub fn rebuilt_position(&self) -> i64 {
        self.rebuilt_position.get()
    }

    pub fn clean_position(&self) -> i64 {
        self.conductor.clean_position.load(Ordering::Acquire)
    }

    pub fn status(&self) -> ImageStatus {
        ImageStatus::try_from(self.conductor.status.load(Ordering::Acquire))
            .unwrap_or(ImageStatus::Linger)
    }

    pub fn last_packet_timestamp_ns(&self) -> i64 {
        self.receiver.last_packet_timestamp_ns.load(Ordering::Acquire)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.receiver.is_end_of_stream.load(Ordering::Acquire)
    }

    /// the most recently advertised window as `(position, length)`
    pub fn next_status_message_window(&self) -> (i64, i32) {
        let (_, position, window_length) = self.status_message_snapshot();
        (position, window_length)
    }

    fn status_message_snapshot(&self) -> (i64, i64, i32) {
        let c = &self.conductor;
        loop {
            let change_number = c.end_sm_change.load(Ordering::Acquire);
            let position = c.next_sm_position.load(Ordering::Relaxed);
            let window_length = c.next_sm_window_length.load(Ordering::Relaxed);
            fence(Ordering::Acquire);

            if change_number == c.begin_sm_change.load(Ordering::Relaxed) {
                return (change_number, position, window_length);
            }
            std::hint::spin_loop();
        }
    }

    fn loss_snapshot(&self) -> (i64, Gap) {
        let c = &self.conductor;
        loop {
            let change_number = c.end_loss_change.load(Ordering::Acquire);
            let gap = Gap {
                term_id: c.loss_term_id.load(Ordering::Relaxed),
                term_offset: c.loss_term_offset.load(Ordering::Relaxed),
                length: c.loss_length.load(Ordering::Relaxed),
            };
            fence(Ordering::Acquire);

            if change_number == c.begin_loss_change.load(Ordering::Relaxed) {
                return (change_number, gap);
            }
            std::hint::spin_loop();
        }
    }

    fn schedule_status_message(&self, position: i64, window_length: i32) {
        let c = &self.conductor;
        let change_number = c.begin_sm_change.load(Ordering::Relaxed) + 1;

        c.begin_sm_change.store(change_number, Ordering::Relaxed);
        fence(Ordering::Release);
        c.next_sm_position.store(position, Ordering::Relaxed);
        c.next_sm_window_length.store(window_length, Ordering::Relaxed);
        c.end_sm_change.store(change_number, Ordering::Release);
    }

    fn schedule_loss(&self, gap: Gap) {
        let c = &self.conductor;
        let change_number = c.begin_loss_change.load(Ordering::Relaxed) + 1;

        c.begin_loss_change.store(change_number, Ordering::Relaxed);
        fence(Ordering::Release);
        c.loss_term_id.store(gap.term_id, Ordering::Relaxed);
        c.loss_term_offset.store(gap.term_offset, Ordering::Relaxed);
        c.loss_length.store(gap.length, Ordering::Relaxed);
        c.end_loss_change.store(change_number, Ordering::Release);
    }

    fn set_status(&self, status: ImageStatus) {
        self.conductor.status.store(status.into(), Ordering::Release);
    }

    /// Validates a received frame against the log geometry, the active term and the advertised
    ///  window, and writes it into the log if it passes. Anomalies never fail the image: the
    ///  frame is dropped and the outcome (and a counter) says why.
    pub fn insert_packet(&self, term_id: i32, term_offset: i32, buffer: &[u8]) -> InsertOutcome {
        if self.log.is_closed() {
            return InsertOutcome::Closed;
        }

        let Some(frame_span) = self.frame_span(term_offset, buffer) else {
            debug!("{:?}: dropping malformed frame at term {} offset {} ({} bytes)", self, term_id, term_offset, buffer.len());
            return InsertOutcome::Malformed;
        };

        let active_term_id = self.initial_term_id.wrapping_add(self.log.metadata().active_term_count());
        if !matches!(term_id.wrapping_sub(active_term_id), 0 | 1) {
            debug!("{:?}: dropping frame for term {} - active term is {}", self, term_id, active_term_id);
            return InsertOutcome::WrongTerm;
        }

        let is_heartbeat = frame::is_heartbeat(buffer);
        let packet_position = compute_position(term_id, term_offset, self.position_bits_to_shift, self.initial_term_id);
        let proposed_position = packet_position + i64::from(frame_span);

        let (_, window_position, window_length) = self.status_message_snapshot();
        if self.is_flow_control_under_run(window_position, packet_position) {
            return InsertOutcome::UnderRun;
        }
        if self.is_flow_control_over_run(window_position, window_length, proposed_position) {
            return InsertOutcome::OverRun;
        }

        let outcome = if is_heartbeat {
            if frame::is_end_of_stream(buffer) {
                self.on_end_of_stream(packet_position);
            }
            self.heartbeats_received.increment_ordered();
            InsertOutcome::Heartbeat
        }
        else {
            if frame::is_end_of_stream(buffer) {
                self.on_end_of_stream(proposed_position);
            }
            let term_buffer = self.log.term_buffer_for_position(packet_position);
            term_rebuilder::insert(term_buffer, term_offset, buffer);
            InsertOutcome::Accepted
        };

        self.hwm_candidate(proposed_position);
        outcome
    }

    /// The number of bytes a frame occupies in the term, or `None` if it is not a well-formed
    ///  data, padding or heartbeat frame that fits the term at `term_offset`.
    fn frame_span(&self, term_offset: i32, buffer: &[u8]) -> Option<i32> {
        if buffer.len() < DATA_HEADER_LENGTH {
            return None;
        }
        if term_offset < 0 || term_offset % FRAME_ALIGNMENT != 0 || term_offset >= self.term_length {
            return None;
        }

        let frame_length = frame::frame_length_of(buffer);
        let span = match frame::frame_type_of(buffer).and_then(|t| FrameType::try_from(t).ok()) {
            Some(FrameType::Data) if frame::is_heartbeat(buffer) => 0,
            Some(FrameType::Data) => {
                let buffer_length: i32 = buffer.len().min(i32::MAX as usize).prechecked_cast();
                if frame_length != buffer_length || buffer.len() > self.mtu_length as usize {
                    return None;
                }
                align(frame_length, FRAME_ALIGNMENT)
            }
            // padding is sent as a bare header, its frame length covers the skipped space
            Some(FrameType::Padding) if frame_length >= FRAME_ALIGNMENT && frame_length % FRAME_ALIGNMENT == 0 => frame_length,
            _ => return None,
        };

        if i64::from(term_offset) + i64::from(span) > i64::from(self.term_length) {
            return None;
        }
        Some(span)
    }

    fn on_end_of_stream(&self, position: i64) {
        if self.log.metadata().set_end_of_stream_position(position) {
            info!("{:?}: end of stream at position {}", self, position);
        }
        self.receiver.is_end_of_stream.store(true, Ordering::Release);
    }

    /// `true` if the frame starts behind the advertised window; counts the under-run
    pub fn is_flow_control_under_run(&self, window_position: i64, packet_position: i64) -> bool {
        let is_under_run = packet_position < window_position;
        if is_under_run {
            trace!("{:?}: flow control under-run - packet position {} is behind window position {}", self, packet_position, window_position);
            self.flow_control_under_runs.increment_ordered();
        }
        is_under_run
    }

    /// `true` if the frame ends beyond the advertised window; counts the over-run
    pub fn is_flow_control_over_run(&self, window_position: i64, window_length: i32, proposed_position: i64) -> bool {
        let is_over_run = proposed_position > window_position + i64::from(window_length);
        if is_over_run {
            debug!("{:?}: flow control over-run - position {} is beyond window {}+{}", self, proposed_position, window_position, window_length);
            self.flow_control_over_runs.increment_ordered();
        }
        is_over_run
    }

    /// Records activity and raises the high-water mark; the mark never moves backwards
    pub fn hwm_candidate(&self, proposed_position: i64) {
        self.receiver.last_packet_timestamp_ns.store(self.clock.nano_time(), Ordering::Release);
        self.hwm_position.propose_max_ordered(proposed_position);
    }

    pub fn on_rttm(&self, header: &RttmHeader, source: SocketAddr) -> RttmOutcome {
        if !header.is_reply() {
            return RttmOutcome::NotAReply;
        }
        if header.session_id != self.session_id || header.stream_id != self.stream_id {
            return RttmOutcome::WrongStream;
        }
        if header.receiver_id != self.receiver_id {
            trace!("{:?}: RTT measurement reply for receiver {} - ignoring", self, header.receiver_id);
            return RttmOutcome::WrongReceiver;
        }

        let now_ns = self.clock.nano_time();
        let rtt_ns = now_ns - header.echo_timestamp_ns - header.reception_delta_ns;
        if rtt_ns < 0 {
            debug!("{:?}: RTT measurement reply from {} yields negative RTT {}ns - ignoring", self, source, rtt_ns);
            return RttmOutcome::Stale;
        }

        self.congestion_control.on_rttm(now_ns, rtt_ns, source);
        RttmOutcome::Accepted { rtt_ns }
    }

    /// Sends a status message if the scheduler asked for one since the last call. Returns
    ///  `true` if a message was sent.
    pub async fn send_pending_status_message(&self, endpoint: &dyn ReceiveChannelEndpoint) -> bool {
        let (change_number, position, window_length) = self.status_message_snapshot();
        if change_number == self.receiver.last_sm_change_number.load(Ordering::Relaxed) {
            return false;
        }

        let status_message = StatusMessage {
            flags: 0,
            session_id: self.session_id,
            stream_id: self.stream_id,
            consumption_term_id: compute_term_id_from_position(position, self.position_bits_to_shift, self.initial_term_id),
            consumption_term_offset: (position & i64::from(self.term_length_mask)) as i32,
            receiver_window: window_length,
            receiver_id: self.receiver_id,
        };

        trace!("{:?}: sending {:?}", self, status_message);
        match endpoint.send_status_message(self.control_address, &status_message).await {
            Ok(()) => { self.status_messages_sent.increment_ordered(); }
            Err(e) => error!("{:?}: error sending status message: {}", self, e),
        }

        self.receiver.last_sm_change_number.store(change_number, Ordering::Relaxed);
        true
    }

    /// Sends a NAK if the scheduler reported loss since the last call. Returns `true` if a NAK
    ///  was sent.
    pub async fn send_pending_loss(&self, endpoint: &dyn ReceiveChannelEndpoint) -> bool {
        let (change_number, gap) = self.loss_snapshot();
        if change_number == self.receiver.last_loss_change_number.load(Ordering::Relaxed) {
            return false;
        }
        self.receiver.last_loss_change_number.store(change_number, Ordering::Relaxed);

        if !self.is_reliable {
            return false;
        }

        let nak = Nak {
            session_id: self.session_id,
            stream_id: self.stream_id,
            term_id: gap.term_id,
            term_offset: gap.term_offset,
            length: gap.length,
        };

        debug!("{:?}: sending {:?}", self, nak);
        match endpoint.send_nak(self.control_address, &nak).await {
            Ok(()) => { self.nak_messages_sent.increment_ordered(); }
            Err(e) => error!("{:?}: error sending NAK: {}", self, e),
        }
        true
    }

    /// Sends an RTT measurement request if the congestion control asks for one. Returns `true`
    ///  if a request was sent.
    pub async fn initiate_rttm(&self, now_ns: i64, endpoint: &dyn ReceiveChannelEndpoint) -> bool {
        if self.status() != ImageStatus::Active || !self.congestion_control.should_measure_rtt(now_ns) {
            return false;
        }

        let rttm = RttmHeader {
            flags: 0,
            session_id: self.session_id,
            stream_id: self.stream_id,
            echo_timestamp_ns: now_ns,
            reception_delta_ns: 0,
            receiver_id: self.receiver_id,
        };

        match endpoint.send_rttm(self.control_address, &rttm).await {
            Ok(()) => { self.rttms_sent.increment_ordered(); }
            Err(e) => error!("{:?}: error sending RTT measurement: {}", self, e),
        }
        self.congestion_control.on_rttm_sent(now_ns);
        true
    }

    /// Copies rebuilt data starting at `position` into `dst`, stopping at the rebuilt position
    ///  and at the end of the term. Returns the number of bytes copied.
    pub fn read_rebuilt(&self, position: i64, dst: &mut [u8]) -> usize {
        let rebuilt = self.rebuilt_position();
        let term_offset = position & i64::from(self.term_length_mask);
        let available = min(rebuilt - position, i64::from(self.term_length) - term_offset);
        if available <= 0 || position < self.clean_position() {
            return 0;
        }

        let length = min(dst.len() as i64, available) as usize;
        self.log.term_buffer_for_position(position)
            .get_bytes(term_offset.prechecked_cast(), &mut dst[..length]);
        length
    }
}

/// The scheduler's handle to an image. It owns the control state and shares the
///  [ImageHotPath] with the receive context.
pub struct PublicationImage {
    hot: Arc<ImageHotPath>,
    subscribeable: Subscribeable,
    loss_detector: LossDetector,

    time_of_last_state_change_ns: i64,
    last_sm_timestamp_ns: i64,
    last_sm_position: i64,
    last_sm_window_length: i32,

    image_liveness_timeout_ns: i64,
    image_linger_timeout_ns: i64,
    has_reached_end_of_life: bool,

    loss_gap_fills: Arc<AtomicCounter>,
}

impl Debug for PublicationImage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}[{:?}]", self.hot, self.hot.status())
    }
}

impl PublicationImage {
    #[instrument(skip_all, fields(correlation_id = params.correlation_id, session_id = params.session_id, stream_id = params.stream_id))]
    pub fn create(
        params: ImageParams,
        config: &ReceiverConfig,
        hwm_position: Arc<AtomicCounter>,
        rebuilt_position: Arc<AtomicCounter>,
        congestion_control: Arc<dyn CongestionControl>,
        system_counters: &SystemCounters,
        clock: Arc<dyn NanoClock>,
    ) -> anyhow::Result<PublicationImage> {
        let term_length = params.term_buffer_length;
        check_term_length(term_length)?;

        let mtu_length = params.sender_mtu_length;
        if mtu_length < DATA_HEADER_LENGTH as i32 || mtu_length % FRAME_ALIGNMENT != 0 || mtu_length > term_length {
            bail!("MTU {} must be a multiple of {} between {} and the term length {}", mtu_length, FRAME_ALIGNMENT, DATA_HEADER_LENGTH, term_length);
        }
        if params.initial_term_offset < 0 || params.initial_term_offset >= term_length || params.initial_term_offset % FRAME_ALIGNMENT != 0 {
            bail!("initial term offset {} is not an aligned offset in a term of {} bytes", params.initial_term_offset, term_length);
        }

        let max_window_length = congestion_control.max_window_length();
        let initial_window_length = congestion_control.initial_window_length();
        if max_window_length > term_length / 2 || initial_window_length > max_window_length || initial_window_length < FRAME_ALIGNMENT {
            bail!("receive window {} (max {}) is inconsistent with a term length of {}", initial_window_length, max_window_length, term_length);
        }

        let bits = position_bits_to_shift(term_length);
        let join_position = compute_position(params.active_term_id, params.initial_term_offset, bits, params.initial_term_id);
        if join_position < 0 {
            bail!("active term {} is before the initial term {}", params.active_term_id, params.initial_term_id);
        }

        let log = LogBuffers::create(
            config.term_count,
            term_length,
            params.initial_term_id,
            params.active_term_id,
            mtu_length,
            params.correlation_id,
        )?;

        hwm_position.set_ordered(join_position);
        rebuilt_position.set_ordered(join_position);

        let now_ns = clock.nano_time();

        let hot = Arc::new(ImageHotPath {
            correlation_id: params.correlation_id,
            session_id: params.session_id,
            stream_id: params.stream_id,
            initial_term_id: params.initial_term_id,
            term_length,
            term_length_mask: term_length - 1,
            position_bits_to_shift: bits,
            mtu_length,
            is_reliable: params.is_reliable,
            receiver_id: config.receiver_id,
            control_address: params.control_address,
            source_address: params.source_address,
            log,
            hwm_position,
            rebuilt_position,
            receiver: CachePadded::new(ReceiverFields {
                last_packet_timestamp_ns: AtomicI64::new(now_ns),
                is_end_of_stream: AtomicBool::new(false),
                // the initial status message goes out right away
                last_sm_change_number: AtomicI64::new(-1),
                last_loss_change_number: AtomicI64::new(0),
            }),
            conductor: CachePadded::new(ConductorFields {
                status: AtomicU8::new(ImageStatus::Init.into()),
                clean_position: AtomicI64::new(join_position),
                begin_sm_change: AtomicI64::new(0),
                next_sm_position: AtomicI64::new(join_position),
                next_sm_window_length: AtomicI32::new(initial_window_length),
                end_sm_change: AtomicI64::new(0),
                begin_loss_change: AtomicI64::new(0),
                loss_term_id: AtomicI32::new(0),
                loss_term_offset: AtomicI32::new(0),
                loss_length: AtomicI32::new(0),
                end_loss_change: AtomicI64::new(0),
            }),
            heartbeats_received: system_counters.get(SystemCounterId::HeartbeatsReceived),
            flow_control_under_runs: system_counters.get(SystemCounterId::FlowControlUnderRuns),
            flow_control_over_runs: system_counters.get(SystemCounterId::FlowControlOverRuns),
            status_messages_sent: system_counters.get(SystemCounterId::StatusMessagesSent),
            nak_messages_sent: system_counters.get(SystemCounterId::NakMessagesSent),
            rttms_sent: system_counters.get(SystemCounterId::RttmsSent),
            congestion_control,
            clock,
        });

        let delay_generator: Box<dyn FeedbackDelayGenerator> = if params.is_reliable {
            Box::new(BackoffDelayGenerator::new(config.nak_delay, config.nak_max_backoff))
        }
        else {
            Box::new(StaticDelayGenerator::new(config.nak_delay))
        };

        info!("{:?}: created image joining at position {}, window {}", hot, join_position, initial_window_length);

        Ok(PublicationImage {
            hot,
            subscribeable: Subscribeable::default(),
            loss_detector: LossDetector::new(delay_generator),
            time_of_last_state_change_ns: now_ns,
            last_sm_timestamp_ns: now_ns,
            last_sm_position: join_position,
            last_sm_window_length: initial_window_length,
            image_liveness_timeout_ns: nanos(config.image_liveness_timeout),
            image_linger_timeout_ns: nanos(config.image_linger_timeout),
            has_reached_end_of_life: false,
            loss_gap_fills: system_counters.get(SystemCounterId::LossGapFills),
        })
    }

    pub fn hot(&self) -> &Arc<ImageHotPath> {
        &self.hot
    }

    pub fn correlation_id(&self) -> i64 {
        self.hot.correlation_id
    }

    pub fn status(&self) -> ImageStatus {
        self.hot.status()
    }

    pub fn has_reached_end_of_life(&self) -> bool {
        self.has_reached_end_of_life
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribeable.len()
    }

    fn state(&mut self, status: ImageStatus, now_ns: i64) {
        debug!("{:?}: {:?} -> {:?}", self.hot, self.hot.status(), status);
        self.hot.set_status(status);
        self.time_of_last_state_change_ns = now_ns;
    }

    /// INIT -> ACTIVE, once the first subscriber is linked
    pub fn activate(&mut self, now_ns: i64) {
        if self.hot.status() == ImageStatus::Init {
            self.state(ImageStatus::Active, now_ns);
        }
    }

    /// Links a subscriber. It starts consuming at the current rebuilt position.
    pub fn add_subscriber(&mut self, subscriber: SubscriberPosition) {
        subscriber.position.set_ordered(self.hot.rebuilt_position.get_plain());
        self.subscribeable.add(subscriber);
    }

    pub fn remove_subscriber(&mut self, registration_id: i64) -> Option<SubscriberPosition> {
        self.subscribeable.remove(registration_id)
    }

    /// The scheduler's periodic tick:
    /// 1. advance the rebuilt position over contiguous data, and act on the first gap
    /// 2. ask the congestion control for the window, and clean the log behind the consumers
    /// 3. schedule a status message if the timeout expired, the consumers moved, or the window
    ///    changed
    /// 4. drive the lifecycle
    pub fn track_rebuild(&mut self, now_ns: i64, status_message_timeout_ns: i64) {
        let hwm_position = self.hot.hwm_position.get();
        let (rebuild_position, loss_found) = self.rebuild(now_ns, hwm_position);

        let consumption_position = match self.subscribeable.min_position() {
            Some(p) => min(p, rebuild_position),
            None => rebuild_position,
        };

        let cc_outcome = self.hot.congestion_control.on_track_rebuild(&RebuildSample {
            now_ns,
            consumption_position,
            last_status_message_position: self.last_sm_position,
            window_length: self.last_sm_window_length,
            hwm_position,
            loss_occurred: loss_found,
        });

        self.clean_buffer_to(consumption_position - i64::from(self.hot.term_length));

        if matches!(self.hot.status(), ImageStatus::Init | ImageStatus::Active) {
            let window_length = cc_outcome.window_length;
            let threshold = i64::from(window_length / 4);

            if cc_outcome.force_status_message
                || now_ns - self.last_sm_timestamp_ns > status_message_timeout_ns
                || consumption_position > self.last_sm_position + threshold
                || window_length != self.last_sm_window_length
            {
                let sm_position = max(consumption_position, self.last_sm_position);
                trace!("{:?}: scheduling status message at {}, window {}", self.hot, sm_position, window_length);
                self.hot.schedule_status_message(sm_position, window_length);
                self.last_sm_timestamp_ns = now_ns;
                self.last_sm_position = sm_position;
                self.last_sm_window_length = window_length;
            }
        }

        self.check_lifecycle(now_ns, rebuild_position);
    }

    /// scans for gaps up to the high-water mark, crossing into the next term when the current
    ///  one is complete
    fn rebuild(&mut self, now_ns: i64, hwm_position: i64) -> (i64, bool) {
        let hot = self.hot.clone();
        let term_length = i64::from(hot.term_length);

        let mut rebuild_position = hot.rebuilt_position.get_plain();
        let mut loss_found = false;
        let mut feedback = None;

        loop {
            let term_buffer = hot.log.term_buffer_for_position(rebuild_position);
            let (outcome, due) = self.loss_detector.scan(
                term_buffer,
                rebuild_position,
                hwm_position,
                now_ns,
                hot.term_length_mask,
                hot.position_bits_to_shift,
                hot.initial_term_id,
            );
            if outcome.gap_filled {
                trace!("{:?}: gap filled", hot);
            }
            loss_found |= outcome.loss_found;
            feedback = due.or(feedback);

            let term_begin = rebuild_position - (rebuild_position & i64::from(hot.term_length_mask));
            rebuild_position = max(rebuild_position, term_begin + i64::from(outcome.rebuild_offset));

            if i64::from(outcome.rebuild_offset) < term_length || rebuild_position >= hwm_position {
                break;
            }
        }

        if rebuild_position > hot.rebuilt_position.get_plain() {
            hot.rebuilt_position.set_ordered(rebuild_position);
            let active_term_id = compute_term_id_from_position(rebuild_position, hot.position_bits_to_shift, hot.initial_term_id);
            hot.log.metadata().set_active_term_count(active_term_id.wrapping_sub(hot.initial_term_id));
        }

        if let Some(gap) = feedback {
            if hot.is_reliable {
                hot.schedule_loss(gap);
            }
            else {
                let idx = index_by_term(hot.initial_term_id, gap.term_id, hot.log.term_count());
                if term_rebuilder::fill_gap_with_padding(hot.log.term_buffer(idx), gap.term_offset, gap.length) {
                    debug!("{:?}: filled gap {:?} with padding", hot, gap);
                    self.loss_gap_fills.increment_ordered();
                }
            }
        }

        (rebuild_position, loss_found)
    }

    /// zero fills the log up to `target`, never reaching into the term behind the consumers
    fn clean_buffer_to(&self, target: i64) {
        let clean_position = self.hot.clean_position();
        if target <= clean_position {
            return;
        }

        let from = max(clean_position, target - self.hot.log.capacity());
        trace!("{:?}: cleaning {}..{}", self.hot, from, target);
        self.hot.log.clean(from, target);
        self.hot.conductor.clean_position.store(target, Ordering::Release);
    }

    fn check_lifecycle(&mut self, now_ns: i64, rebuild_position: i64) {
        match self.hot.status() {
            ImageStatus::Init | ImageStatus::Active => {
                let is_end_of_stream_rebuilt = self.hot.is_end_of_stream()
                    && rebuild_position >= self.hot.log.metadata().end_of_stream_position();

                if now_ns > self.hot.last_packet_timestamp_ns() + self.image_liveness_timeout_ns {
                    info!("{:?}: no data or heartbeat within the liveness timeout", self.hot);
                    self.state(ImageStatus::Inactive, now_ns);
                }
                else if is_end_of_stream_rebuilt {
                    info!("{:?}: end of stream rebuilt", self.hot);
                    self.state(ImageStatus::Inactive, now_ns);
                }
            }
            ImageStatus::Inactive => {
                if self.subscribeable.is_drained(rebuild_position) || now_ns > self.time_of_last_state_change_ns + self.image_liveness_timeout_ns {
                    self.state(ImageStatus::Linger, now_ns);
                }
            }
            ImageStatus::Linger => {
                if !self.has_reached_end_of_life && now_ns > self.time_of_last_state_change_ns + self.image_linger_timeout_ns {
                    debug!("{:?}: reached end of life", self.hot);
                    self.has_reached_end_of_life = true;
                }
            }
        }
    }

    /// Releases the log and frees the image's position counters. Taking `self` by value makes
    ///  a second close impossible.
    #[instrument(skip_all, fields(correlation_id = self.hot.correlation_id))]
    pub fn close(self, counters_manager: &CountersManager) {
        if !self.has_reached_end_of_life {
            warn!("{:?}: closing before end of life", self.hot);
        }

        self.hot.log.close();
        counters_manager.free(self.hot.hwm_position.id());
        counters_manager.free(self.hot.rebuilt_position.id());
        for subscriber in self.subscribeable.positions() {
            counters_manager.free(subscriber.position.id());
        }
        info!("{:?}: closed", self.hot);
    }
}
