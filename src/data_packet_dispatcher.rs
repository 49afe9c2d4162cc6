//! The receive context: it owns the socket, splits datagrams into frames, routes each frame to
//!  its image by `(session_id, stream_id)`, and sends the control frames the images have pending.
//!
//! The set of images is owned by this context and changed through [ReceiverCommand]s from the
//!  conductor, so the hot path needs no locking to find an image.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, error, info, trace};
use crate::clock::NanoClock;
use crate::counters::{AtomicCounter, SystemCounterId, SystemCounters};
use crate::endpoint::ReceiveChannelEndpoint;
use crate::frame::{DataHeader, FrameHeader, FrameType, RttmHeader, CURRENT_VERSION, DATA_HEADER_LENGTH, FRAME_ALIGNMENT, FRAME_HEADER_LENGTH};
use crate::position::align;
use crate::publication_image::{ImageHotPath, InsertOutcome, RttmOutcome};
use crate::safe_converter::PrecheckedCast;

/// large enough for any UDP payload
pub const MAX_DATAGRAM_LENGTH: usize = 64 * 1024;

#[derive(Debug)]
pub enum ReceiverCommand {
    AddImage(Arc<ImageHotPath>),
    RemoveImage {
        session_id: i32,
        stream_id: i32,
        correlation_id: i64,
    },
}

pub struct DataPacketDispatcher {
    images: FxHashMap<(i32, i32), Arc<ImageHotPath>>,
    invalid_packets: Arc<AtomicCounter>,
}

impl DataPacketDispatcher {
    pub fn new(system_counters: &SystemCounters) -> DataPacketDispatcher {
        DataPacketDispatcher {
            images: FxHashMap::default(),
            invalid_packets: system_counters.get(SystemCounterId::InvalidPackets),
        }
    }

    pub fn on_command(&mut self, command: ReceiverCommand) {
        match command {
            ReceiverCommand::AddImage(image) => {
                debug!("dispatching to {:?}", image);
                if let Some(previous) = self.images.insert((image.session_id(), image.stream_id()), image) {
                    debug!("{:?} was replaced", previous);
                }
            }
            ReceiverCommand::RemoveImage { session_id, stream_id, correlation_id } => {
                // an image that replaced this one under the same key stays
                if self.images.get(&(session_id, stream_id)).map(|image| image.correlation_id()) == Some(correlation_id) {
                    debug!("no longer dispatching to image #{} ({}/{})", correlation_id, session_id, stream_id);
                    self.images.remove(&(session_id, stream_id));
                }
            }
        }
    }

    pub fn image(&self, session_id: i32, stream_id: i32) -> Option<&Arc<ImageHotPath>> {
        self.images.get(&(session_id, stream_id))
    }

    pub fn num_images(&self) -> usize {
        self.images.len()
    }

    /// Splits a datagram into its frames and dispatches them. Frames are aligned to
    ///  [FRAME_ALIGNMENT] inside the datagram; heartbeats and padding frames occupy just their
    ///  header. A frame that does not fit the datagram ends processing of the datagram.
    ///
    /// Returns the number of frames that were dispatched.
    pub fn on_datagram(&self, datagram: &[u8], source: SocketAddr) -> usize {
        let mut remaining = datagram;
        let mut num_frames = 0;

        while !remaining.is_empty() {
            let header = match FrameHeader::deser(&mut &remaining[..]) {
                Ok(header) => header,
                Err(e) => {
                    debug!("truncated frame header from {}: {}", source, e);
                    self.invalid_packets.increment_ordered();
                    break;
                }
            };
            if header.version != CURRENT_VERSION {
                debug!("frame of unsupported version {} from {} - dropping datagram", header.version, source);
                self.invalid_packets.increment_ordered();
                break;
            }

            let wire_length = match header.known_type() {
                Some(FrameType::Data) if header.frame_length == 0 => DATA_HEADER_LENGTH,
                Some(FrameType::Padding) => DATA_HEADER_LENGTH,
                _ => match usize::try_from(header.frame_length) {
                    Ok(length) if length >= FRAME_HEADER_LENGTH => length,
                    _ => {
                        debug!("frame length {} from {} - dropping datagram", header.frame_length, source);
                        self.invalid_packets.increment_ordered();
                        break;
                    }
                }
            };
            if wire_length > remaining.len() {
                debug!("frame of {} bytes exceeds the remaining {} bytes of the datagram from {}", wire_length, remaining.len(), source);
                self.invalid_packets.increment_ordered();
                break;
            }

            let frame = &remaining[..wire_length];
            match header.known_type() {
                Some(FrameType::Data | FrameType::Padding) => {
                    self.on_data_frame(frame);
                }
                Some(FrameType::Rttm) => {
                    self.on_rttm_frame(frame, source);
                }
                Some(frame_type) => {
                    trace!("ignoring {:?} frame from {}", frame_type, source);
                }
                None => {
                    debug!("unknown frame type {} from {}", header.frame_type, source);
                    self.invalid_packets.increment_ordered();
                }
            }
            num_frames += 1;

            let aligned_length: usize = align(wire_length.prechecked_cast(), FRAME_ALIGNMENT).prechecked_cast();
            remaining = &remaining[aligned_length.min(remaining.len())..];
        }

        num_frames
    }

    /// Inserts a data, padding or heartbeat frame into its image. Returns `None` if the frame
    ///  could not be parsed, or if there is no image for it.
    pub fn on_data_frame(&self, frame: &[u8]) -> Option<InsertOutcome> {
        let header = match DataHeader::deser(&mut &frame[..]) {
            Ok(header) => header,
            Err(e) => {
                debug!("invalid data header: {}", e);
                self.invalid_packets.increment_ordered();
                return None;
            }
        };

        let Some(image) = self.images.get(&(header.session_id, header.stream_id)) else {
            trace!("no image for {:?} - ignoring", header);
            return None;
        };

        let outcome = image.insert_packet(header.term_id, header.term_offset, frame);
        if outcome == InsertOutcome::Malformed {
            self.invalid_packets.increment_ordered();
        }
        Some(outcome)
    }

    pub fn on_rttm_frame(&self, frame: &[u8], source: SocketAddr) -> Option<RttmOutcome> {
        let header = match RttmHeader::deser(&mut &frame[..]) {
            Ok(header) => header,
            Err(e) => {
                debug!("invalid RTT measurement frame from {}: {}", source, e);
                self.invalid_packets.increment_ordered();
                return None;
            }
        };

        let image = self.images.get(&(header.session_id, header.stream_id))?;
        let outcome = image.on_rttm(&header, source);
        trace!("{:?}: RTT measurement {:?}", image, outcome);
        Some(outcome)
    }

    /// Sends whatever control frames the images have pending: status messages, NAKs and RTT
    ///  measurement requests
    pub async fn send_pending_control(&self, endpoint: &dyn ReceiveChannelEndpoint, now_ns: i64) {
        for image in self.images.values() {
            image.send_pending_status_message(endpoint).await;
            image.send_pending_loss(endpoint).await;
            image.initiate_rttm(now_ns, endpoint).await;
        }
    }
}

/// The receive loop: reads datagrams from `socket` until `shutdown` fires or the conductor's
///  side of the command channel is dropped.
pub async fn run_receiver(
    socket: Arc<UdpSocket>,
    mut dispatcher: DataPacketDispatcher,
    endpoint: Arc<dyn ReceiveChannelEndpoint>,
    mut commands: mpsc::UnboundedReceiver<ReceiverCommand>,
    clock: Arc<dyn NanoClock>,
    control_interval: Duration,
    mut shutdown: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let mut receive_buffer = vec![0u8; MAX_DATAGRAM_LENGTH];
    let mut control_ticks = time::interval(control_interval);
    control_ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    info!("starting receive loop on {:?}", socket.local_addr()?);

    loop {
        select! {
            recv_result = socket.recv_from(&mut receive_buffer) => {
                match recv_result {
                    Ok((len, source)) => {
                        dispatcher.on_datagram(&receive_buffer[..len], source);
                        // control frames go out as soon as possible, e.g. the first status message
                        dispatcher.send_pending_control(endpoint.as_ref(), clock.nano_time()).await;
                    }
                    Err(e) => {
                        error!("error receiving UDP packet: {}", e);
                    }
                }
            }
            command = commands.recv() => {
                match command {
                    Some(command) => dispatcher.on_command(command),
                    None => {
                        debug!("command channel closed");
                        break;
                    }
                }
            }
            _ = control_ticks.tick() => {
                dispatcher.send_pending_control(endpoint.as_ref(), clock.nano_time()).await;
            }
            _ = &mut shutdown => {
                break;
            }
        }
    }

    info!("receive loop terminated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use tokio::runtime::Builder;
    use crate::clock::SystemNanoClock;
    use crate::config::ReceiverConfig;
    use crate::congestion_control;
    use crate::counters::{CountersManager, RECEIVER_HWM_TYPE_ID, RECEIVER_POS_TYPE_ID};
    use crate::endpoint::UdpReceiveChannelEndpoint;
    use crate::frame::{DataFlags, StatusMessage, RTTM_REPLY_FLAG};
    use crate::publication_image::{ImageParams, PublicationImage};
    use crate::test_util::{data_frame, heartbeat_frame, padding_frame};
    use super::*;

    struct Fixture {
        counters_manager: CountersManager,
        system_counters: SystemCounters,
        dispatcher: DataPacketDispatcher,
    }

    impl Fixture {
        fn new() -> Fixture {
            let counters_manager = CountersManager::new(100);
            let system_counters = SystemCounters::new(&counters_manager).unwrap();
            let dispatcher = DataPacketDispatcher::new(&system_counters);
            Fixture { counters_manager, system_counters, dispatcher }
        }

        fn image(&self, correlation_id: i64, session_id: i32, control_address: SocketAddr) -> PublicationImage {
            let config = ReceiverConfig::default_config();
            PublicationImage::create(
                ImageParams {
                    correlation_id,
                    session_id,
                    stream_id: 2,
                    initial_term_id: 0,
                    active_term_id: 0,
                    initial_term_offset: 0,
                    term_buffer_length: 65536,
                    sender_mtu_length: 1408,
                    is_reliable: true,
                    control_address,
                    source_address: control_address,
                },
                &config,
                self.counters_manager.allocate(RECEIVER_HWM_TYPE_ID, "hwm").unwrap(),
                self.counters_manager.allocate(RECEIVER_POS_TYPE_ID, "rebuilt").unwrap(),
                congestion_control::create(&config, 65536, 1408),
                &self.system_counters,
                Arc::new(SystemNanoClock::new()),
            ).unwrap()
        }

        fn add_image(&mut self, correlation_id: i64, session_id: i32) -> Arc<ImageHotPath> {
            let image = self.image(correlation_id, session_id, source());
            let hot = image.hot().clone();
            self.dispatcher.on_command(ReceiverCommand::AddImage(hot.clone()));
            hot
        }

        fn invalid_packets(&self) -> i64 {
            self.system_counters.value(SystemCounterId::InvalidPackets)
        }
    }

    fn source() -> SocketAddr {
        "127.0.0.1:9001".parse().unwrap()
    }

    fn batch(frames: &[Vec<u8>]) -> Vec<u8> {
        let mut datagram = Vec::new();
        for frame in frames {
            datagram.extend_from_slice(frame);
            datagram.resize(align(datagram.len() as i32, FRAME_ALIGNMENT) as usize, 0);
        }
        datagram
    }

    #[test]
    fn test_single_frame() {
        let mut f = Fixture::new();
        let image = f.add_image(1, 1);

        let frame = data_frame(1, 2, 0, 0, 100, DataFlags::UNFRAGMENTED);
        assert_eq!(f.dispatcher.on_datagram(&frame, source()), 1);
        assert_eq!(image.hwm_position(), 128);
        assert_eq!(f.invalid_packets(), 0);
    }

    #[test]
    fn test_batched_frames() {
        let mut f = Fixture::new();
        let image = f.add_image(1, 1);

        let datagram = batch(&[
            data_frame(1, 2, 0, 0, 100, DataFlags::BEGIN),
            data_frame(1, 2, 0, 128, 64, DataFlags::END),
            heartbeat_frame(1, 2, 0, 192, DataFlags::empty()),
        ]);
        assert_eq!(f.dispatcher.on_datagram(&datagram, source()), 3);
        assert_eq!(image.hwm_position(), 192);
        assert_eq!(image.log().term_buffer(0).frame_length_volatile(128), 64);
        assert_eq!(f.invalid_packets(), 0);
    }

    #[test]
    fn test_padding_ends_datagram() {
        let mut f = Fixture::new();
        let image = f.add_image(1, 1);

        let datagram = batch(&[
            data_frame(1, 2, 0, 0, 64, DataFlags::UNFRAGMENTED),
            padding_frame(1, 2, 0, 64, 1024),
        ]);
        assert_eq!(f.dispatcher.on_datagram(&datagram, source()), 2);
        assert_eq!(image.hwm_position(), 64 + 1024);
    }

    #[test]
    fn test_routing_by_session() {
        let mut f = Fixture::new();
        let image_1 = f.add_image(1, 1);
        let image_2 = f.add_image(2, 5);

        f.dispatcher.on_datagram(&data_frame(5, 2, 0, 0, 64, DataFlags::UNFRAGMENTED), source());
        assert_eq!(image_1.hwm_position(), 0);
        assert_eq!(image_2.hwm_position(), 64);

        // no image, no error
        assert_eq!(f.dispatcher.on_data_frame(&data_frame(9, 2, 0, 0, 64, DataFlags::UNFRAGMENTED)), None);
        assert_eq!(f.invalid_packets(), 0);
    }

    #[test]
    fn test_remove_image() {
        let mut f = Fixture::new();
        f.add_image(1, 1);
        assert_eq!(f.dispatcher.num_images(), 1);

        // a stale removal for an image that was replaced in the meantime
        f.dispatcher.on_command(ReceiverCommand::RemoveImage { session_id: 1, stream_id: 2, correlation_id: 99 });
        assert_eq!(f.dispatcher.num_images(), 1);

        f.dispatcher.on_command(ReceiverCommand::RemoveImage { session_id: 1, stream_id: 2, correlation_id: 1 });
        assert_eq!(f.dispatcher.num_images(), 0);
        assert!(f.dispatcher.image(1, 2).is_none());
    }

    #[test]
    fn test_invalid_frames() {
        let mut f = Fixture::new();
        let image = f.add_image(1, 1);

        // truncated header
        f.dispatcher.on_datagram(&[1, 2, 3], source());
        assert_eq!(f.invalid_packets(), 1);

        // frame length beyond the datagram
        let mut frame = data_frame(1, 2, 0, 0, 64, DataFlags::UNFRAGMENTED);
        frame.truncate(48);
        assert_eq!(f.dispatcher.on_datagram(&frame, source()), 0);
        assert_eq!(f.invalid_packets(), 2);

        // unknown frame type
        let mut frame = data_frame(1, 2, 0, 0, 64, DataFlags::UNFRAGMENTED);
        frame[6] = 99;
        f.dispatcher.on_datagram(&frame, source());
        assert_eq!(f.invalid_packets(), 3);

        // unsupported version
        let mut frame = data_frame(1, 2, 0, 0, 64, DataFlags::UNFRAGMENTED);
        frame[4] = 7;
        f.dispatcher.on_datagram(&frame, source());
        assert_eq!(f.invalid_packets(), 4);

        // rejected by the image
        let frame = data_frame(1, 2, 0, 16, 64, DataFlags::UNFRAGMENTED);
        assert_eq!(f.dispatcher.on_data_frame(&frame), Some(InsertOutcome::Malformed));
        assert_eq!(f.invalid_packets(), 5);

        assert_eq!(image.hwm_position(), 0);
    }

    #[test]
    fn test_rttm_reply() {
        let mut f = Fixture::new();
        f.add_image(1, 1);

        let mut buf = BytesMut::new();
        RttmHeader {
            flags: RTTM_REPLY_FLAG,
            session_id: 1,
            stream_id: 2,
            echo_timestamp_ns: 0,
            reception_delta_ns: 0,
            receiver_id: 0,
        }.ser(&mut buf);

        assert_eq!(f.dispatcher.on_datagram(&buf, source()), 1);
        assert!(matches!(f.dispatcher.on_rttm_frame(&buf, source()), Some(RttmOutcome::Accepted { .. })));

        assert!(f.dispatcher.on_rttm_frame(&buf[..20], source()).is_none());
        assert_eq!(f.invalid_packets(), 1);
    }

    #[test]
    fn test_receive_loop() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let receiver = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

            let f = Fixture::new();
            let image = f.image(1, 1, sender.local_addr().unwrap());
            let hot = image.hot().clone();

            let (command_sender, command_receiver) = mpsc::unbounded_channel();
            let (shutdown_sender, shutdown_receiver) = oneshot::channel();
            command_sender.send(ReceiverCommand::AddImage(hot.clone())).unwrap();

            let receive_loop = tokio::spawn(run_receiver(
                receiver.clone(),
                DataPacketDispatcher::new(&f.system_counters),
                Arc::new(UdpReceiveChannelEndpoint::new(receiver.clone())),
                command_receiver,
                Arc::new(SystemNanoClock::new()),
                Duration::from_millis(1),
                shutdown_receiver,
            ));

            // the initial status message announces the window
            let mut buf = [0u8; 256];
            let (len, _) = time::timeout(Duration::from_secs(5), sender.recv_from(&mut buf)).await.unwrap().unwrap();
            let status_message = StatusMessage::deser(&mut &buf[..len]).unwrap();
            assert_eq!(status_message.consumption_term_offset, 0);
            assert_eq!(status_message.receiver_window, 32768);

            let receiver_addr = receiver.local_addr().unwrap();
            sender.send_to(&data_frame(1, 2, 0, 0, 512, DataFlags::UNFRAGMENTED), receiver_addr).await.unwrap();

            time::timeout(Duration::from_secs(5), async {
                while hot.hwm_position() < 512 {
                    time::sleep(Duration::from_millis(1)).await;
                }
            }).await.unwrap();

            shutdown_sender.send(()).unwrap();
            receive_loop.await.unwrap().unwrap();
        });
    }
}
