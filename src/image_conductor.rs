//! The scheduler side: creates images, links subscribers, and runs the duty cycle that tracks
//!  rebuild progress and moves images through their lifecycle.
//!
//! The conductor owns every [PublicationImage] exclusively. The receive context only ever sees
//!  the images' [ImageHotPath]s, which it gets and loses through [ReceiverCommand]s.

use std::sync::Arc;
use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, info, instrument, warn};
use crate::clock::{nanos, NanoClock};
use crate::config::ReceiverConfig;
use crate::congestion_control;
use crate::counters::{AtomicCounter, CountersManager, SystemCounters, RECEIVER_HWM_TYPE_ID, RECEIVER_POS_TYPE_ID, SUBSCRIBER_POSITION_TYPE_ID};
use crate::data_packet_dispatcher::ReceiverCommand;
use crate::publication_image::{ImageHotPath, ImageParams, ImageStatus, PublicationImage};
use crate::subscribeable::SubscriberPosition;

pub struct ImageConductor {
    config: Arc<ReceiverConfig>,
    counters_manager: Arc<CountersManager>,
    system_counters: Arc<SystemCounters>,
    clock: Arc<dyn NanoClock>,
    images: FxHashMap<i64, PublicationImage>,
    receiver_commands: mpsc::UnboundedSender<ReceiverCommand>,
    status_message_timeout_ns: i64,
}

impl ImageConductor {
    pub fn new(
        config: Arc<ReceiverConfig>,
        counters_manager: Arc<CountersManager>,
        system_counters: Arc<SystemCounters>,
        clock: Arc<dyn NanoClock>,
        receiver_commands: mpsc::UnboundedSender<ReceiverCommand>,
    ) -> anyhow::Result<ImageConductor> {
        config.validate()?;

        let status_message_timeout_ns = nanos(config.status_message_timeout);
        Ok(ImageConductor {
            config,
            counters_manager,
            system_counters,
            clock,
            images: FxHashMap::default(),
            receiver_commands,
            status_message_timeout_ns,
        })
    }

    pub fn image(&self, correlation_id: i64) -> Option<&PublicationImage> {
        self.images.get(&correlation_id)
    }

    pub fn num_images(&self) -> usize {
        self.images.len()
    }

    /// Creates an image for a newly announced publication and hands it to the receive context.
    ///  The image's position counters are released again if creation fails.
    #[instrument(skip_all, fields(correlation_id = params.correlation_id))]
    pub fn create_image(&mut self, params: ImageParams) -> anyhow::Result<Arc<ImageHotPath>> {
        if self.images.contains_key(&params.correlation_id) {
            bail!("image #{} exists already", params.correlation_id);
        }

        let label = format!("{}/{} #{}", params.session_id, params.stream_id, params.correlation_id);
        let hwm_position = self.counters_manager.allocate(RECEIVER_HWM_TYPE_ID, format!("rcv-hwm: {}", label))?;
        let rebuilt_position = match self.counters_manager.allocate(RECEIVER_POS_TYPE_ID, format!("rcv-pos: {}", label)) {
            Ok(counter) => counter,
            Err(e) => {
                self.counters_manager.free(hwm_position.id());
                return Err(e);
            }
        };

        let congestion_control = congestion_control::create(&self.config, params.term_buffer_length, params.sender_mtu_length);
        let correlation_id = params.correlation_id;

        let image = match PublicationImage::create(
            params,
            &self.config,
            hwm_position.clone(),
            rebuilt_position.clone(),
            congestion_control,
            &self.system_counters,
            self.clock.clone(),
        ) {
            Ok(image) => image,
            Err(e) => {
                warn!("unable to create image: {}", e);
                self.counters_manager.free(hwm_position.id());
                self.counters_manager.free(rebuilt_position.id());
                return Err(e);
            }
        };

        let hot = image.hot().clone();
        self.images.insert(correlation_id, image);

        if self.receiver_commands.send(ReceiverCommand::AddImage(hot.clone())).is_err() {
            warn!("receive loop is gone - {:?} will not receive data", hot);
        }
        Ok(hot)
    }

    /// Links a subscriber to an image, activating the image on its first subscriber. Returns
    ///  the subscriber's position counter, which the subscriber advances as it consumes.
    pub fn link_subscriber(&mut self, correlation_id: i64, registration_id: i64) -> anyhow::Result<Arc<AtomicCounter>> {
        let Some(image) = self.images.get_mut(&correlation_id) else {
            bail!("no image #{}", correlation_id);
        };
        if !matches!(image.status(), ImageStatus::Init | ImageStatus::Active) {
            bail!("image #{} is {:?}", correlation_id, image.status());
        }

        let position = self.counters_manager.allocate(
            SUBSCRIBER_POSITION_TYPE_ID,
            format!("sub-pos: {} #{}", registration_id, correlation_id),
        )?;
        image.add_subscriber(SubscriberPosition { registration_id, position: position.clone() });
        image.activate(self.clock.nano_time());
        Ok(position)
    }

    pub fn unlink_subscriber(&mut self, correlation_id: i64, registration_id: i64) -> bool {
        let Some(subscriber) = self.images.get_mut(&correlation_id)
            .and_then(|image| image.remove_subscriber(registration_id))
        else {
            debug!("subscriber {} is not linked to image #{}", registration_id, correlation_id);
            return false;
        };

        self.counters_manager.free(subscriber.position.id());
        true
    }

    /// One tick of the duty cycle: track every image's rebuild, stop dispatching to images that
    ///  went inactive, and release images that reached the end of their life.
    pub fn on_check_images(&mut self, now_ns: i64) {
        let mut end_of_life = Vec::new();

        for (&correlation_id, image) in self.images.iter_mut() {
            let was_receiving = matches!(image.status(), ImageStatus::Init | ImageStatus::Active);
            image.track_rebuild(now_ns, self.status_message_timeout_ns);

            if was_receiving && !matches!(image.status(), ImageStatus::Init | ImageStatus::Active) {
                let hot = image.hot();
                let command = ReceiverCommand::RemoveImage {
                    session_id: hot.session_id(),
                    stream_id: hot.stream_id(),
                    correlation_id,
                };
                if self.receiver_commands.send(command).is_err() {
                    debug!("receive loop is gone");
                }
            }

            if image.has_reached_end_of_life() {
                end_of_life.push(correlation_id);
            }
        }

        for correlation_id in end_of_life {
            if let Some(image) = self.images.remove(&correlation_id) {
                image.close(&self.counters_manager);
            }
        }
    }

    /// Runs the duty cycle until `shutdown` fires, then closes all remaining images
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut ticks = time::interval(self.config.conductor_tick_interval);
        ticks.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        info!("starting image conductor");

        loop {
            select! {
                _ = ticks.tick() => {
                    let now_ns = self.clock.nano_time();
                    self.on_check_images(now_ns);
                }
                _ = &mut shutdown => {
                    break;
                }
            }
        }

        info!("shutting down image conductor, closing {} images", self.images.len());
        for (_, image) in self.images.drain() {
            image.close(&self.counters_manager);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::runtime::Builder;
    use crate::clock::CachedNanoClock;
    use crate::frame::DataFlags;
    use crate::test_util::{data_frame, heartbeat_frame};
    use super::*;

    struct Fixture {
        conductor: ImageConductor,
        counters_manager: Arc<CountersManager>,
        clock: Arc<CachedNanoClock>,
        commands: mpsc::UnboundedReceiver<ReceiverCommand>,
    }

    impl Fixture {
        fn new() -> Fixture {
            let counters_manager = Arc::new(CountersManager::new(64));
            let system_counters = Arc::new(SystemCounters::new(&counters_manager).unwrap());
            let clock = Arc::new(CachedNanoClock::new(0));
            let (sender, commands) = mpsc::unbounded_channel();

            let conductor = ImageConductor::new(
                Arc::new(ReceiverConfig::default_config()),
                counters_manager.clone(),
                system_counters,
                clock.clone(),
                sender,
            ).unwrap();

            Fixture { conductor, counters_manager, clock, commands }
        }

        fn tick(&mut self) {
            let now_ns = self.clock.nano_time();
            self.conductor.on_check_images(now_ns);
        }
    }

    fn params(correlation_id: i64) -> ImageParams {
        let address: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        ImageParams {
            correlation_id,
            session_id: 1,
            stream_id: 2,
            initial_term_id: 0,
            active_term_id: 0,
            initial_term_offset: 0,
            term_buffer_length: 65536,
            sender_mtu_length: 1408,
            is_reliable: true,
            control_address: address,
            source_address: address,
        }
    }

    #[test]
    fn test_create_image() {
        let mut f = Fixture::new();
        let counters_before = f.counters_manager.len();

        let hot = f.conductor.create_image(params(1)).unwrap();
        assert_eq!(f.conductor.num_images(), 1);
        assert_eq!(f.counters_manager.len(), counters_before + 2);
        assert!(matches!(f.commands.try_recv(), Ok(ReceiverCommand::AddImage(image)) if Arc::ptr_eq(&image, &hot)));

        assert!(f.conductor.create_image(params(1)).is_err());
    }

    #[test]
    fn test_failed_creation_frees_counters() {
        let mut f = Fixture::new();
        let counters_before = f.counters_manager.len();

        let mut p = params(1);
        p.term_buffer_length = 1000;
        assert!(f.conductor.create_image(p).is_err());
        assert_eq!(f.counters_manager.len(), counters_before);
        assert_eq!(f.conductor.num_images(), 0);
        assert!(f.commands.try_recv().is_err());
    }

    #[test]
    fn test_link_subscriber() {
        let mut f = Fixture::new();
        let hot = f.conductor.create_image(params(1)).unwrap();
        assert_eq!(hot.status(), ImageStatus::Init);

        let position = f.conductor.link_subscriber(1, 100).unwrap();
        assert_eq!(hot.status(), ImageStatus::Active);
        assert_eq!(position.get(), 0);
        assert_eq!(f.conductor.image(1).map(|image| image.subscriber_count()), Some(1));

        assert!(f.conductor.link_subscriber(2, 100).is_err());

        let counters = f.counters_manager.len();
        assert!(f.conductor.unlink_subscriber(1, 100));
        assert!(!f.conductor.unlink_subscriber(1, 100));
        assert_eq!(f.counters_manager.len(), counters - 1);
    }

    #[test]
    fn test_lifecycle_to_end_of_life() {
        let mut f = Fixture::new();
        let counters_before = f.counters_manager.len();
        let hot = f.conductor.create_image(params(1)).unwrap();
        f.conductor.link_subscriber(1, 100).unwrap();
        let _ = f.commands.try_recv();

        assert_eq!(hot.insert_packet(0, 0, &data_frame(1, 2, 0, 0, 64, DataFlags::UNFRAGMENTED)), crate::publication_image::InsertOutcome::Accepted);
        f.tick();
        assert_eq!(hot.rebuilt_position(), 64);

        f.clock.advance(Duration::from_secs(11));
        f.tick();
        assert_eq!(hot.status(), ImageStatus::Inactive);
        assert!(matches!(f.commands.try_recv(), Ok(ReceiverCommand::RemoveImage { session_id: 1, stream_id: 2, correlation_id: 1 })));

        // the subscriber has not consumed yet, so the image waits out the liveness timeout
        f.tick();
        assert_eq!(hot.status(), ImageStatus::Inactive);
        f.clock.advance(Duration::from_secs(11));
        f.tick();
        assert_eq!(hot.status(), ImageStatus::Linger);

        f.clock.advance(Duration::from_secs(6));
        f.tick();
        assert_eq!(f.conductor.num_images(), 0);
        assert!(hot.log().is_closed());
        assert_eq!(f.counters_manager.len(), counters_before);
        assert!(f.commands.try_recv().is_err());
    }

    #[test]
    fn test_end_of_stream_deactivates() {
        let mut f = Fixture::new();
        let hot = f.conductor.create_image(params(1)).unwrap();
        let position = f.conductor.link_subscriber(1, 100).unwrap();

        hot.insert_packet(0, 0, &data_frame(1, 2, 0, 0, 64, DataFlags::UNFRAGMENTED));
        hot.insert_packet(0, 64, &heartbeat_frame(1, 2, 0, 64, DataFlags::END_OF_STREAM));
        f.tick();
        assert_eq!(hot.status(), ImageStatus::Inactive);

        position.set_ordered(64);
        f.tick();
        assert_eq!(hot.status(), ImageStatus::Linger);
        assert!(f.conductor.link_subscriber(1, 101).is_err());
    }

    #[test]
    fn test_run_closes_images_on_shutdown() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut f = Fixture::new();
            let counters_before = f.counters_manager.len();
            let hot = f.conductor.create_image(params(1)).unwrap();

            let (shutdown_sender, shutdown_receiver) = oneshot::channel();
            let conductor = tokio::spawn(f.conductor.run(shutdown_receiver));

            time::sleep(Duration::from_millis(10)).await;
            shutdown_sender.send(()).unwrap();
            conductor.await.unwrap();

            assert!(hot.log().is_closed());
            assert_eq!(f.counters_manager.len(), counters_before);
        });
    }
}
