use std::sync::Arc;
use tracing::debug;
use crate::counters::AtomicCounter;

/// A subscriber's consumption position in an image. The subscriber advances the counter, the
///  image reads it to decide how far the log may be cleaned and the window moved.
#[derive(Debug, Clone)]
pub struct SubscriberPosition {
    pub registration_id: i64,
    pub position: Arc<AtomicCounter>,
}

/// The subscribers linked to an image. This is scheduler owned data: subscribers are linked and
///  unlinked by the conductor, never from the receive path.
#[derive(Debug, Default)]
pub struct Subscribeable {
    positions: Vec<SubscriberPosition>,
}

impl Subscribeable {
    pub fn add(&mut self, position: SubscriberPosition) {
        debug!("linking subscriber {} (position counter #{})", position.registration_id, position.position.id());
        self.positions.push(position);
    }

    pub fn remove(&mut self, registration_id: i64) -> Option<SubscriberPosition> {
        let idx = self.positions.iter()
            .position(|p| p.registration_id == registration_id)?;
        Some(self.positions.swap_remove(idx))
    }

    pub fn positions(&self) -> &[SubscriberPosition] {
        &self.positions
    }

    pub fn min_position(&self) -> Option<i64> {
        self.positions.iter()
            .map(|p| p.position.get())
            .min()
    }

    /// all subscribers consumed everything up to `position`, trivially true without subscribers
    pub fn is_drained(&self, position: i64) -> bool {
        self.positions.iter()
            .all(|p| p.position.get() >= position)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber(registration_id: i64, position: i64) -> SubscriberPosition {
        SubscriberPosition {
            registration_id,
            position: Arc::new(AtomicCounter::new(registration_id as i32, position)),
        }
    }

    #[test]
    fn test_min_position_and_drained() {
        let mut subscribeable = Subscribeable::default();
        assert_eq!(subscribeable.min_position(), None);
        assert!(subscribeable.is_drained(1024));

        subscribeable.add(subscriber(1, 512));
        subscribeable.add(subscriber(2, 2048));
        assert_eq!(subscribeable.len(), 2);
        assert_eq!(subscribeable.min_position(), Some(512));
        assert!(!subscribeable.is_drained(1024));
        assert!(subscribeable.is_drained(512));
    }

    #[test]
    fn test_remove() {
        let mut subscribeable = Subscribeable::default();
        subscribeable.add(subscriber(1, 512));
        subscribeable.add(subscriber(2, 2048));

        assert_eq!(subscribeable.remove(1).map(|p| p.registration_id), Some(1));
        assert!(subscribeable.remove(1).is_none());
        assert_eq!(subscribeable.min_position(), Some(2048));

        subscribeable.remove(2);
        assert!(subscribeable.is_empty());
    }
}
