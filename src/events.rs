//! Post-commit domain events.
//!
//! The store publishes a [`DomainEvent`] after each mutation has been
//! committed. The scheduler is the main subscriber; anything else that
//! needs to react to site or history changes can subscribe as well.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::{HistoryId, SiteId};

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// A committed change to a site or its history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    SiteCreated { site_id: SiteId },
    SitePaused { site_id: SiteId, paused: bool },
    /// `next_schedule` was changed while the site is not paused.
    SiteRescheduled { site_id: SiteId },
    SiteDeleted { site_id: SiteId },
    /// A new history row was inserted, by the scheduler or by hand.
    HistoryLogged { site_id: SiteId, history_id: HistoryId },
    HistoryChanged { site_id: SiteId, history_id: HistoryId },
}

impl DomainEvent {
    pub fn site_id(&self) -> SiteId {
        match self {
            DomainEvent::SiteCreated { site_id }
            | DomainEvent::SitePaused { site_id, .. }
            | DomainEvent::SiteRescheduled { site_id }
            | DomainEvent::SiteDeleted { site_id }
            | DomainEvent::HistoryLogged { site_id, .. }
            | DomainEvent::HistoryChanged { site_id, .. } => *site_id,
        }
    }
}

/// In-process fan-out bus for [`DomainEvent`]s. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    /// When the buffer is full the oldest events are dropped and slow
    /// receivers observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: DomainEvent) {
        tracing::trace!(?event, "publishing domain event");
        // A send error only means nobody is listening.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(DomainEvent::SiteCreated { site_id: 3 });

        assert_eq!(a.recv().await.unwrap(), DomainEvent::SiteCreated { site_id: 3 });
        assert_eq!(b.recv().await.unwrap().site_id(), 3);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(DomainEvent::SiteDeleted { site_id: 1 });
    }

    #[tokio::test]
    async fn test_slow_subscriber_observes_lag() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for id in 0..5 {
            bus.publish(DomainEvent::SiteRescheduled { site_id: id });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
    }
}
