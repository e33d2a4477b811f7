//! Broadcast event bus for distributing `WorkflowEvent` to subscribers.
//!
//! Built on `tokio::sync::broadcast`. Every published event is wrapped in an
//! `EventEnvelope` stamped with a sequence number shared by all clones of the
//! bus. Publishing with no active subscribers is a no-op.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use orchestra_types::event::{EventEnvelope, WorkflowEvent};
use tokio::sync::broadcast;

/// Multi-consumer event bus for run lifecycle events.
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    seq: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers and return its sequence
    /// number. Sequence numbers start at 1.
    pub fn publish(&self, event: WorkflowEvent) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.sender.send(EventEnvelope {
            seq,
            emitted_at: Utc::now(),
            event,
        });
        seq
    }

    /// Sequence number of the last published event (0 if none).
    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            seq: Arc::clone(&self.seq),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .field("last_seq", &self.last_seq())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn cancelled() -> WorkflowEvent {
        WorkflowEvent::RunCancelled {
            run_id: Uuid::now_v7(),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_sequenced_envelopes() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.publish(cancelled()), 1);
        assert_eq!(bus.publish(cancelled()), 2);

        assert_eq!(rx1.recv().await.unwrap().seq, 1);
        assert_eq!(rx1.recv().await.unwrap().seq, 2);
        let e = rx2.recv().await.unwrap();
        assert!(matches!(e.event, WorkflowEvent::RunCancelled { .. }));
    }

    #[test]
    fn clones_share_sequence_and_channel() {
        let bus = EventBus::new(16);
        let other = bus.clone();
        let mut rx = bus.subscribe();

        bus.publish(cancelled());
        other.publish(cancelled());

        assert_eq!(rx.try_recv().unwrap().seq, 1);
        assert_eq!(rx.try_recv().unwrap().seq, 2);
        assert_eq!(bus.last_seq(), 2);
    }

    #[test]
    fn publish_without_subscribers_still_advances() {
        let bus = EventBus::new(4);
        for _ in 0..10 {
            bus.publish(cancelled());
        }
        assert_eq!(bus.last_seq(), 10);
        assert!(format!("{bus:?}").contains("receiver_count"));
    }
}
