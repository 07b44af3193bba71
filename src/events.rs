//! Event Fan-out
//!
//! Typed events over tokio broadcast channels. Emission is a non-blocking
//! `send`, and subscriber code runs on its own task, so a handler can
//! never reentrantly deadlock the single-flight process mutex.

use crate::crdt::Batch;
use tokio::sync::broadcast;

/// Semantic and transport events from a map replica
#[derive(Debug, Clone)]
pub enum MapEvent<V> {
    /// A new live pair was installed; `previous` is the value it replaced
    Set {
        key: String,
        value: V,
        previous: Option<V>,
    },
    /// A live pair was removed
    Delete { key: String, value: V },
    /// A redundant insertion with an equal id was re-received
    Affirm { key: String, value: V },
    /// A batch of outgoing operations for the transport to deliver
    Publish { batch: Batch<V> },
    /// Readiness-phase failure
    Error { message: String },
}

/// Events from a set replica
#[derive(Debug, Clone)]
pub enum SetEvent<V> {
    /// A value became a member
    Add { value: V },
    /// A value stopped being a member
    Delete { value: V },
    /// A redundant add with an equal id was re-received
    Affirm { value: V },
    /// A gzip-compressed wire message for the transport to deliver
    Publish { buffer: Vec<u8> },
}

/// Broadcast wrapper shared by all container variants
#[derive(Debug, Clone)]
pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    /// `capacity` is how many events a slow subscriber may lag behind
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        EventBus { tx }
    }

    /// Emit to all subscribers; returns how many received it
    pub fn emit(&self, event: E) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_harmless() {
        let bus: EventBus<u32> = EventBus::new(8);
        assert_eq!(bus.emit(1), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_all_subscribers_receive() {
        let bus: EventBus<u32> = EventBus::new(8);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.emit(42), 2);
        assert_eq!(rx1.recv().await.unwrap(), 42);
        assert_eq!(rx2.recv().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_events_arrive_in_emission_order() {
        let bus: EventBus<u32> = EventBus::new(8);
        let mut rx = bus.subscribe();

        for n in 0..5 {
            bus.emit(n);
        }
        for n in 0..5 {
            assert_eq!(rx.recv().await.unwrap(), n);
        }
    }
}
