use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::broadcast;

use hush_types::events::GatewayEvent;

/// Buffered events per connection before it counts as lagging.
const BROADCAST_CAPACITY: usize = 1024;

/// Fans gateway events out to all connected clients.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Every connection receives every event and filters by its own subscriptions
    broadcast_tx: broadcast::Sender<GatewayEvent>,

    /// Open gateway connections
    connections: AtomicUsize,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                connections: AtomicUsize::new(0),
            }),
        }
    }

    /// Subscribe to gateway events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to all connected clients.
    pub fn broadcast(&self, event: GatewayEvent) {
        // No receivers just means nobody is connected
        let _ = self.inner.broadcast_tx.send(event);
    }

    pub(crate) fn connection_opened(&self) {
        self.inner.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.inner.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.load(Ordering::Relaxed)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn every_receiver_sees_broadcasts() {
        let dispatcher = Dispatcher::new();
        let mut rx1 = dispatcher.subscribe();
        let mut rx2 = dispatcher.subscribe();

        let conversation_id = Uuid::new_v4();
        dispatcher.broadcast(GatewayEvent::Subscribed { conversation_id });

        for rx in [&mut rx1, &mut rx2] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.conversation_id(), Some(conversation_id));
        }
    }

    #[test]
    fn broadcast_without_receivers_is_harmless() {
        Dispatcher::new().broadcast(GatewayEvent::Error {
            message: "nobody listening".into(),
        });
    }
}
