//! Notification fan-out by characteristic UUID.
//!
//! Every listener owns an unbounded channel, so dispatch never waits on a
//! listener: each one gets its own copy of the value and drains it at its
//! own pace. Values are forwarded as delivered, duplicates included.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::types::CharacteristicValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiving side of a notification subscription
pub struct NotificationStream {
    pub id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<CharacteristicValue>,
}

impl NotificationStream {
    /// Next value, or `None` once unsubscribed
    pub async fn recv(&mut self) -> Option<CharacteristicValue> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<CharacteristicValue> {
        self.rx.try_recv().ok()
    }
}

struct Listener {
    id: SubscriptionId,
    tx: mpsc::UnboundedSender<CharacteristicValue>,
}

#[derive(Default)]
pub struct NotificationRouter {
    listeners: RwLock<HashMap<Uuid, Vec<Listener>>>,
    next_id: AtomicU64,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `characteristic`
    pub fn subscribe(&self, characteristic: Uuid) -> NotificationStream {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();

        self.listeners
            .write()
            .entry(characteristic)
            .or_default()
            .push(Listener { id, tx });
        debug!("Listener {:?} subscribed to {}", id, characteristic);

        NotificationStream { id, rx }
    }

    /// Register a callback, run on its own task for every value
    pub fn subscribe_with<F, Fut>(&self, characteristic: Uuid, mut callback: F) -> (SubscriptionId, JoinHandle<()>)
    where
        F: FnMut(CharacteristicValue) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut stream = self.subscribe(characteristic);
        let id = stream.id;
        let handle = tokio::spawn(async move {
            while let Some(value) = stream.recv().await {
                callback(value).await;
            }
        });
        (id, handle)
    }

    /// Remove a listener. Unknown or already removed ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut listeners = self.listeners.write();
        for entries in listeners.values_mut() {
            entries.retain(|listener| listener.id != id);
        }
        listeners.retain(|_, entries| !entries.is_empty());
    }

    /// Forward a value to every listener of its characteristic.
    /// Returns how many listeners received it.
    pub fn dispatch(&self, value: CharacteristicValue) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        {
            let listeners = self.listeners.read();
            let Some(entries) = listeners.get(&value.characteristic) else {
                trace!("No listeners for {}", value.characteristic);
                return 0;
            };
            for listener in entries {
                if listener.tx.send(value.clone()).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(listener.id);
                }
            }
        }

        // Receivers dropped without unsubscribing
        for id in closed {
            self.unsubscribe(id);
        }

        delivered
    }

    pub fn listener_count(&self, characteristic: &Uuid) -> usize {
        self.listeners
            .read()
            .get(characteristic)
            .map_or(0, Vec::len)
    }

    /// Drop every listener; their streams end
    pub fn clear(&self) {
        self.listeners.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn value(characteristic: Uuid, byte: u8) -> CharacteristicValue {
        CharacteristicValue {
            characteristic,
            value: vec![byte],
        }
    }

    #[test]
    fn test_dispatch_by_characteristic() {
        let battery = Uuid::from_u128(0x2A19);
        let heart_rate = Uuid::from_u128(0x2A37);
        let router = NotificationRouter::new();

        let mut first = router.subscribe(battery);
        let mut second = router.subscribe(battery);
        let mut other = router.subscribe(heart_rate);

        assert_eq!(router.dispatch(value(battery, 77)), 2);

        assert_eq!(first.try_recv(), Some(value(battery, 77)));
        assert_eq!(second.try_recv(), Some(value(battery, 77)));
        assert_eq!(other.try_recv(), None);
    }

    #[test]
    fn test_no_deduplication_and_order_preserved() {
        let battery = Uuid::from_u128(0x2A19);
        let router = NotificationRouter::new();
        let mut stream = router.subscribe(battery);

        for byte in [50, 50, 49, 50] {
            router.dispatch(value(battery, byte));
        }

        let received: Vec<u8> = std::iter::from_fn(|| stream.try_recv())
            .map(|v| v.value[0])
            .collect();
        assert_eq!(received, vec![50, 50, 49, 50]);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let battery = Uuid::from_u128(0x2A19);
        let router = NotificationRouter::new();
        let stream = router.subscribe(battery);

        router.unsubscribe(stream.id);
        router.unsubscribe(stream.id);

        assert_eq!(router.listener_count(&battery), 0);
        assert_eq!(router.dispatch(value(battery, 1)), 0);
    }

    #[test]
    fn test_dropped_listener_is_pruned() {
        let battery = Uuid::from_u128(0x2A19);
        let router = NotificationRouter::new();
        let stream = router.subscribe(battery);
        drop(stream);

        assert_eq!(router.dispatch(value(battery, 1)), 0);
        assert_eq!(router.listener_count(&battery), 0);
    }

    #[tokio::test]
    async fn test_slow_listener_does_not_block_dispatch() {
        let battery = Uuid::from_u128(0x2A19);
        let router = NotificationRouter::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let (_id, _handle) = router.subscribe_with(battery, move |v| {
            let sink = Arc::clone(&sink);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                sink.lock().push(v.value[0]);
            }
        });
        let mut fast = router.subscribe(battery);

        for byte in 0..3 {
            router.dispatch(value(battery, byte));
        }

        // The fast listener has everything before the slow one finished its first
        assert_eq!(fast.try_recv().map(|v| v.value), Some(vec![0]));
        assert_eq!(fast.try_recv().map(|v| v.value), Some(vec![1]));
        assert_eq!(fast.try_recv().map(|v| v.value), Some(vec![2]));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }
}
