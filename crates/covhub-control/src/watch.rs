//! Watch broadcast hub
//!
//! Agents push coverage events into one bounded queue; a single drain task
//! forwards every event to all subscribers in turn. Producers never wait: when
//! the queue is full the event is dropped and counted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use covhub_transport::TransportError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::signal::ExitSignal;

/// Destination of broadcast events, usually a subscriber socket
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send_event(&self, event: Bytes) -> Result<(), TransportError>;
}

struct Subscriber {
    sink: Arc<dyn EventSink>,
    exit: Arc<ExitSignal>,
}

type Subscribers = Arc<RwLock<HashMap<Uuid, Subscriber>>>;

/// Handle returned to a new subscriber
#[derive(Debug, Clone)]
pub struct WatchSubscription {
    pub id: Uuid,
    /// Fires when the hub drops the subscriber
    pub exit: Arc<ExitSignal>,
}

/// Fan-out of agent events to watch subscribers
pub struct WatchHub {
    events: mpsc::Sender<Bytes>,
    subscribers: Subscribers,
    dropped: AtomicU64,
    drain: JoinHandle<()>,
}

impl WatchHub {
    /// Start the hub with a queue of `capacity` events; needs a tokio runtime
    pub fn start(capacity: usize) -> Self {
        let (events, rx) = mpsc::channel(capacity.max(1));
        let subscribers: Subscribers = Arc::new(RwLock::new(HashMap::new()));
        let drain = tokio::spawn(Self::drain_task(rx, subscribers.clone()));
        info!(capacity, "Watch hub started");

        Self {
            events,
            subscribers,
            dropped: AtomicU64::new(0),
            drain,
        }
    }

    async fn drain_task(mut rx: mpsc::Receiver<Bytes>, subscribers: Subscribers) {
        while let Some(event) = rx.recv().await {
            let targets: Vec<(Uuid, Arc<dyn EventSink>)> = subscribers
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .map(|(id, s)| (*id, s.sink.clone()))
                .collect();

            for (id, sink) in targets {
                if let Err(e) = sink.send_event(event.clone()).await {
                    warn!(subscriber = %id, error = %e, "Dropping watch subscriber");
                    let removed = subscribers
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&id);
                    if let Some(subscriber) = removed {
                        subscriber.exit.fire();
                    }
                }
            }
        }
        debug!("Watch drain task ended");
    }

    /// Offer an event; returns `false` if it was dropped
    pub fn publish(&self, event: Bytes) -> bool {
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "Watch queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink>) -> WatchSubscription {
        let id = Uuid::new_v4();
        let exit = Arc::new(ExitSignal::new());
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                Subscriber {
                    sink,
                    exit: exit.clone(),
                },
            );
        info!(subscriber = %id, "Watch subscriber attached");
        WatchSubscription { id, exit }
    }

    pub fn unsubscribe(&self, id: &Uuid) -> bool {
        let removed = self
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        match removed {
            Some(subscriber) => {
                subscriber.exit.fire();
                info!(subscriber = %id, "Watch subscriber detached");
                true
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Events dropped because the queue was full
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop the drain task and close every subscriber
    pub fn shutdown(&self) {
        self.drain.abort();
        let drained: Vec<Subscriber> = self
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, s)| s)
            .collect();
        for subscriber in drained {
            subscriber.exit.fire();
        }
    }
}

impl Drop for WatchHub {
    fn drop(&mut self) {
        self.drain.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct CollectingSink {
        events: Mutex<Vec<Bytes>>,
        notify: tokio::sync::Notify,
    }

    #[async_trait]
    impl EventSink for CollectingSink {
        async fn send_event(&self, event: Bytes) -> Result<(), TransportError> {
            self.events.lock().unwrap().push(event);
            self.notify.notify_one();
            Ok(())
        }
    }

    impl CollectingSink {
        async fn wait_for(&self, n: usize) -> Vec<Bytes> {
            tokio::time::timeout(Duration::from_secs(1), async {
                loop {
                    let events = self.events.lock().unwrap().clone();
                    if events.len() >= n {
                        return events;
                    }
                    self.notify.notified().await;
                }
            })
            .await
            .unwrap()
        }
    }

    struct BrokenSink;

    #[async_trait]
    impl EventSink for BrokenSink {
        async fn send_event(&self, _event: Bytes) -> Result<(), TransportError> {
            Err(TransportError::ConnectionClosed)
        }
    }

    /// Blocks every write until released
    struct GatedSink {
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl EventSink for GatedSink {
        async fn send_event(&self, _event: Bytes) -> Result<(), TransportError> {
            let permit = self.gate.acquire().await;
            drop(permit);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_events_reach_every_subscriber() {
        let hub = WatchHub::start(16);
        let a = Arc::new(CollectingSink::default());
        let b = Arc::new(CollectingSink::default());
        hub.subscribe(a.clone());
        hub.subscribe(b.clone());

        assert!(hub.publish(Bytes::from("one")));
        assert!(hub.publish(Bytes::from("two")));

        let expected = vec![Bytes::from("one"), Bytes::from("two")];
        assert_eq!(a.wait_for(2).await, expected);
        assert_eq!(b.wait_for(2).await, expected);
    }

    #[tokio::test]
    async fn test_failed_subscriber_is_removed_alone() {
        let hub = WatchHub::start(16);
        let good = Arc::new(CollectingSink::default());
        hub.subscribe(good.clone());
        let broken = hub.subscribe(Arc::new(BrokenSink));

        hub.publish(Bytes::from("event"));
        good.wait_for(1).await;
        tokio::time::timeout(Duration::from_secs(1), broken.exit.cancelled())
            .await
            .unwrap();

        assert_eq!(hub.subscriber_count(), 1);
        hub.publish(Bytes::from("next"));
        assert_eq!(good.wait_for(2).await.len(), 2);
    }

    #[tokio::test]
    async fn test_full_queue_drops_events() {
        let hub = WatchHub::start(1);
        let sink = Arc::new(GatedSink {
            gate: tokio::sync::Semaphore::new(0),
        });
        hub.subscribe(sink.clone());

        // The drain task takes the first event and blocks on the sink, the
        // second fills the queue, everything after is dropped.
        assert!(hub.publish(Bytes::from("0")));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(hub.publish(Bytes::from("1")));
        assert!(!hub.publish(Bytes::from("2")));
        assert!(!hub.publish(Bytes::from("3")));
        assert_eq!(hub.dropped_events(), 2);

        sink.gate.add_permits(16);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_shutdown_fire_exits() {
        let hub = WatchHub::start(4);
        let first = hub.subscribe(Arc::new(CollectingSink::default()));
        let second = hub.subscribe(Arc::new(CollectingSink::default()));

        assert!(hub.unsubscribe(&first.id));
        assert!(!hub.unsubscribe(&first.id));
        assert!(first.exit.is_fired());

        hub.shutdown();
        assert!(second.exit.is_fired());
        assert_eq!(hub.subscriber_count(), 0);
    }
}
