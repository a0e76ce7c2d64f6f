use crate::error::{RResult, RecorderError};
use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Advisory events broadcast by the recording strategies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusEvent {
    /// Activity recognition reported entering (true) or leaving (false) a vehicle
    DrivingDetected { driving: bool },
    /// No GPS fix for `connection_duration_secs`; the session ends soon unless
    /// the link recovers or the user asks to continue
    GpsNotChanged { connection_duration_secs: u64 },
    /// No OBD reply for `timeout_secs`
    ObdConnectionStale { timeout_secs: u64 },
    /// The user chose to keep recording despite the stale link
    TrackRecordingContinue,
    /// Every OBD adapter failed to connect
    ConnectionPermanentlyFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_id: u64,
    handlers: BTreeMap<SubscriptionId, Handler>,
}

/// Typed publish/subscribe bus.
///
/// Delivery is fire-and-forget: a publish calls every handler registered at
/// that moment once, outside the registry lock.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; it runs on the publishing thread and must not block.
    pub fn subscribe<F>(&self, handler: F) -> RResult<SubscriptionId>
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let mut inner = self.lock()?;
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.handlers.insert(id, Arc::new(handler));
        Ok(id)
    }

    /// Register a channel subscriber for consumers that poll from their own
    /// thread (UI loops, the demo printer).
    pub fn subscribe_channel(&self) -> RResult<(SubscriptionId, Receiver<BusEvent>)> {
        let (tx, rx): (Sender<BusEvent>, Receiver<BusEvent>) = channel::unbounded();
        let id = self.subscribe(move |event| {
            // receiver gone: the subscriber simply misses the event
            let _ = tx.try_send(event.clone());
        })?;
        Ok((id, rx))
    }

    /// Remove a subscriber. Unknown ids (double unregister) are an error the
    /// caller is expected to log and ignore.
    pub fn unsubscribe(&self, id: SubscriptionId) -> RResult<()> {
        let mut inner = self.lock()?;
        match inner.handlers.remove(&id) {
            Some(_) => Ok(()),
            None => Err(RecorderError::EventBus(format!(
                "subscriber {:?} not registered",
                id
            ))),
        }
    }

    pub fn publish(&self, event: BusEvent) {
        let handlers: Vec<Handler> = match self.lock() {
            Ok(inner) => inner.handlers.values().cloned().collect(),
            Err(e) => {
                log::error!("Dropping {:?}: {}", event, e);
                return;
            }
        };

        log::debug!("Publishing {:?} to {} subscriber(s)", event, handlers.len());
        for handler in handlers {
            handler(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().map(|inner| inner.handlers.len()).unwrap_or(0)
    }

    fn lock(&self) -> RResult<std::sync::MutexGuard<'_, BusInner>> {
        self.inner
            .lock()
            .map_err(|_| RecorderError::Internal("Failed to acquire event bus lock".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_publish_reaches_every_subscriber_once() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = hits.clone();
            bus.subscribe(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        bus.publish(BusEvent::TrackRecordingContinue);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_channel_subscriber() {
        let bus = EventBus::new();
        let (_id, rx) = bus.subscribe_channel().unwrap();

        bus.publish(BusEvent::DrivingDetected { driving: true });
        assert_eq!(rx.try_recv().unwrap(), BusEvent::DrivingDetected { driving: true });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribe_twice_is_error() {
        let bus = EventBus::new();
        let id = bus.subscribe(|_| {}).unwrap();

        assert!(bus.unsubscribe(id).is_ok());
        assert!(bus.unsubscribe(id).is_err());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_dropped_receiver_does_not_break_publish() {
        let bus = EventBus::new();
        let (_id, rx) = bus.subscribe_channel().unwrap();
        drop(rx);

        bus.publish(BusEvent::ConnectionPermanentlyFailed);
        assert_eq!(bus.subscriber_count(), 1);
    }
}
