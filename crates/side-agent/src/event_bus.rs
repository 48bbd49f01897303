//! Broadcast bus for flow events.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::events::{EventObserver, FlowEvent, FlowEventKind};

const EVENT_BUS_BUFFER: usize = 1024;

pub type ObserverToken = u64;

type ObserverList = Vec<(ObserverToken, Arc<dyn EventObserver>)>;

/// Fan-out for [`FlowEvent`]s: broadcast subscribers plus registered
/// observers. Events are sequenced on publish; per-dev-run ordering relies
/// on the per-run `sequence` field, not on bus order.
pub struct EventBus {
    sender: broadcast::Sender<FlowEvent>,
    observers: Arc<Mutex<ObserverList>>,
    sequence: AtomicU64,
    observer_sequence: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_BUFFER);
        Self {
            sender,
            observers: Arc::new(Mutex::new(Vec::new())),
            sequence: AtomicU64::new(1),
            observer_sequence: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.sender.subscribe()
    }

    pub fn add_observer(&self, observer: Arc<dyn EventObserver>) -> ObserverToken {
        let token = self.observer_sequence.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push((token, observer));
        token
    }

    /// Returns true when an observer was removed.
    pub fn remove_observer(&self, token: ObserverToken) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(t, _)| *t != token);
        before != observers.len()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Publish an event to all subscribers and observers.
    pub fn publish(&self, flow_id: &str, kind: FlowEventKind) {
        let event = FlowEvent {
            seq: self.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp: time::OffsetDateTime::now_utc().unix_timestamp(),
            flow_id: flow_id.to_string(),
            kind,
        };
        self.dispatch(event);
    }

    fn dispatch(&self, event: FlowEvent) {
        let _ = self.sender.send(event.clone());

        let observers = {
            self.observers
                .lock()
                .iter()
                .map(|(_, o)| Arc::clone(o))
                .collect::<Vec<_>>()
        };

        for observer in observers {
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(err) = observer.on_event(&event).await {
                    log::error!(
                        "event observer failure: flow_id={}, seq={}, error={}",
                        event.flow_id,
                        event.seq,
                        err
                    );
                }
            });
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
