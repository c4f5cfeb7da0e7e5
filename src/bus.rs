//! In-process pub-sub for watcher notifications.
//!
//! Subscribers run synchronously on the thread that publishes. The
//! subscriber list is lock-guarded and snapshotted at publish time, so
//! subscribing while a publish is in flight is safe. A panicking subscriber
//! is logged and never takes the publisher down.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use crate::event::NormalizedEvent;

/// A notification published by the watcher.
#[derive(Debug, Clone)]
pub enum Notice {
    /// The watcher finished its start sequence.
    Started,

    /// The watcher finished its stop sequence.
    Stopped,

    /// A normalized event passed the duplicate check.
    Event {
        provider: String,
        event: NormalizedEvent,
    },

    /// An error on the event path (logged and swallowed there).
    Error { provider: String, message: String },
}

/// A registered notification callback.
pub type Subscriber = Arc<dyn Fn(&Notice) + Send + Sync>;

/// The in-process notification bus.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        EventBus {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Registers a subscriber. Subscribers cannot be removed; the list is
    /// append-only for the lifetime of the watcher.
    pub fn subscribe(&self, subscriber: Subscriber) {
        self.subscribers
            .write()
            .expect("subscriber lock poisoned")
            .push(subscriber);
    }

    /// Publishes a notice to every subscriber.
    ///
    /// Subscriber panics are caught and logged, not propagated.
    pub fn publish(&self, notice: &Notice) {
        let snapshot: Vec<Subscriber> = self
            .subscribers
            .read()
            .expect("subscriber lock poisoned")
            .clone();

        for subscriber in snapshot {
            if catch_unwind(AssertUnwindSafe(|| subscriber(notice))).is_err() {
                tracing::warn!("subscriber panicked while handling a notice");
            }
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .expect("subscriber lock poisoned")
            .len()
    }
}
