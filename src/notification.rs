//! Named, payload-free notifications
//!
//! A notification only says "something changed"; observers re-read whatever
//! state they care about. Delivery goes to two kinds of observers:
//! broadcast receivers handed out by [`NotificationCenter::subscribe`], and
//! callbacks registered with [`NotificationCenter::add_observer`], which run
//! on the posting thread. A panicking callback is logged and skipped; it
//! never unwinds into the poster.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, error, trace};

/// Posted every time the relayed tunnel status changes
pub const STATUS_CHANGED: &str = "kNotificationVPNStatusChanged";

/// Default broadcast buffer size
pub const DEFAULT_CAPACITY: usize = 64;

/// A posted notification. Carries its name only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub name: &'static str,
}

/// Callback invoked for every matching notification
pub type ObserverCallback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Handle returned by `add_observer`, used to remove the observer again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct Observer {
    id: ObserverId,
    name: &'static str,
    callback: ObserverCallback,
}

/// Notification broadcaster
pub struct NotificationCenter {
    /// Broadcast side, one channel for every name
    event_tx: broadcast::Sender<Notification>,
    /// Registered callbacks
    observers: RwLock<Vec<Observer>>,
    next_id: AtomicU64,
}

impl NotificationCenter {
    /// Create a notification center with the given broadcast buffer size
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            event_tx,
            observers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to every notification posted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.event_tx.subscribe()
    }

    /// Register a callback for notifications named `name`
    pub fn add_observer<F>(&self, name: &'static str, callback: F) -> ObserverId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut observers = self.observers.write().unwrap_or_else(|e| e.into_inner());
        observers.push(Observer {
            id,
            name,
            callback: Arc::new(callback),
        });
        debug!("Added observer {:?} for {}", id, name);
        id
    }

    /// Remove a callback. Returns false if it was not registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write().unwrap_or_else(|e| e.into_inner());
        let before = observers.len();
        observers.retain(|o| o.id != id);
        before != observers.len()
    }

    /// Number of registered callbacks
    pub fn observer_count(&self) -> usize {
        self.observers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Post a notification. Returns how many observers it reached.
    pub fn post(&self, name: &'static str) -> usize {
        let notification = Notification { name };

        // Callbacks run without the lock held so they may add or remove observers
        let callbacks: Vec<ObserverCallback> = {
            let observers = self.observers.read().unwrap_or_else(|e| e.into_inner());
            observers
                .iter()
                .filter(|o| o.name == name)
                .map(|o| o.callback.clone())
                .collect()
        };

        for callback in &callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&notification))).is_err() {
                error!("Observer for {} panicked", name);
            }
        }

        // No receivers is not an error
        let received = self.event_tx.send(notification).unwrap_or(0);
        trace!("Posted {} to {} receivers and {} callbacks", name, received, callbacks.len());
        received + callbacks.len()
    }
}

impl Default for NotificationCenter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
