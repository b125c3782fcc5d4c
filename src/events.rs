//! Observer registry for alert notifications

use crate::alerts::Alert;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Capability notified by the alert sink. Presentation concerns (sound,
/// desktop notifications, webhooks) live behind this trait.
pub trait AlertObserver: Send + Sync {
    fn on_alert(&self, alert: &Alert);

    /// The instrument left the inactive set; stop any ongoing alert sound
    fn on_inactive_cleared(&self, _instrument: &str) {}
}

/// Observer entry with unique ID for management
#[derive(Clone)]
struct ObserverEntry {
    id: u64,
    observer: Arc<dyn AlertObserver>,
}

/// Registry dispatching sink notifications to observers
pub struct ObserverRegistry {
    observers: Mutex<Vec<ObserverEntry>>,
    next_id: AtomicU64,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register an observer, returning its id
    pub fn register(&self, observer: Arc<dyn AlertObserver>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries().push(ObserverEntry { id, observer });

        tracing::debug!("Registered alert observer {}", id);
        id
    }

    /// Unregister an observer by ID
    pub fn unregister(&self, observer_id: u64) -> bool {
        let mut observers = self.entries();
        let initial_len = observers.len();
        observers.retain(|entry| entry.id != observer_id);
        let removed = observers.len() < initial_len;

        if removed {
            tracing::debug!("Unregistered alert observer {}", observer_id);
        }

        removed
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dispatch_alert(&self, alert: &Alert) {
        for entry in self.snapshot() {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                entry.observer.on_alert(alert);
            }))
            .is_err()
            {
                tracing::error!("Alert observer {} panicked while handling alert {}", entry.id, alert.id);
            }
        }
    }

    pub fn dispatch_inactive_cleared(&self, instrument: &str) {
        for entry in self.snapshot() {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                entry.observer.on_inactive_cleared(instrument);
            }))
            .is_err()
            {
                tracing::error!("Alert observer {} panicked while clearing {}", entry.id, instrument);
            }
        }
    }

    /// Observers run outside the lock so they may call back into the sink
    fn snapshot(&self) -> Vec<ObserverEntry> {
        self.entries().clone()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<ObserverEntry>> {
        self.observers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
