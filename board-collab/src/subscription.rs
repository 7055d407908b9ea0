//! Cancellation handles and listener fan-out.
//!
//! Every `subscribe`/`on_*` call in the crate returns a [`Subscription`].
//! Calling [`Subscription::unsubscribe`] removes the listener; further calls
//! are no-ops. Dropping the handle unsubscribes as well, so a caller must
//! keep the handle for as long as it wants events.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Cancel = Box<dyn FnOnce() + Send>;

/// Handle returned from every subscribe call.
pub struct Subscription {
    cancel: Mutex<Option<Cancel>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// A handle with nothing to cancel.
    pub fn noop() -> Self {
        Self {
            cancel: Mutex::new(None),
        }
    }

    /// Remove the listener. Idempotent.
    pub fn unsubscribe(&self) {
        let cancel = match self.cancel.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    /// Whether the listener is still registered through this handle.
    pub fn is_active(&self) -> bool {
        match self.cancel.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerTable<T> {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<u64, Listener<T>>>,
}

/// A set of callbacks notified in registration order.
///
/// A panicking listener is logged and skipped; the remaining listeners
/// still run.
pub struct ListenerSet<T> {
    inner: Arc<ListenerTable<T>>,
}

impl<T: 'static> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ListenerTable {
                next_id: AtomicU64::new(0),
                listeners: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Register a listener.
    pub fn add(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.listeners).insert(id, Arc::new(listener));

        let weak: Weak<ListenerTable<T>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(table) = weak.upgrade() {
                lock(&table.listeners).remove(&id);
            }
        })
    }

    /// Notify all listeners. Returns how many panicked.
    pub fn emit(&self, value: &T) -> usize {
        // Snapshot so listeners may (un)subscribe while being called.
        let listeners: Vec<Listener<T>> = lock(&self.inner.listeners).values().cloned().collect();
        let mut failures = 0;
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(value))).is_err() {
                failures += 1;
                log::error!("Listener panicked; continuing fan-out");
            }
        }
        failures
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_all_listeners() {
        let set: ListenerSet<u32> = ListenerSet::new();
        let total = Arc::new(AtomicUsize::new(0));

        let t1 = total.clone();
        let _s1 = set.add(move |v| {
            t1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let t2 = total.clone();
        let _s2 = set.add(move |v| {
            t2.fetch_add(*v as usize, Ordering::SeqCst);
        });

        set.emit(&5);
        assert_eq!(total.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let set: ListenerSet<()> = ListenerSet::new();
        let sub = set.add(|_| {});
        assert_eq!(set.len(), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(set.is_empty());
        assert!(!sub.is_active());
    }

    #[test]
    fn test_drop_unsubscribes() {
        let set: ListenerSet<()> = ListenerSet::new();
        {
            let _sub = set.add(|_| {});
            assert_eq!(set.len(), 1);
        }
        assert!(set.is_empty());
    }

    #[test]
    fn test_panicking_listener_isolated() {
        let set: ListenerSet<()> = ListenerSet::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let _bad = set.add(|_| panic!("listener failure"));
        let h = hits.clone();
        let _good = set.add(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let failures = set.emit(&());
        assert_eq!(failures, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_after_set_dropped() {
        let set: ListenerSet<()> = ListenerSet::new();
        let sub = set.add(|_| {});
        drop(set);
        sub.unsubscribe();
    }

    #[test]
    fn test_noop_subscription() {
        let sub = Subscription::noop();
        assert!(!sub.is_active());
        sub.unsubscribe();
    }
}
