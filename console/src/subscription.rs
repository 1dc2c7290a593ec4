//! Listener registry shared by every view that watches the store.
//!
//! The registry lock is only held while the listener list is copied or edited,
//! never while a listener runs, so a listener may unsubscribe itself (or any
//! other listener) from inside its own callback.
//!
//! Each listener runs under its own gate. Unsubscribing from another thread
//! waits on that gate, so once `unsubscribe` returns the listener is neither
//! running nor about to run. Two listeners that unsubscribe each other from
//! two threads at the same moment will deadlock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, ThreadId};

type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    id: u64,
    active: AtomicBool,
    gate: Mutex<()>,
    // thread currently inside `callback`, if any
    running_on: Mutex<Option<ThreadId>>,
    callback: Callback<T>,
}

impl<T> Entry<T> {
    fn on_this_thread(&self) -> bool {
        *self.running_on.lock().unwrap_or_else(PoisonError::into_inner)
            == Some(thread::current().id())
    }

    fn invoke(&self, value: &T) {
        if self.on_this_thread() {
            // the listener triggered a nested change; it already holds the gate
            if self.active.load(Ordering::Acquire) {
                (self.callback)(value);
            }
            return;
        }
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        *self.running_on.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(thread::current().id());
        (self.callback)(value);
        *self.running_on.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        if self.on_this_thread() {
            // called from inside this listener; the rest of the call is ours
            return;
        }
        drop(self.gate.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

struct Registry<T> {
    next_id: AtomicU64,
    entries: Mutex<Vec<Arc<Entry<T>>>>,
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

impl<T> Detach for Registry<T> {
    fn detach(&self, id: u64) {
        let removed = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries
                .iter()
                .position(|e| e.id == id)
                .map(|pos| entries.remove(pos))
        };
        // a notify pass may still hold this entry in its copied list
        if let Some(entry) = removed {
            entry.deactivate();
        }
    }
}

pub struct Subscribers<T> {
    inner: Arc<Registry<T>>,
}

impl<T: 'static> Subscribers<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Entry {
            id,
            active: AtomicBool::new(true),
            gate: Mutex::new(()),
            running_on: Mutex::new(None),
            callback: Box::new(callback),
        });
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);

        let registry: Arc<dyn Detach> = self.inner.clone();
        Subscription {
            handle: Unsubscriber {
                id,
                registry: Arc::downgrade(&registry),
            },
        }
    }

    /// Calls every listener that is still subscribed, once each.
    pub fn notify(&self, value: &T) {
        let entries: Vec<Arc<Entry<T>>> = self
            .inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for entry in entries {
            entry.invoke(value);
        }
    }

    /// Runs `callback` for one listener only, if it is still subscribed.
    pub(crate) fn notify_one(&self, sub: &Subscription, value: &T) {
        let entry = self
            .inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|e| e.id == sub.handle.id)
            .cloned();
        if let Some(entry) = entry {
            entry.invoke(value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable unsubscribe token. Safe to call any number of times, from any
/// thread, including from inside the listener it removes.
#[derive(Clone)]
pub struct Unsubscriber {
    id: u64,
    registry: Weak<dyn Detach>,
}

impl Unsubscriber {
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(self.id);
        }
    }
}

/// Keeps a listener registered; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    handle: Unsubscriber,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        self.handle.unsubscribe();
    }

    pub fn unsubscriber(&self) -> Unsubscriber {
        self.handle.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn every_listener_sees_each_value_once() {
        let subs = Subscribers::<u32>::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));

        let a2 = a.clone();
        let _sa = subs.subscribe(move |v| {
            a2.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let b2 = b.clone();
        let _sb = subs.subscribe(move |v| {
            b2.fetch_add(*v as usize, Ordering::SeqCst);
        });

        subs.notify(&2);
        subs.notify(&3);
        assert_eq!(a.load(Ordering::SeqCst), 5);
        assert_eq!(b.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_drop_detaches() {
        let subs = Subscribers::<()>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let sub = subs.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(subs.len(), 1);
        sub.unsubscribe();
        sub.unsubscribe();
        sub.unsubscriber().unsubscribe();
        assert!(subs.is_empty());
        subs.notify(&());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let h = hits.clone();
        {
            let _scoped = subs.subscribe(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            });
            subs.notify(&());
        }
        subs.notify(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_can_unsubscribe_itself_mid_notify() {
        let subs = Subscribers::<u8>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let me: Arc<OnceLock<Unsubscriber>> = Arc::new(OnceLock::new());

        let (h, me2) = (hits.clone(), me.clone());
        let sub = subs.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            if let Some(handle) = me2.get() {
                handle.unsubscribe();
                handle.unsubscribe();
            }
        });
        let _ = me.set(sub.unsubscriber());

        subs.notify(&1);
        subs.notify(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(subs.is_empty());
    }

    #[test]
    fn listener_removed_by_an_earlier_one_is_skipped() {
        let subs = Subscribers::<u8>::new();
        let second_hits = Arc::new(AtomicUsize::new(0));
        let victim: Arc<OnceLock<Unsubscriber>> = Arc::new(OnceLock::new());

        let v = victim.clone();
        let _first = subs.subscribe(move |_| {
            if let Some(handle) = v.get() {
                handle.unsubscribe();
            }
        });
        let h = second_hits.clone();
        let second = subs.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let _ = victim.set(second.unsubscriber());

        subs.notify(&0);
        assert_eq!(second_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_from_another_thread_waits_for_a_running_listener() {
        let subs = Arc::new(Subscribers::<()>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = std::sync::mpsc::channel();

        let (c, f) = (calls.clone(), finished.clone());
        let sub = subs.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            let _ = started_tx.send(());
            std::thread::sleep(std::time::Duration::from_millis(50));
            f.store(true, Ordering::SeqCst);
        });

        let notifier = {
            let subs = subs.clone();
            std::thread::spawn(move || subs.notify(&()))
        };
        started_rx.recv().unwrap();
        sub.unsubscribe();
        assert!(finished.load(Ordering::SeqCst));

        subs.notify(&());
        notifier.join().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_trigger_a_nested_notify() {
        let subs = Arc::new(Subscribers::<u8>::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (inner, s) = (Arc::downgrade(&subs), seen.clone());
        let _sub = subs.subscribe(move |v| {
            s.lock().unwrap().push(*v);
            if *v == 0
                && let Some(subs) = inner.upgrade()
            {
                subs.notify(&1);
            }
        });

        subs.notify(&0);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn token_outliving_registry_is_harmless() {
        let subs = Subscribers::<()>::new();
        let sub = subs.subscribe(|_| {});
        drop(subs);
        sub.unsubscribe();
    }
}
