use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::oneshot;

/// Streaming text that grows until the producer closes it.
pub type LiveText = ObservableValue<String>;

/// One notification delivered to an observer.
pub enum Change<'a, T> {
    Next(&'a T),
    /// Terminal. Carries the last value, which stays readable after close.
    Closed(&'a T),
}

impl<'a, T> Change<'a, T> {
    pub fn value(&self) -> &'a T {
        match self {
            Self::Next(value) | Self::Closed(value) => value,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

impl<T> Clone for Change<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Change<'_, T> {}

impl<T: fmt::Debug> fmt::Debug for Change<'_, T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Next(value) => formatter.debug_tuple("Next").field(value).finish(),
            Self::Closed(value) => formatter.debug_tuple("Closed").field(value).finish(),
        }
    }
}

type Observer<T> = Arc<dyn Fn(Change<'_, T>) + Send + Sync>;

struct ObserverSlot<T> {
    id: u64,
    // Version of the value replayed on subscribe; older emissions are skipped.
    since: u64,
    observer: Observer<T>,
}

enum Emission<T> {
    Next(Arc<T>),
    Closed(Arc<T>),
}

struct Shared<T> {
    value: ArcSwap<T>,
    closed: AtomicBool,
    observers: Mutex<Vec<ObserverSlot<T>>>,
    next_observer_id: AtomicU64,
    version: AtomicU64,
    // Serializes set/close/subscribe so observers see emissions in call order.
    // Re-entrant because observers are allowed to call back into the value.
    emission: ReentrantMutex<()>,
    // Set while a delivery round runs. Nested emissions queue up in `pending`
    // and are drained by the outermost round.
    emitting: AtomicBool,
    pending: Mutex<VecDeque<(u64, Emission<T>)>>,
}

/// Hot, multicast container that replays its latest value to new observers.
///
/// There is no backlog: an observer joining late receives the current value
/// synchronously on subscribe, then every later `set`.
pub struct ObservableValue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ObservableValue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ObservableValue<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ObservableValue")
            .field("value", &self.shared.value.load_full())
            .field("closed", &self.shared.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl<T> ObservableValue<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(value: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                value: ArcSwap::from_pointee(value),
                closed: AtomicBool::new(false),
                observers: Mutex::new(Vec::new()),
                next_observer_id: AtomicU64::new(1),
                version: AtomicU64::new(0),
                emission: ReentrantMutex::new(()),
                emitting: AtomicBool::new(false),
                pending: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn get(&self) -> T
    where
        T: Clone,
    {
        let current = self.shared.value.load_full();
        T::clone(&current)
    }

    /// Shared handle to the current value without cloning it.
    pub fn current(&self) -> Arc<T> {
        self.shared.value.load_full()
    }

    /// Replaces the value and notifies observers in subscription order.
    ///
    /// Returns `false` without touching the value once the container is closed.
    /// Producers racing a close are expected to lose quietly. Called from an
    /// observer, the value is stored at once but delivered after the current
    /// notification round finishes.
    pub fn set(&self, value: T) -> bool {
        let _emission = self.shared.emission.lock();
        if self.is_closed() {
            tracing::trace!("ignoring set on a closed observable value");
            return false;
        }

        let value = Arc::new(value);
        self.shared.value.store(Arc::clone(&value));
        self.emit(Emission::Next(value));
        true
    }

    /// Edits a copy of the current value in place, stores it and notifies.
    ///
    /// Returns `None` when the container is closed.
    pub fn update<R>(&self, edit: impl FnOnce(&mut T) -> R) -> Option<R>
    where
        T: Clone,
    {
        let _emission = self.shared.emission.lock();
        if self.is_closed() {
            tracing::trace!("ignoring update on a closed observable value");
            return None;
        }

        let mut next = T::clone(&self.shared.value.load());
        let output = edit(&mut next);
        let next = Arc::new(next);
        self.shared.value.store(Arc::clone(&next));
        self.emit(Emission::Next(next));
        Some(output)
    }

    /// Marks the container terminal. Only the first call notifies.
    pub fn close(&self) -> bool {
        let _emission = self.shared.emission.lock();
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let last = self.shared.value.load_full();
        self.emit(Emission::Closed(last));
        true
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn observer_count(&self) -> usize {
        self.shared.observers.lock().len()
    }

    /// Registers `observer` and immediately hands it the current value.
    ///
    /// On a closed container the observer receives a single `Closed` and is
    /// not retained.
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(Change<'_, T>) + Send + Sync + 'static,
    {
        let _emission = self.shared.emission.lock();
        let current = self.shared.value.load_full();
        if self.is_closed() {
            observer(Change::Closed(&*current));
            return Subscription::inert();
        }

        let id = self.shared.next_observer_id.fetch_add(1, Ordering::Relaxed);
        let observer: Observer<T> = Arc::new(observer);
        self.shared.observers.lock().push(ObserverSlot {
            id,
            since: self.shared.version.load(Ordering::Acquire),
            observer: Arc::clone(&observer),
        });
        observer(Change::Next(&*current));

        let shared = Arc::downgrade(&self.shared);
        let registry: Weak<dyn ObserverRegistry> = shared;
        Subscription {
            registry: Some(registry),
            id,
        }
    }

    /// Resolves with the first value, current or future, that satisfies
    /// `predicate`, or with the last value if the container closes first.
    pub async fn wait_for<P>(&self, predicate: P) -> T
    where
        T: Clone,
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let (found_tx, found_rx) = oneshot::channel();
        let found_tx = Mutex::new(Some(found_tx));
        let _subscription = self.subscribe(move |change| {
            if (change.is_closed() || predicate(change.value()))
                && let Some(found_tx) = found_tx.lock().take()
            {
                let _ = found_tx.send(change.value().clone());
            }
        });

        found_rx.await.unwrap_or_else(|_| self.get())
    }

    // Callers hold the emission lock.
    fn emit(&self, emission: Emission<T>) {
        let version = self.shared.version.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.pending.lock().push_back((version, emission));
        if self.shared.emitting.swap(true, Ordering::AcqRel) {
            return;
        }

        let _round = EmittingGuard(&self.shared.emitting);
        loop {
            let next = self.shared.pending.lock().pop_front();
            let Some((version, emission)) = next else {
                break;
            };
            self.deliver(version, &emission);
        }
    }

    fn deliver(&self, version: u64, emission: &Emission<T>) {
        // Snapshot the list so observers can (un)subscribe while being notified.
        let observers = self
            .shared
            .observers
            .lock()
            .iter()
            .filter(|slot| slot.since < version)
            .map(|slot| Arc::clone(&slot.observer))
            .collect::<Vec<_>>();

        let change = match emission {
            Emission::Next(value) => Change::Next(&**value),
            Emission::Closed(value) => Change::Closed(&**value),
        };
        for observer in observers {
            observer(change);
        }
        if change.is_closed() {
            self.shared.observers.lock().clear();
        }
    }
}

struct EmittingGuard<'a>(&'a AtomicBool);

impl Drop for EmittingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

trait ObserverRegistry: Send + Sync {
    fn remove_observer(&self, id: u64);
}

impl<T> ObserverRegistry for Shared<T>
where
    T: Send + Sync,
{
    fn remove_observer(&self, id: u64) {
        self.observers.lock().retain(|slot| slot.id != id);
    }
}

/// Handle returned by [`ObservableValue::subscribe`].
///
/// Dropping the handle unsubscribes; call [`Subscription::detach`] to keep the
/// observer for as long as the value lives.
#[must_use = "dropping a subscription unsubscribes the observer"]
pub struct Subscription {
    registry: Option<Weak<dyn ObserverRegistry>>,
    id: u64,
}

impl Subscription {
    fn inert() -> Self {
        Self {
            registry: None,
            id: 0,
        }
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    pub fn detach(mut self) {
        self.registry = None;
    }

    fn release(&mut self) {
        if let Some(registry) = self.registry.take().and_then(|registry| registry.upgrade()) {
            registry.remove_observer(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.registry.is_some())
            .finish()
    }
}
