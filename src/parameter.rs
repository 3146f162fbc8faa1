//! Value<T> - reactive scan parameter
//!
//! A thread-safe value with optional bounds, a read-only gate and two ordered
//! subscriber sets. It is the one lock in the system shared across thread
//! boundaries: the GUI writes geometry fields while an acquisition thread reads
//! them to rebuild a scanner vector.
//!
//! # Notification
//!
//! ```text
//! caller thread: value.set(v)
//!         │
//!         ▼
//! ┌───────────────────────────────────────────────┐
//! │ 1. Reject reentrant set from a subscriber     │
//! │ 2. Reject if read-only                        │
//! │ 3. Reject if outside [min, max]               │
//! └───────────────────────────────────────────────┘
//!         │ (fails here, value unchanged)
//!         ▼
//! ┌───────────────────────────────────────────────┐
//! │ 4. Store v, publish to watch receivers        │
//! │ 5. Call value subscribers (old, new) in order │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Subscribers run synchronously on the calling thread. A GUI that needs the
//! change on its own thread either redispatches from the callback or holds a
//! [`Value::watch`] receiver.
//!
//! # Example
//!
//! ```rust
//! use scan_daq::parameter::Value;
//!
//! let zoom = Value::new("zoom", 1.0).with_range(1.0, 50.0).with_units("x");
//! let _id = zoom.subscribe(|old: &f64, new: &f64| {
//!     tracing::info!(old, new, "zoom changed");
//! });
//! zoom.set(2.0).unwrap();
//! assert!(zoom.set(100.0).is_err());
//! assert_eq!(zoom.get(), 2.0);
//! ```

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::error::{AppResult, DaqError};

/// Receives `(old, new)` after every successful `set`.
///
/// Implemented by GUI bindings and acquisition code alike; closures taking
/// `(&T, &T)` implement it automatically.
pub trait Subscriber<T>: Send + Sync {
    /// Called on the setting thread after the value has been stored.
    fn on_value_changed(&self, old: &T, new: &T);
}

impl<T, F> Subscriber<T> for F
where
    F: Fn(&T, &T) + Send + Sync,
{
    fn on_value_changed(&self, old: &T, new: &T) {
        self(old, new)
    }
}

/// Receives the new read-only flag after `set_read_only` changes it.
pub trait ReadOnlySubscriber: Send + Sync {
    /// Called on the toggling thread.
    fn on_read_only_changed(&self, read_only: bool);
}

impl<F> ReadOnlySubscriber for F
where
    F: Fn(bool) + Send + Sync,
{
    fn on_read_only_changed(&self, read_only: bool) {
        self(read_only)
    }
}

/// Handle returned by `subscribe*`, used to detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

impl SubscriptionId {
    fn next() -> Self {
        Self(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed))
    }
}

/// Descriptive metadata for GUI labels and persisted config keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueMetadata {
    /// Parameter name (unique within its aggregate)
    pub name: String,
    /// Physical units (e.g. "µs", "deg")
    pub units: Option<String>,
    /// Human-readable description for tooltips
    pub description: Option<String>,
}

struct Slot<T> {
    value: T,
    read_only: bool,
    bounds: Option<(T, T)>,
}

type ValueSubscribers<T> = Vec<(SubscriptionId, Arc<dyn Subscriber<T>>)>;
type ReadOnlySubscribers = Vec<(SubscriptionId, Arc<dyn ReadOnlySubscriber>)>;

/// Thread-safe bounded value with change notification.
///
/// Cloning a `Value` is not supported; share it through the owning aggregate
/// (e.g. `Arc<ScanGeometry>`).
pub struct Value<T>
where
    T: Clone + PartialOrd + Debug + Send + Sync + 'static,
{
    metadata: ValueMetadata,
    slot: RwLock<Slot<T>>,
    /// Serialises writers so notifications are delivered in store order.
    writer: Mutex<()>,
    /// Thread currently running subscribers, for reentrancy detection.
    notifying: Mutex<Option<ThreadId>>,
    subscribers: RwLock<ValueSubscribers<T>>,
    read_only_subscribers: RwLock<ReadOnlySubscribers>,
    watch_tx: watch::Sender<T>,
}

impl<T> Debug for Value<T>
where
    T: Clone + PartialOrd + Debug + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.read();
        f.debug_struct("Value")
            .field("name", &self.metadata.name)
            .field("value", &slot.value)
            .field("bounds", &slot.bounds)
            .field("read_only", &slot.read_only)
            .finish_non_exhaustive()
    }
}

impl<T> Value<T>
where
    T: Clone + PartialOrd + Debug + Send + Sync + 'static,
{
    /// Create an unbounded, writable value.
    pub fn new(name: impl Into<String>, initial: T) -> Self {
        let (watch_tx, _) = watch::channel(initial.clone());
        Self {
            metadata: ValueMetadata {
                name: name.into(),
                ..Default::default()
            },
            slot: RwLock::new(Slot {
                value: initial,
                read_only: false,
                bounds: None,
            }),
            writer: Mutex::new(()),
            notifying: Mutex::new(None),
            subscribers: RwLock::new(Vec::new()),
            read_only_subscribers: RwLock::new(Vec::new()),
            watch_tx,
        }
    }

    /// Set the inclusive `[min, max]` bounds.
    pub fn with_range(self, min: T, max: T) -> Self {
        self.slot.write().bounds = Some((min, max));
        self
    }

    /// Set the physical units.
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.metadata.units = Some(units.into());
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = Some(description.into());
        self
    }

    /// Parameter name.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Full metadata.
    pub fn metadata(&self) -> &ValueMetadata {
        &self.metadata
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.slot.read().value.clone()
    }

    /// Current bounds, if any.
    pub fn bounds(&self) -> Option<(T, T)> {
        self.slot.read().bounds.clone()
    }

    /// Whether `set` is currently rejected.
    pub fn is_read_only(&self) -> bool {
        self.slot.read().read_only
    }

    /// True if `value` lies inside the configured bounds (or none are set).
    pub fn accepts(&self, value: &T) -> bool {
        match &self.slot.read().bounds {
            Some((min, max)) => min <= value && value <= max,
            None => true,
        }
    }

    /// Store `value` and notify subscribers with `(old, new)`.
    ///
    /// # Errors
    ///
    /// - [`DaqError::Reentrant`] when called from one of this value's own subscribers
    /// - [`DaqError::ReadOnly`] when the read-only gate is set
    /// - [`DaqError::OutOfRange`] when bounds are configured and violated
    pub fn set(&self, value: T) -> AppResult<()> {
        self.check_reentrancy()?;
        let _writer = self.writer.lock();

        let old = {
            let mut slot = self.slot.write();
            if slot.read_only {
                return Err(DaqError::ReadOnly {
                    name: self.metadata.name.clone(),
                });
            }
            if let Some((min, max)) = &slot.bounds {
                if !(min <= &value && &value <= max) {
                    return Err(DaqError::OutOfRange {
                        name: self.metadata.name.clone(),
                        value: format!("{:?}", value),
                        min: format!("{:?}", min),
                        max: format!("{:?}", max),
                    });
                }
            }
            std::mem::replace(&mut slot.value, value.clone())
        };

        self.watch_tx.send_replace(value.clone());

        let subscribers: Vec<_> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();
        let _guard = NotifyGuard::enter(&self.notifying);
        for subscriber in subscribers {
            subscriber.on_value_changed(&old, &value);
        }
        Ok(())
    }

    /// Toggle the read-only gate, notifying read-only subscribers on change.
    ///
    /// # Errors
    ///
    /// [`DaqError::Reentrant`] when called from one of this value's own subscribers.
    pub fn set_read_only(&self, read_only: bool) -> AppResult<()> {
        self.check_reentrancy()?;
        let _writer = self.writer.lock();
        let changed = {
            let mut slot = self.slot.write();
            let changed = slot.read_only != read_only;
            slot.read_only = read_only;
            changed
        };
        if !changed {
            return Ok(());
        }

        let subscribers: Vec<_> = self
            .read_only_subscribers
            .read()
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();
        for subscriber in subscribers {
            subscriber.on_read_only_changed(read_only);
        }
        Ok(())
    }

    /// Attach a value subscriber. Subscribers are called in attach order.
    pub fn subscribe(&self, subscriber: impl Subscriber<T> + 'static) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.subscribers.write().push((id, Arc::new(subscriber)));
        id
    }

    /// Attach a read-only-flag subscriber.
    pub fn subscribe_read_only(
        &self,
        subscriber: impl ReadOnlySubscriber + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.read_only_subscribers
            .write()
            .push((id, Arc::new(subscriber)));
        id
    }

    /// Detach a subscriber from either set. Returns false if the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        self.subscribers.write().retain(|(sid, _)| {
            let keep = *sid != id;
            removed |= !keep;
            keep
        });
        self.read_only_subscribers.write().retain(|(sid, _)| {
            let keep = *sid != id;
            removed |= !keep;
            keep
        });
        removed
    }

    /// Number of attached value and read-only subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len() + self.read_only_subscribers.read().len()
    }

    /// Watch receiver updated after each successful `set`.
    pub fn watch(&self) -> watch::Receiver<T> {
        self.watch_tx.subscribe()
    }

    fn check_reentrancy(&self) -> AppResult<()> {
        if *self.notifying.lock() == Some(thread::current().id()) {
            return Err(DaqError::Reentrant {
                name: self.metadata.name.clone(),
            });
        }
        Ok(())
    }
}

/// Marks the current thread as notifying for the lifetime of the guard.
struct NotifyGuard<'a> {
    cell: &'a Mutex<Option<ThreadId>>,
}

impl<'a> NotifyGuard<'a> {
    fn enter(cell: &'a Mutex<Option<ThreadId>>) -> Self {
        *cell.lock() = Some(thread::current().id());
        Self { cell }
    }
}

impl Drop for NotifyGuard<'_> {
    fn drop(&mut self) {
        *self.cell.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_set_within_bounds() {
        let p = Value::new("res_x", 256u32).with_range(1, 4096);
        p.set(512).unwrap();
        assert_eq!(p.get(), 512);
        p.set(1).unwrap();
        p.set(4096).unwrap();
        assert_eq!(p.get(), 4096);
    }

    #[test]
    fn test_set_out_of_range_keeps_value() {
        let p = Value::new("retrace", 0.1).with_range(0.0, 1.0);
        let err = p.set(1.5).unwrap_err();
        assert!(matches!(err, DaqError::OutOfRange { .. }));
        assert_eq!(p.get(), 0.1);
        assert!(matches!(p.set(f64::NAN), Err(DaqError::OutOfRange { .. })));
    }

    #[test]
    fn test_read_only_gate() {
        let p = Value::new("zoom", 1.0);
        let flips = Arc::new(AtomicUsize::new(0));
        let f = flips.clone();
        p.subscribe_read_only(move |_ro: bool| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        p.set_read_only(true).unwrap();
        p.set_read_only(true).unwrap(); // unchanged, no notification
        assert!(matches!(p.set(2.0), Err(DaqError::ReadOnly { .. })));
        p.set_read_only(false).unwrap();
        p.set(2.0).unwrap();
        assert_eq!(flips.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_subscribers_called_in_order_with_old_and_new() {
        let p = Value::new("rotation", 0.0);
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = log.clone();
        p.subscribe(move |old: &f64, new: &f64| a.lock().push(("a", *old, *new)));
        let b = log.clone();
        p.subscribe(move |old: &f64, new: &f64| b.lock().push(("b", *old, *new)));

        p.set(45.0).unwrap();
        assert_eq!(*log.lock(), vec![("a", 0.0, 45.0), ("b", 0.0, 45.0)]);
    }

    #[test]
    fn test_reentrant_set_is_rejected() {
        let p = Arc::new(Value::new("offset_x", 0.5).with_range(0.0, 1.0));
        let inner = Arc::downgrade(&p);
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        p.subscribe(move |_old: &f64, _new: &f64| {
            if let Some(p) = inner.upgrade() {
                *s.lock() = Some(p.set(0.2).is_err());
            }
        });

        p.set(0.7).unwrap();
        assert_eq!(*seen.lock(), Some(true));
        assert_eq!(p.get(), 0.7);
    }

    #[test]
    fn test_reentrant_set_read_only_is_rejected() {
        let p = Arc::new(Value::new("zoom", 1.0));
        let inner = Arc::downgrade(&p);
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        p.subscribe(move |_old: &f64, _new: &f64| {
            if let Some(p) = inner.upgrade() {
                *s.lock() = Some(p.set_read_only(true));
            }
        });

        p.set(2.0).unwrap();
        assert!(matches!(
            seen.lock().take(),
            Some(Err(DaqError::Reentrant { .. }))
        ));
        assert!(!p.is_read_only());
    }

    #[test]
    fn test_unsubscribe_detaches() {
        let p = Value::new("zoom", 1.0);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = p.subscribe(move |_: &f64, _: &f64| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        p.set(2.0).unwrap();
        assert!(p.unsubscribe(id));
        assert!(!p.unsubscribe(id));
        p.set(3.0).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(p.subscriber_count(), 0);
    }

    #[test]
    fn test_watch_receives_latest() {
        let p = Value::new("mode", "sawtooth".to_string());
        let rx = p.watch();
        p.set("bidirectional".to_string()).unwrap();
        assert_eq!(*rx.borrow(), "bidirectional");
    }
}
