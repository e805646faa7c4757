//! Bindings for reading externally-owned mutable stores without tearing.
//!
//! The engine does not own these stores; it only sees an opaque payload, a
//! version getter, a snapshot selector, and a subscription hook. The tear
//! detection protocol itself lives on the engine, which tracks the versions
//! observed during a render pass.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::EffectCleanup;
use crate::value::{downcast, value, StateValue};

/// Unique identity of a mutable source binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

/// A store's logical version. Must change whenever the store's value does;
/// it is never compared across different sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceVersion(pub u64);

/// Reads the current version from a source payload.
pub type GetVersion = Arc<dyn Fn(&StateValue) -> SourceVersion + Send + Sync>;

/// Selects a snapshot value from a source payload.
pub type SnapshotFn =
    Arc<dyn Fn(&StateValue) -> Result<StateValue, anyhow::Error> + Send + Sync>;

/// Invoked by a store whenever its value changes.
pub type ChangeHandler = Arc<dyn Fn() + Send + Sync>;

/// Registers a change handler with a store; returns the unsubscribe cleanup.
pub type SubscribeFn = Arc<dyn Fn(&MutableSource, ChangeHandler) -> EffectCleanup + Send + Sync>;

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// An externally mutated store the engine can read snapshots from.
///
/// Clone is cheap; clones share identity, and identity is what the hook uses
/// to decide whether a binding changed between renders.
#[derive(Clone)]
pub struct MutableSource {
    id: SourceId,
    payload: StateValue,
    get_version: GetVersion,
}

impl MutableSource {
    /// Bind a payload and its version getter into a source.
    pub fn new(payload: StateValue, get_version: GetVersion) -> Self {
        Self {
            id: SourceId(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed)),
            payload,
            get_version,
        }
    }

    /// The binding's identity.
    pub fn id(&self) -> SourceId {
        self.id
    }

    /// The opaque store payload handed to snapshot selectors.
    pub fn payload(&self) -> &StateValue {
        &self.payload
    }

    /// The store's current version.
    pub fn version(&self) -> SourceVersion {
        (self.get_version)(&self.payload)
    }
}

struct StoreInner<T> {
    val: Mutex<T>,
    version: AtomicU64,
    next_sub: AtomicU64,
    subscribers: Mutex<Vec<(u64, ChangeHandler)>>,
}

/// A ready-made versioned store for tests and simple integrations.
///
/// Every [`set`](VersionedStore::set) bumps the version and notifies
/// subscribers synchronously.
pub struct VersionedStore<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Clone for VersionedStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> VersionedStore<T> {
    /// Create a store holding `initial` at version 0.
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                val: Mutex::new(initial),
                version: AtomicU64::new(0),
                next_sub: AtomicU64::new(0),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Read the current value.
    pub fn get(&self) -> T {
        self.inner.val.lock().clone()
    }

    /// Replace the value, bump the version, and notify subscribers.
    pub fn set(&self, v: T) {
        *self.inner.val.lock() = v;
        self.inner.version.fetch_add(1, Ordering::Relaxed);
        let handlers: Vec<ChangeHandler> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler();
        }
    }

    /// The store's current version.
    pub fn version(&self) -> SourceVersion {
        SourceVersion(self.inner.version.load(Ordering::Relaxed))
    }

    fn subscribe(&self, handler: ChangeHandler) -> EffectCleanup {
        let id = self.inner.next_sub.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push((id, handler));
        let inner = self.inner.clone();
        Arc::new(move || {
            inner.subscribers.lock().retain(|(sub, _)| *sub != id);
        })
    }

    /// Number of live subscriptions, for tests.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Wrap this store into a [`MutableSource`] binding.
    pub fn as_source(&self) -> MutableSource {
        MutableSource::new(
            value(self.clone()),
            Arc::new(|payload| match downcast::<VersionedStore<T>>(payload) {
                Some(store) => store.version(),
                None => SourceVersion(0),
            }),
        )
    }

    /// A snapshot selector reading the store's current value.
    pub fn snapshot_fn(&self) -> SnapshotFn {
        Arc::new(|payload| {
            let store = downcast::<VersionedStore<T>>(payload)
                .ok_or_else(|| anyhow::anyhow!("snapshot selector bound to another store type"))?;
            Ok(value(store.get()))
        })
    }

    /// A subscription hook registering with the store's notifier list.
    pub fn subscribe_fn(&self) -> SubscribeFn {
        Arc::new(|source, handler| {
            match downcast::<VersionedStore<T>>(source.payload()) {
                Some(store) => store.subscribe(handler),
                // A mismatched payload has nothing to unsubscribe from.
                None => Arc::new(|| {}),
            }
        })
    }
}

/// The snapshot state and binding identities a mutable-source hook carries
/// across renders.
#[derive(Clone)]
pub(crate) struct SourceBinding {
    pub source: MutableSource,
    pub get_snapshot: SnapshotFn,
    pub subscribe: SubscribeFn,
    /// Store version the snapshot state cell was last synchronized at.
    pub version: SourceVersion,
}

impl SourceBinding {
    /// True when the source, selector, or subscription identity changed,
    /// which invalidates the previous pending-update queue.
    pub fn inputs_changed(&self, source: &MutableSource, get_snapshot: &SnapshotFn, subscribe: &SubscribeFn) -> bool {
        self.source.id() != source.id()
            || !Arc::ptr_eq(&self.get_snapshot, get_snapshot)
            || !Arc::ptr_eq(&self.subscribe, subscribe)
    }
}
