use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A typed key into a session's attribute store.
///
/// Keys are scoped, normally by the name of the filter that owns them, so two
/// filters can use the same attribute name without colliding. The key also
/// carries the value type: looking up a key only ever yields values stored
/// under that exact key and type.
///
/// ```rust
/// use sluice::AttributeKey;
///
/// static PENDING: AttributeKey<u32> = AttributeKey::new("retransmit", "pending");
/// assert_eq!(PENDING.name(), "pending");
/// ```
pub struct AttributeKey<T> {
    scope: &'static str,
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttributeKey<T> {
    /// Creates a key named `name` inside `scope`.
    pub const fn new(scope: &'static str, name: &'static str) -> Self {
        Self {
            scope,
            name,
            _marker: PhantomData,
        }
    }

    /// The key's scope.
    pub fn scope(&self) -> &'static str {
        self.scope
    }

    /// The key's name within its scope.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T: 'static> AttributeKey<T> {
    fn slot(&self) -> Slot {
        Slot {
            scope: self.scope,
            name: self.name,
            type_id: TypeId::of::<T>(),
        }
    }
}

impl<T> fmt::Debug for AttributeKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttributeKey({}::{})", self.scope, self.name)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct Slot {
    scope: &'static str,
    name: &'static str,
    type_id: TypeId,
}

/// Per-session attribute store.
#[derive(Default)]
pub struct AttributeMap {
    values: Mutex<HashMap<Slot, Box<dyn Any + Send + Sync>>>,
}

impl AttributeMap {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Slot, Box<dyn Any + Send + Sync>>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `value`, returning the previous value under `key`.
    pub fn insert<T: Any + Send + Sync>(&self, key: &AttributeKey<T>, value: T) -> Option<T> {
        self.lock()
            .insert(key.slot(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    /// Returns a clone of the value under `key`.
    pub fn get<T: Any + Send + Sync + Clone>(&self, key: &AttributeKey<T>) -> Option<T> {
        self.lock()
            .get(&key.slot())
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Returns the value under `key`, storing `init()` first if absent.
    pub fn get_or_insert_with<T, F>(&self, key: &AttributeKey<T>, init: F) -> T
    where
        T: Any + Send + Sync + Clone,
        F: FnOnce() -> T,
    {
        let mut values = self.lock();
        let value = values
            .entry(key.slot())
            .or_insert_with(|| Box::new(init()));
        match value.downcast_ref::<T>() {
            Some(v) => v.clone(),
            // slot includes the TypeId, so the stored value is always a T
            None => unreachable!("attribute slot holds a foreign type"),
        }
    }

    /// Runs `f` with mutable access to the value under `key`, if present.
    ///
    /// The store is locked for the duration of `f`; do not touch the same
    /// session's attributes from inside it.
    pub fn with<T, R, F>(&self, key: &AttributeKey<T>, f: F) -> Option<R>
    where
        T: Any + Send + Sync,
        F: FnOnce(&mut T) -> R,
    {
        self.lock()
            .get_mut(&key.slot())
            .and_then(|v| v.downcast_mut::<T>())
            .map(f)
    }

    /// Removes and returns the value under `key`.
    pub fn remove<T: Any + Send + Sync>(&self, key: &AttributeKey<T>) -> Option<T> {
        self.lock()
            .remove(&key.slot())
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    /// Returns `true` if a value is stored under `key`.
    pub fn contains<T: Any + Send + Sync>(&self, key: &AttributeKey<T>) -> bool {
        self.lock().contains_key(&key.slot())
    }

    /// Number of stored attributes.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl fmt::Debug for AttributeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = self.lock();
        f.debug_list()
            .entries(values.keys().map(|slot| format!("{}::{}", slot.scope, slot.name)))
            .finish()
    }
}
