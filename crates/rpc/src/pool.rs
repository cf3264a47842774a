//! Reusable message instances.
//!
//! Each message type gets a bounded lock-free free-list. Instances handed out
//! by the pool carry an in-use flag; recycling anything without it (an
//! instance the application built itself, or one already returned) is a
//! silent no-op.

use crate::message::{AnyMessage, Message, MessageTag};
use crate::schema::TypeInfo;

use crossbeam::queue::ArrayQueue;
use dashmap::DashMap;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Configuration for message pooling.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Free-list capacity for types without an override.
    pub default_capacity: usize,
    /// Per-type capacity overrides, keyed by tag.
    pub capacities: HashMap<MessageTag, usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_capacity: 200,
            capacities: HashMap::new(),
        }
    }
}

impl PoolConfig {
    /// Set the capacity used for types without an override.
    #[must_use]
    pub const fn default_capacity(mut self, capacity: usize) -> Self {
        self.default_capacity = capacity;
        self
    }

    /// Override the capacity for one type. Zero disables pooling for it.
    #[must_use]
    pub fn capacity_for<T: Message>(mut self, capacity: usize) -> Self {
        self.capacities.insert(T::TAG, capacity);
        self
    }

    fn capacity(&self, tag: MessageTag) -> usize {
        self.capacities
            .get(tag)
            .copied()
            .unwrap_or(self.default_capacity)
    }
}

/// A message instance, possibly owned by a [`Pool`].
pub struct Pooled<T: ?Sized> {
    value: Box<T>,
    in_use: bool,
}

impl<T: Message> Pooled<T> {
    /// Wrap an instance built outside the pool. Recycling it is a no-op.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            value: Box::new(value),
            in_use: false,
        }
    }

    /// Take the value out, leaving the pool out of it.
    #[must_use]
    pub fn into_inner(self) -> T {
        *self.value
    }

    /// Forget the concrete type.
    #[must_use]
    pub fn erase(self) -> Pooled<dyn AnyMessage> {
        Pooled {
            value: self.value,
            in_use: self.in_use,
        }
    }
}

impl Pooled<dyn AnyMessage> {
    /// Whether the erased instance is a `T`.
    #[must_use]
    pub fn is<T: Message>(&self) -> bool {
        self.value.message_type_id() == TypeId::of::<T>()
    }

    /// Recover the concrete type.
    ///
    /// Returns `None` (dropping the instance) if it is not a `T`; check with
    /// [`is`](Self::is) first when the instance must survive.
    #[must_use]
    pub fn downcast<T: Message>(self) -> Option<Pooled<T>> {
        let in_use = self.in_use;
        self.value
            .into_any()
            .downcast::<T>()
            .ok()
            .map(|value| Pooled { value, in_use })
    }
}

impl<T: ?Sized> Pooled<T> {
    /// Whether this instance is checked out of a pool.
    #[must_use]
    pub const fn is_pooled(&self) -> bool {
        self.in_use
    }
}

impl<T: Message> From<T> for Pooled<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

/// Anything a session can send: a plain message or a pooled one.
pub trait IntoPooled {
    /// The concrete message type.
    type Message: Message;

    /// Convert into a pooled handle.
    fn into_pooled(self) -> Pooled<Self::Message>;
}

impl<T: Message> IntoPooled for T {
    type Message = T;

    fn into_pooled(self) -> Pooled<T> {
        Pooled::new(self)
    }
}

impl<T: Message> IntoPooled for Pooled<T> {
    type Message = T;

    fn into_pooled(self) -> Self {
        self
    }
}

impl<T: ?Sized> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: ?Sized> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("value", &self.value)
            .field("in_use", &self.in_use)
            .finish()
    }
}

/// Counters describing pool behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Instances constructed because the free-list was empty.
    pub created: u64,
    /// Instances handed out from a free-list.
    pub reused: u64,
    /// Recycled instances dropped because the free-list was full.
    pub dropped: u64,
}

type FreeList = Arc<ArrayQueue<Box<dyn AnyMessage>>>;

/// Per-type free-lists of message instances.
pub struct Pool {
    config: PoolConfig,
    free: DashMap<TypeId, FreeList>,
    created: AtomicU64,
    reused: AtomicU64,
    dropped: AtomicU64,
}

impl Pool {
    /// Create an empty pool.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            free: DashMap::new(),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Check out an instance of `T`, reusing a recycled one if available.
    #[must_use]
    pub fn allocate<T: Message>(&self) -> Pooled<T> {
        let recycled = self
            .free_list(TypeId::of::<T>(), T::TAG)
            .and_then(|list| list.pop())
            .and_then(|value| value.into_any().downcast::<T>().ok());

        let value = if let Some(value) = recycled {
            self.reused.fetch_add(1, Ordering::Relaxed);
            value
        } else {
            self.created.fetch_add(1, Ordering::Relaxed);
            Box::new(T::default())
        };

        Pooled {
            value,
            in_use: true,
        }
    }

    /// Check out an instance of the type described by `info`.
    #[must_use]
    pub fn allocate_erased(&self, info: &TypeInfo) -> Pooled<dyn AnyMessage> {
        let value = if let Some(value) = self
            .free_list(info.type_id(), info.tag())
            .and_then(|list| list.pop())
        {
            self.reused.fetch_add(1, Ordering::Relaxed);
            value
        } else {
            self.created.fetch_add(1, Ordering::Relaxed);
            info.instantiate()
        };

        Pooled {
            value,
            in_use: true,
        }
    }

    /// Return an instance to its free-list.
    ///
    /// No-op unless the instance is checked out of a pool. The instance is
    /// reset to defaults and dropped instead if the free-list is full.
    pub fn recycle(&self, mut message: Pooled<dyn AnyMessage>) {
        if !message.in_use {
            return;
        }
        message.in_use = false;
        message.value.reset();

        let type_id = message.value.message_type_id();
        let tag = message.value.tag();
        match self.free_list(type_id, tag) {
            Some(list) => {
                if list.push(message.value).is_err() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Typed convenience for [`recycle`](Self::recycle).
    pub fn recycle_typed<T: Message>(&self, message: Pooled<T>) {
        self.recycle(message.erase());
    }

    /// Number of instances of `T` waiting in the free-list.
    #[must_use]
    pub fn available<T: Message>(&self) -> usize {
        self.free
            .get(&TypeId::of::<T>())
            .map_or(0, |list| list.len())
    }

    /// Snapshot of the pool counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn free_list(&self, type_id: TypeId, tag: MessageTag) -> Option<FreeList> {
        if let Some(list) = self.free.get(&type_id) {
            return Some(Arc::clone(&list));
        }
        let capacity = self.config.capacity(tag);
        if capacity == 0 {
            return None;
        }
        let list = self
            .free
            .entry(type_id)
            .or_insert_with(|| Arc::new(ArrayQueue::new(capacity)));
        Some(Arc::clone(&list))
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("types", &self.free.len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
