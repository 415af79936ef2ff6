//! Generic typed pool

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Reuse pool for values of a single type.
///
/// Entries are created lazily by the factory on a miss and then cycle between
/// "in use" and "idle" for as long as the pool lives.
pub struct Pool<T> {
    idle: Mutex<Vec<T>>,
    create: Factory<T>,
    max_idle: usize,
    created: AtomicU64,
}

impl<T: Send> Pool<T> {
    /// Create a pool whose misses are filled by `create`
    pub fn new<F>(create: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            idle: Mutex::new(Vec::new()),
            create: Box::new(create),
            max_idle: crate::DEFAULT_MAX_IDLE,
            created: AtomicU64::new(0),
        }
    }

    /// Cap the number of idle entries kept around (extra releases are dropped)
    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Take a value out of the pool, creating one if none is idle
    pub fn acquire(&self) -> T {
        if let Some(value) = self.lock().pop() {
            return value;
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        (self.create)()
    }

    /// Hand a value back. The caller gives up ownership, so it cannot be read
    /// or released again afterwards.
    pub fn release(&self, value: T) {
        let mut idle = self.lock();
        if idle.len() < self.max_idle {
            idle.push(value);
        }
    }

    /// Acquire a value wrapped in a guard that releases it on drop
    pub fn get(self: &Arc<Self>) -> Pooled<T> {
        Pooled {
            value: Some(self.acquire()),
            pool: Arc::clone(self),
        }
    }

    /// Number of idle entries currently held
    pub fn idle(&self) -> usize {
        self.lock().len()
    }

    /// Number of entries the factory has produced so far
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        // The idle list holds no invariant a panicking holder could break
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Default + Send + 'static> Default for Pool<T> {
    fn default() -> Self {
        Self::new(T::default)
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("max_idle", &self.max_idle)
            .field("created", &self.created.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A pooled value that goes back to its pool when dropped
pub struct Pooled<T: Send> {
    value: Option<T>,
    pool: Arc<Pool<T>>,
}

impl<T: Send> Pooled<T> {
    /// Detach the value from the guard. It will not be returned to the pool
    /// unless the caller releases it explicitly.
    pub fn into_inner(mut self) -> T {
        match self.value.take() {
            Some(value) => value,
            None => unreachable!("pooled value taken twice"),
        }
    }
}

impl<T: Send> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.value {
            Some(value) => value,
            None => unreachable!("pooled value read after release"),
        }
    }
}

impl<T: Send> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(value) => value,
            None => unreachable!("pooled value read after release"),
        }
    }
}

impl<T: Send> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.release(value);
        }
    }
}

impl<T: Send + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.value).finish()
    }
}
