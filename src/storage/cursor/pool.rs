use std::any::{Any, TypeId};
use std::backtrace::Backtrace;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::storage::metrics::CursorMetrics;

use super::Cursor;

struct OpenCursor {
    kind: &'static str,
    stack: Option<Backtrace>,
}

struct LeakRegistry {
    next_id: AtomicU64,
    open: Mutex<FxHashMap<u64, OpenCursor>>,
    capture_stacks: bool,
}

/// Tracks cursors that were initialized but not yet closed.
///
/// Disabled trackers cost one branch per initialization.
#[derive(Clone, Default)]
pub struct LeakTracker {
    registry: Option<Arc<LeakRegistry>>,
}

/// One cursor still open when its transaction ended.
#[derive(Debug)]
pub struct LeakReport {
    /// Cursor kind.
    pub kind: &'static str,
    /// Where the cursor was opened, when stack capture is enabled.
    pub stack: Option<String>,
}

/// Registration of one open cursor; releasing it marks the cursor closed.
pub(crate) struct LeakToken {
    registry: Arc<LeakRegistry>,
    id: u64,
}

impl LeakToken {
    pub(crate) fn release(self) {
        self.registry.open.lock().remove(&self.id);
    }
}

impl LeakTracker {
    /// Creates a tracker; `capture_stacks` records a backtrace per open cursor.
    pub fn new(enabled: bool, capture_stacks: bool) -> Self {
        if !enabled {
            return Self::disabled();
        }
        Self {
            registry: Some(Arc::new(LeakRegistry {
                next_id: AtomicU64::new(1),
                open: Mutex::new(FxHashMap::default()),
                capture_stacks,
            })),
        }
    }

    /// Tracker that records nothing.
    pub fn disabled() -> Self {
        Self { registry: None }
    }

    /// Whether cursors are tracked.
    pub fn is_enabled(&self) -> bool {
        self.registry.is_some()
    }

    pub(crate) fn register(&self, kind: &'static str) -> Option<LeakToken> {
        let registry = self.registry.as_ref()?;
        let id = registry.next_id.fetch_add(1, Ordering::Relaxed);
        let stack = registry
            .capture_stacks
            .then(Backtrace::force_capture);
        registry.open.lock().insert(id, OpenCursor { kind, stack });
        Some(LeakToken {
            registry: Arc::clone(registry),
            id,
        })
    }

    /// Number of cursors currently open.
    pub fn outstanding(&self) -> usize {
        self.registry
            .as_ref()
            .map(|registry| registry.open.lock().len())
            .unwrap_or(0)
    }

    /// Removes and returns every open cursor.
    pub fn drain(&self) -> Vec<LeakReport> {
        let registry = match &self.registry {
            Some(registry) => registry,
            None => return Vec::new(),
        };
        let mut open: Vec<(u64, OpenCursor)> = registry.open.lock().drain().collect();
        open.sort_by_key(|(id, _)| *id);
        open.into_iter()
            .map(|(_, cursor)| LeakReport {
                kind: cursor.kind,
                stack: cursor.stack.map(|stack| stack.to_string()),
            })
            .collect()
    }
}

impl fmt::Debug for LeakTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeakTracker")
            .field("enabled", &self.is_enabled())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Cursor type a [`CursorPool`] can hand out.
pub trait Poolable: Cursor + Default + Send + 'static {}

impl<C: Cursor + Default + Send + 'static> Poolable for C {}

struct PoolShared {
    free: Mutex<FxHashMap<TypeId, Vec<Box<dyn Any + Send>>>>,
    capacity: usize,
    metrics: Arc<dyn CursorMetrics>,
}

impl PoolShared {
    fn give_back<C: Poolable>(&self, cursor: C) {
        self.metrics.cursor_released();
        let mut free = self.free.lock();
        let list = free.entry(TypeId::of::<C>()).or_default();
        if list.len() < self.capacity {
            list.push(Box::new(cursor));
        }
    }
}

/// Free lists of closed cursors, one list per cursor type.
#[derive(Clone)]
pub struct CursorPool {
    shared: Arc<PoolShared>,
}

impl CursorPool {
    /// Creates a pool retaining at most `capacity` idle cursors per type.
    pub fn new(capacity: usize, metrics: Arc<dyn CursorMetrics>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(FxHashMap::default()),
                capacity,
                metrics,
            }),
        }
    }

    /// Hands out an idle cursor, which is closed, or a new unpositioned one.
    pub fn acquire<C: Poolable>(&self) -> Pooled<C> {
        let reused = self
            .shared
            .free
            .lock()
            .get_mut(&TypeId::of::<C>())
            .and_then(|list| list.pop())
            .and_then(|boxed| boxed.downcast::<C>().ok());
        self.shared.metrics.cursor_acquired(reused.is_some());
        trace!(
            cursor = std::any::type_name::<C>(),
            reused = reused.is_some(),
            "cursor_pool.acquire"
        );
        Pooled {
            cursor: Some(reused.map(|boxed| *boxed).unwrap_or_default()),
            pool: Arc::clone(&self.shared),
        }
    }

    /// Idle cursors of type `C`.
    pub fn idle<C: Poolable>(&self) -> usize {
        self.shared
            .free
            .lock()
            .get(&TypeId::of::<C>())
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Drops every idle cursor.
    pub fn clear(&self) {
        self.shared.free.lock().clear();
    }
}

impl fmt::Debug for CursorPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorPool")
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

/// Cursor on loan from a [`CursorPool`]; closed and returned when dropped.
pub struct Pooled<C: Poolable> {
    cursor: Option<C>,
    pool: Arc<PoolShared>,
}

impl<C: Poolable> Pooled<C> {
    /// Closes the cursor and returns it to its pool now.
    pub fn release(self) {}
}

impl<C: Poolable> Deref for Pooled<C> {
    type Target = C;

    fn deref(&self) -> &C {
        // Only `Drop` empties the slot.
        match &self.cursor {
            Some(cursor) => cursor,
            None => unreachable!("pooled cursor used after release"),
        }
    }
}

impl<C: Poolable> DerefMut for Pooled<C> {
    fn deref_mut(&mut self) -> &mut C {
        match &mut self.cursor {
            Some(cursor) => cursor,
            None => unreachable!("pooled cursor used after release"),
        }
    }
}

impl<C: Poolable> Drop for Pooled<C> {
    fn drop(&mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            cursor.close();
            self.pool.give_back(cursor);
        }
    }
}
