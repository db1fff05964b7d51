//! Shared/exclusive resource locks keyed by `(ResourceType, id)`.
//!
//! Callers acquire ids in ascending order; this module does not detect deadlocks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::trace;

use crate::types::{Result, SombraError};

/// Lockable resource namespaces.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum ResourceType {
    /// Node records.
    Node,
    /// Edge records.
    Edge,
    /// Hashed `(token, exact values)` entries of a unique index.
    IndexEntry,
    /// Label tokens.
    Label,
    /// Edge type tokens.
    EdgeType,
}

/// Acquire/release interface a transaction uses to take resource locks.
///
/// Locks are reentrant within one client: every acquire must be matched by a
/// release of the same mode.
pub trait LockClient: Send + Sync {
    /// Acquires shared locks on `ids`, blocking while another client holds an
    /// exclusive lock on any of them.
    fn acquire_shared(&self, resource: ResourceType, ids: &[u64]) -> Result<()>;
    /// Acquires exclusive locks on `ids`, blocking while any other client holds
    /// a lock on any of them.
    fn acquire_exclusive(&self, resource: ResourceType, ids: &[u64]) -> Result<()>;
    /// Releases one shared hold on each of `ids`.
    fn release_shared(&self, resource: ResourceType, ids: &[u64]) -> Result<()>;
    /// Releases one exclusive hold on each of `ids`.
    fn release_exclusive(&self, resource: ResourceType, ids: &[u64]) -> Result<()>;
    /// Returns true if this client holds a shared lock on `id`.
    fn holds_shared(&self, resource: ResourceType, id: u64) -> bool;
    /// Returns true if this client holds an exclusive lock on `id`.
    fn holds_exclusive(&self, resource: ResourceType, id: u64) -> bool;
}

type ClientId = u64;
type LockKey = (ResourceType, u64);

#[derive(Default, Debug)]
struct LockEntry {
    shared: SmallVec<[(ClientId, u32); 4]>,
    exclusive: Option<(ClientId, u32)>,
}

impl LockEntry {
    fn is_free(&self) -> bool {
        self.shared.is_empty() && self.exclusive.is_none()
    }

    fn shared_count(&self, client: ClientId) -> u32 {
        self.shared
            .iter()
            .find(|(owner, _)| *owner == client)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    fn blocks_shared(&self, client: ClientId) -> bool {
        matches!(self.exclusive, Some((owner, _)) if owner != client)
    }

    fn blocks_exclusive(&self, client: ClientId) -> bool {
        self.blocks_shared(client) || self.shared.iter().any(|(owner, _)| *owner != client)
    }
}

struct Inner {
    table: Mutex<FxHashMap<LockKey, LockEntry>>,
    released: Condvar,
    next_client: AtomicU64,
    waits: AtomicU64,
}

/// Process-wide lock table handing out per-transaction [`ManagedLockClient`]s.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<Inner>,
}

/// Snapshot of lock table state for observability.
#[derive(Default, Debug, Clone, Copy)]
pub struct LockSnapshot {
    /// Number of resources with at least one holder.
    pub locked_resources: usize,
    /// Total number of times an acquire had to wait.
    pub waits: u64,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(FxHashMap::default()),
                released: Condvar::new(),
                next_client: AtomicU64::new(1),
                waits: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a new client. Locks still held when the client drops are released.
    pub fn client(&self) -> ManagedLockClient {
        ManagedLockClient {
            inner: Arc::clone(&self.inner),
            id: self.inner.next_client.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Returns a snapshot of the lock table.
    pub fn snapshot(&self) -> LockSnapshot {
        let table = self.inner.table.lock();
        LockSnapshot {
            locked_resources: table.len(),
            waits: self.inner.waits.load(Ordering::Relaxed),
        }
    }
}

/// Lock client bound to one [`LockManager`].
pub struct ManagedLockClient {
    inner: Arc<Inner>,
    id: ClientId,
}

impl ManagedLockClient {
    /// Identifier of this client within its manager.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Releases every lock held by this client.
    pub fn release_all(&self) {
        let mut table = self.inner.table.lock();
        table.retain(|_, entry| {
            entry.shared.retain(|(owner, _)| *owner != self.id);
            if matches!(entry.exclusive, Some((owner, _)) if owner == self.id) {
                entry.exclusive = None;
            }
            !entry.is_free()
        });
        drop(table);
        self.inner.released.notify_all();
    }

    fn acquire(&self, resource: ResourceType, ids: &[u64], exclusive: bool) -> Result<()> {
        debug_assert!(
            ids.windows(2).all(|pair| pair[0] <= pair[1]),
            "lock ids must be sorted"
        );
        let mut table = self.inner.table.lock();
        for &id in ids {
            let key = (resource, id);
            loop {
                let entry = table.entry(key).or_default();
                let blocked = if exclusive {
                    entry.blocks_exclusive(self.id)
                } else {
                    entry.blocks_shared(self.id)
                };
                if !blocked {
                    if exclusive {
                        match entry.exclusive.as_mut() {
                            Some((_, count)) => *count += 1,
                            None => entry.exclusive = Some((self.id, 1)),
                        }
                    } else if let Some(slot) =
                        entry.shared.iter_mut().find(|(owner, _)| *owner == self.id)
                    {
                        slot.1 += 1;
                    } else {
                        entry.shared.push((self.id, 1));
                    }
                    break;
                }
                self.inner.waits.fetch_add(1, Ordering::Relaxed);
                trace!(client = self.id, ?resource, id, exclusive, "lock wait");
                self.inner.released.wait(&mut table);
            }
        }
        Ok(())
    }

    fn release(&self, resource: ResourceType, ids: &[u64], exclusive: bool) -> Result<()> {
        let mut table = self.inner.table.lock();
        for &id in ids {
            let key = (resource, id);
            let entry = table
                .get_mut(&key)
                .ok_or(SombraError::Usage("releasing a lock that is not held"))?;
            if exclusive {
                match entry.exclusive.as_mut() {
                    Some((owner, count)) if *owner == self.id => {
                        *count -= 1;
                        if *count == 0 {
                            entry.exclusive = None;
                        }
                    }
                    _ => return Err(SombraError::Usage("exclusive lock not held by client")),
                }
            } else {
                let pos = entry
                    .shared
                    .iter()
                    .position(|(owner, _)| *owner == self.id)
                    .ok_or(SombraError::Usage("shared lock not held by client"))?;
                entry.shared[pos].1 -= 1;
                if entry.shared[pos].1 == 0 {
                    entry.shared.swap_remove(pos);
                }
            }
            if entry.is_free() {
                table.remove(&key);
            }
        }
        drop(table);
        self.inner.released.notify_all();
        Ok(())
    }
}

impl LockClient for ManagedLockClient {
    fn acquire_shared(&self, resource: ResourceType, ids: &[u64]) -> Result<()> {
        self.acquire(resource, ids, false)
    }

    fn acquire_exclusive(&self, resource: ResourceType, ids: &[u64]) -> Result<()> {
        self.acquire(resource, ids, true)
    }

    fn release_shared(&self, resource: ResourceType, ids: &[u64]) -> Result<()> {
        self.release(resource, ids, false)
    }

    fn release_exclusive(&self, resource: ResourceType, ids: &[u64]) -> Result<()> {
        self.release(resource, ids, true)
    }

    fn holds_shared(&self, resource: ResourceType, id: u64) -> bool {
        let table = self.inner.table.lock();
        table
            .get(&(resource, id))
            .map(|entry| entry.shared_count(self.id) > 0)
            .unwrap_or(false)
    }

    fn holds_exclusive(&self, resource: ResourceType, id: u64) -> bool {
        let table = self.inner.table.lock();
        matches!(
            table.get(&(resource, id)).and_then(|entry| entry.exclusive),
            Some((owner, _)) if owner == self.id
        )
    }
}

impl Drop for ManagedLockClient {
    fn drop(&mut self) {
        self.release_all();
    }
}
