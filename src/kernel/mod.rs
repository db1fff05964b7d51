//! Transactions over the cursor engine.
//!
//! A [`Kernel`] owns the committed store, the lock table and a cursor pool
//! shared by every transaction. Each [`KernelTransaction`] carries its own
//! transaction state, lock client and leak tracker; reads go through
//! [`Read`], tentative writes through [`Write`].

mod locking;
mod read;
mod write;

pub use locking::{verify_detach, DetachSnapshot, DetachVerdict};
pub use read::Read;
pub use write::Write;

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::primitives::concurrency::{LockClient, LockManager, ManagedLockClient};
use crate::storage::cursor::{
    CursorPool, EdgeScanCursor, EdgeTraversalCursor, EdgeTypeIndexCursor, EdgeValueIndexCursor,
    LeakTracker, NodeCursor, NodeLabelIndexCursor, NodeValueIndexCursor, PropertyCursor, Pooled,
    ReadContext,
};
use crate::storage::metrics::{default_metrics, CursorMetrics};
use crate::storage::options::CursorOptions;
use crate::storage::security::AccessMode;
use crate::storage::store::GraphStore;
use crate::storage::txstate::TxState;
use crate::types::{Result, SombraError};

/// Shared engine state: committed store, locks, pooled cursors.
pub struct Kernel {
    store: Arc<GraphStore>,
    locks: LockManager,
    pool: CursorPool,
    metrics: Arc<dyn CursorMetrics>,
    options: CursorOptions,
}

impl Kernel {
    /// Creates a kernel over an empty store.
    pub fn new(options: CursorOptions) -> Self {
        let metrics = options.metrics.clone().unwrap_or_else(default_metrics);
        let store = Arc::new(GraphStore::new(&options));
        let pool = CursorPool::new(options.pool_capacity, Arc::clone(&metrics));
        debug!(?options, "kernel.open");
        Self {
            store,
            locks: LockManager::new(),
            pool,
            metrics,
            options,
        }
    }

    /// Committed store.
    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    /// Lock table.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Cursor pool shared by all transactions.
    pub fn pool(&self) -> &CursorPool {
        &self.pool
    }

    /// Metrics sink.
    pub fn metrics(&self) -> &Arc<dyn CursorMetrics> {
        &self.metrics
    }

    /// Options the kernel was opened with.
    pub fn options(&self) -> &CursorOptions {
        &self.options
    }

    /// Starts a transaction reading under `access`.
    pub fn begin(&self, access: Arc<dyn AccessMode>) -> KernelTransaction {
        self.open(access, false)
    }

    /// Starts a read-only transaction for a parallel execution context.
    ///
    /// Locking lookups and writes are rejected in such a transaction.
    pub fn begin_parallel(&self, access: Arc<dyn AccessMode>) -> KernelTransaction {
        self.open(access, true)
    }

    fn open(&self, access: Arc<dyn AccessMode>, parallel: bool) -> KernelTransaction {
        let leaks = LeakTracker::new(
            self.options.track_cursor_close,
            self.options.trace_cursor_close_stacks,
        );
        let ctx = ReadContext::new(
            Arc::clone(&self.store),
            Arc::new(RwLock::new(TxState::new())),
            access,
            Arc::clone(&self.metrics),
            leaks,
        );
        let locks = self.locks.client();
        debug!(client = locks.id(), parallel, "kernel.begin");
        KernelTransaction {
            ctx,
            locks,
            pool: self.pool.clone(),
            parallel,
            closed: false,
        }
    }
}

/// One transaction: its state, locks and cursor bookkeeping.
pub struct KernelTransaction {
    ctx: ReadContext,
    locks: ManagedLockClient,
    pool: CursorPool,
    parallel: bool,
    closed: bool,
}

impl KernelTransaction {
    /// Read operations.
    pub fn read(&self) -> Read<'_> {
        Read::new(self)
    }

    /// Write operations recorded in transaction state.
    pub fn write(&self) -> Write<'_> {
        Write::new(self)
    }

    /// Read context handed to cursors.
    pub fn context(&self) -> &ReadContext {
        &self.ctx
    }

    /// Lock client of this transaction.
    pub fn locks(&self) -> &dyn LockClient {
        &self.locks
    }

    /// Whether the transaction runs in a parallel execution context.
    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// Whether the transaction has uncommitted changes.
    pub fn has_changes(&self) -> bool {
        self.ctx.tx.read().has_changes()
    }

    /// Cursor pool.
    pub fn pool(&self) -> &CursorPool {
        &self.pool
    }

    /// Pooled node cursor.
    pub fn acquire_node_cursor(&self) -> Pooled<NodeCursor> {
        self.pool.acquire()
    }

    /// Pooled edge scan cursor.
    pub fn acquire_edge_scan_cursor(&self) -> Pooled<EdgeScanCursor> {
        self.pool.acquire()
    }

    /// Pooled edge traversal cursor.
    pub fn acquire_traversal_cursor(&self) -> Pooled<EdgeTraversalCursor> {
        self.pool.acquire()
    }

    /// Pooled property cursor.
    pub fn acquire_property_cursor(&self) -> Pooled<PropertyCursor> {
        self.pool.acquire()
    }

    /// Pooled label scan cursor.
    pub fn acquire_label_index_cursor(&self) -> Pooled<NodeLabelIndexCursor> {
        self.pool.acquire()
    }

    /// Pooled edge type scan cursor.
    pub fn acquire_type_index_cursor(&self) -> Pooled<EdgeTypeIndexCursor> {
        self.pool.acquire()
    }

    /// Pooled node value index cursor.
    pub fn acquire_node_value_index_cursor(&self) -> Pooled<NodeValueIndexCursor> {
        self.pool.acquire()
    }

    /// Pooled edge value index cursor.
    pub fn acquire_edge_value_index_cursor(&self) -> Pooled<EdgeValueIndexCursor> {
        self.pool.acquire()
    }

    pub(crate) fn require_serial(&self, what: &'static str) -> Result<()> {
        if self.parallel {
            return Err(SombraError::Unsupported(what));
        }
        Ok(())
    }

    /// Ends the transaction, discarding its changes and releasing its locks.
    ///
    /// Fails with a usage error if a tracked cursor was never closed; every
    /// leaked cursor is logged with its allocation context when captured.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        let leaks = self.ctx.leaks.drain();
        self.locks.release_all();
        if leaks.is_empty() {
            debug!(client = self.locks.id(), "kernel.close");
            return Ok(());
        }
        for leak in &leaks {
            error!(
                kind = leak.kind,
                stack = leak.stack.as_deref().unwrap_or("<not captured>"),
                "cursor left open at transaction end"
            );
        }
        Err(SombraError::Usage("transaction closed with open cursors"))
    }
}

impl Drop for KernelTransaction {
    fn drop(&mut self) {
        if !self.closed {
            warn!(client = self.locks.id(), "transaction dropped without close");
            self.locks.release_all();
        }
    }
}
