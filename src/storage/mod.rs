//! Read-side storage engine: committed record store, transaction overlay and
//! the cursors that merge the two.
//!
//! Cursors read the committed [`store::GraphStore`] and fold in the changes
//! recorded in a [`txstate::TxState`], filtered by the active
//! [`security::AccessMode`].

/// Transaction-aware cursors and the pool that recycles them.
///
/// Node, edge, traversal, property, token index and value index cursors, the
/// ordered merge joins, and partitioned and batched scans.
pub mod cursor;

/// Token and value indexes and the progressor chain feeding index cursors.
pub mod index;

/// Counters describing cursor and lock activity.
pub mod metrics;

/// Tunables of the cursor engine.
pub mod options;

/// Access modes consulted while reading.
pub mod security;

/// Committed record files and their low-level cursors.
pub mod store;

/// Uncommitted changes of one transaction.
pub mod txstate;

pub use cursor::{Cursor, CursorPool, Pooled, ReadContext};
pub use metrics::{CounterMetrics, CursorMetrics, MetricsSnapshot};
pub use options::CursorOptions;
pub use security::{AccessMode, AllowAll, RestrictedAccess};
pub use store::GraphStore;
pub use txstate::TxState;
