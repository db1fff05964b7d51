//! Transaction-aware cursors and index scans for an embedded graph store.
//!
//! A [`Kernel`] owns committed storage, the lock table and a cursor pool.
//! Each [`KernelTransaction`] reads through cursors that merge committed
//! records with the transaction's own uncommitted changes, honour the active
//! [`AccessMode`](storage::security::AccessMode), and can be split into
//! partitions for parallel scans.
//!
//! ```
//! use std::sync::Arc;
//! use sombra_cursor::storage::cursor::Cursor;
//! use sombra_cursor::storage::security::AllowAll;
//! use sombra_cursor::types::LabelId;
//! use sombra_cursor::{CursorOptions, Kernel};
//!
//! let kernel = Kernel::new(CursorOptions::default());
//! kernel.store().create_node(&[LabelId(1)]).unwrap();
//! let tx = kernel.begin(Arc::new(AllowAll));
//! tx.write().node_create(&[LabelId(1)]).unwrap();
//!
//! let mut nodes = tx.acquire_node_cursor();
//! tx.read().all_nodes_scan(&mut nodes);
//! let mut seen = 0;
//! while nodes.next().unwrap() {
//!     seen += 1;
//! }
//! assert_eq!(seen, 2);
//! drop(nodes);
//! tx.close().unwrap();
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod kernel;
pub mod logging;
pub mod primitives;
pub mod storage;
pub mod types;

pub use kernel::{Kernel, KernelTransaction, Read, Write};
pub use logging::init_logging;
pub use storage::options::CursorOptions;
pub use types::{Result, SombraError};
