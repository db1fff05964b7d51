use std::sync::Arc;

use serde::Deserialize;

use crate::types::{Result, SombraError};

/// Number of edges at which a node's edge chain is split into per-type groups.
pub const DEFAULT_DENSE_NODE_THRESHOLD: usize = 50;
/// Number of record slots per in-memory page.
pub const DEFAULT_RECORDS_PER_PAGE: usize = 128;
/// Idle cursors kept per kind by a [`super::cursor::CursorPool`].
pub const DEFAULT_POOL_CAPACITY: usize = 16;

/// Configuration consumed by the cursor engine and its in-memory store.
#[derive(Clone)]
pub struct CursorOptions {
    /// Whether cursors opened in a transaction are tracked and checked at close.
    pub track_cursor_close: bool,
    /// Whether the tracker captures a backtrace when each cursor is opened.
    pub trace_cursor_close_stacks: bool,
    /// Maximum idle cursors retained per kind.
    pub pool_capacity: usize,
    /// Edge count at which a node switches to grouped edge chains.
    pub dense_node_threshold: usize,
    /// Record slots per page in the record files.
    pub records_per_page: usize,
    /// Optional metrics collection implementation.
    pub metrics: Option<Arc<dyn super::metrics::CursorMetrics>>,
}

impl Default for CursorOptions {
    fn default() -> Self {
        Self {
            track_cursor_close: cfg!(debug_assertions),
            trace_cursor_close_stacks: false,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            dense_node_threshold: DEFAULT_DENSE_NODE_THRESHOLD,
            records_per_page: DEFAULT_RECORDS_PER_PAGE,
            metrics: None,
        }
    }
}

impl std::fmt::Debug for CursorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorOptions")
            .field("track_cursor_close", &self.track_cursor_close)
            .field("trace_cursor_close_stacks", &self.trace_cursor_close_stacks)
            .field("pool_capacity", &self.pool_capacity)
            .field("dense_node_threshold", &self.dense_node_threshold)
            .field("records_per_page", &self.records_per_page)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl CursorOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables tracking of unclosed cursors.
    pub fn track_cursor_close(mut self, enabled: bool) -> Self {
        self.track_cursor_close = enabled;
        self
    }

    /// Enables or disables backtrace capture for tracked cursors.
    pub fn trace_cursor_close_stacks(mut self, enabled: bool) -> Self {
        self.trace_cursor_close_stacks = enabled;
        self
    }

    /// Sets the number of idle cursors pooled per kind.
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Sets the dense node threshold.
    pub fn dense_node_threshold(mut self, edges: usize) -> Self {
        self.dense_node_threshold = edges.max(1);
        self
    }

    /// Sets the number of record slots per page.
    pub fn records_per_page(mut self, slots: usize) -> Self {
        self.records_per_page = slots.max(1);
        self
    }

    /// Sets the metrics collection implementation.
    pub fn metrics(mut self, metrics: Arc<dyn super::metrics::CursorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Parses options from the `[cursors]` table of a TOML document.
    ///
    /// Missing keys keep their defaults; a missing table yields the defaults.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(src)
            .map_err(|_| SombraError::Invalid("malformed cursor configuration"))?;
        let mut opts = Self::default();
        if let Some(section) = raw.cursors {
            if let Some(v) = section.track_cursor_close {
                opts.track_cursor_close = v;
            }
            if let Some(v) = section.trace_cursor_close_stacks {
                opts.trace_cursor_close_stacks = v;
            }
            if let Some(v) = section.pool_capacity {
                opts.pool_capacity = v;
            }
            if let Some(v) = section.dense_node_threshold {
                opts = opts.dense_node_threshold(v);
            }
            if let Some(v) = section.records_per_page {
                opts = opts.records_per_page(v);
            }
        }
        Ok(opts)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    cursors: Option<RawCursorSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCursorSection {
    track_cursor_close: Option<bool>,
    trace_cursor_close_stacks: Option<bool>,
    pool_capacity: Option<usize>,
    dense_node_threshold: Option<usize>,
    records_per_page: Option<usize>,
}
