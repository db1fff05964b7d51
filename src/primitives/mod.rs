//! Low-level primitives shared by the cursor engine.

/// Resource lock service.
///
/// Shared/exclusive locks keyed by resource type and id, used by the
/// read-then-verify helpers.
pub mod concurrency;
