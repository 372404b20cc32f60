//! Freshet catalog: persisted continuous-view and stream metadata, plus the
//! per-process cache that keeps lookups off the hot path.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]

/// Keyed lookup cache with relation-level invalidation
pub mod cache;
/// Derived relation naming for matrels, output streams and indexes
pub mod naming;
/// The catalog store standing in for host catalog storage
pub mod store;
/// Catalog row types
pub mod types;
