//! Freshet runtime: the worker/combiner pipeline that keeps continuous
//! views incrementally maintained, plus the adhoc path for one-shot
//! continuous queries.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]

/// One-shot continuous queries streamed to a client
pub mod adhoc;
/// The combiner receiver: merges partial results into matrels
pub mod combiner;
/// The engine facade tying catalogs, queues and tasks together
pub mod engine;
/// Plan execution over microbatches, matrels and view reads
pub mod executor;
/// Ordinary host tables joined against streams
pub mod host_tables;
/// Materialization relations with hashed group indexes
pub mod matrel;
/// Bounded batches pulled from the ring buffer
pub mod microbatch;
/// One-shot user SELECTs over continuous views
pub mod query;
/// Per-process and per-view counters
pub mod stats;
/// Stream insert path and tuple projection
pub mod stream;
/// Sliding-window bookkeeping and vacuum
pub mod sw;
/// The worker loop
pub mod worker;

pub use engine::{Engine, EngineOptions};
