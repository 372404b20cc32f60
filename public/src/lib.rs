//! Freshet turns standing SQL SELECTs over unbounded streams into
//! incrementally maintained materialized views.
//!
//! # Very high level architecture
//!
//! ```text
//! INSERT INTO stream ──▶ ring buffer ──▶ worker (partial aggregation)
//!                                            │ hashed by group
//!                                            ▼
//!                 combiner (merge transition states) ──▶ matrel
//!                                                          │
//!                  SELECT * FROM view  ◀── overlay (finalize on read)
//! ```
//!
//! Register a continuous view once; every row appended to the stream it
//! reads is folded into the view's result without re-running the query.

pub use chrono;
pub use tokio;

/// Combinable aggregate implementations and the streaming-aggregate protocol
pub use freshet_aggregate as aggregate;
/// Continuous view and stream metadata
pub use freshet_catalog as catalog;
/// Shared datum model
pub use freshet_common as common;
/// The ring buffer connecting producers to workers
pub use freshet_cqueue as cqueue;
/// Workers, combiners, sliding windows, adhoc queries
pub use freshet_runtime as runtime;
/// Analysis, rewriting and planning of continuous queries
pub use freshet_sql as sql;

pub mod prelude {
    pub use crate::common::settings::Settings;
    pub use crate::common::time::{Clock, ManualClock, SystemClock};
    pub use crate::common::tuple::{Column, Row, TupleDesc};
    pub use crate::common::value::{DataType, Value};
    pub use crate::runtime::engine::{Engine, EngineOptions, QueryResult};
}
