//! Freshet sql: turns a user's continuous-view SELECT into the worker,
//! combiner and overlay queries the runtime executes.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]

/// Validation of a SELECT as a legal continuous view body
pub mod analyze;
/// Resolution of user-facing combine() aggregates
pub mod combine;
/// Analysis/rewrite error kinds
pub mod error;
/// Expression evaluation over parsed SQL
pub mod expr;
/// WITH-option handling and sliding-window application
pub mod options;
/// Compilation of rewritten SELECTs into executable plans
pub mod plan;
/// Worker/combiner/overlay query generation
pub mod rewrite;
/// Parse-tree helpers shared by the analyzer and rewriter
pub mod util;
