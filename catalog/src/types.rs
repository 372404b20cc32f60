use freshet_common::tuple::TupleDesc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Stable identifier of a continuous query.
pub type QueryId = u32;
/// Identifier of a relation (stream, matrel, output stream, index, sequence).
pub type RelId = u32;

/// What the worker's output feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContAction {
    /// Partial results are combined into a matrel.
    Materialize,
    /// User rows go to the output function / output stream, no matrel.
    Transform,
    /// Rows are accepted and discarded.
    Dumped,
}

/// One continuous query, as persisted. Immutable after creation except for
/// administrative renames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContQueryRow {
    pub id: QueryId,
    pub name: String,
    /// Relation carrying the defining SQL.
    pub defrel: RelId,
    /// The original SELECT, verbatim.
    pub query: String,
    pub matrel: RelId,
    pub matrel_name: String,
    pub osrel: RelId,
    pub osrel_name: String,
    pub seqrel: RelId,
    pub pk_index: RelId,
    pub lookup_index: RelId,
    /// Worker SELECT over the stream, derived at definition time.
    pub worker_sql: String,
    /// Combiner SELECT over the matrel.
    pub combiner_sql: String,
    /// Overlay SELECT presenting finalized results.
    pub overlay_sql: String,
    /// Matrel tuple shape: group columns first, then transition states.
    pub matrel_desc: TupleDesc,
    /// Matrel attribute numbers forming the group key.
    pub group_cols: Vec<usize>,
    /// 0 when not sliding, else percent of window width per bucket (1..=50).
    pub sw_step_factor: u8,
    /// Matrel attribute of the truncated window column; None if not sliding.
    pub sw_attno: Option<usize>,
    /// Sliding-window width in microseconds.
    pub sw_interval_us: Option<i64>,
    /// Row time-to-live for non-sliding GC, if requested.
    pub ttl_us: Option<i64>,
    pub ttl_attno: Option<usize>,
    pub action: ContAction,
    /// Transform output function reference, when action is Transform.
    pub output_func: Option<String>,
    /// Whether expired rows are garbage collected.
    pub gc: bool,
    pub active: bool,
}

impl ContQueryRow {
    pub fn is_sliding_window(&self) -> bool {
        self.sw_attno.is_some()
    }
}

/// A stream relation: a declared tuple shape whose rows are never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRow {
    pub relid: RelId,
    pub name: String,
    /// Declared shape, persisted as a serialized blob on this row.
    pub desc: TupleDesc,
    /// Continuous queries reading from this stream.
    pub readers: BTreeSet<QueryId>,
    /// True for the per-CV `(old, new)` delta stream.
    pub is_output: bool,
}

/// One explicit combine-aggregate mapping: the four-function signature of a
/// worker aggregate and the combine aggregate that merges its states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombineRow {
    pub combinefn: String,
    pub finalfn: String,
    pub serializefn: String,
    pub deserializefn: String,
    /// Name of the combine aggregate in the function registry.
    pub combine_agg: String,
}
