use crate::basic::{Avg, Count, Extremum, Sum};
use crate::collect::{ArrayAgg, HllCountDistinct, JsonAgg, JsonObjectAgg, SetAgg, StringAgg};
use crate::ordered::{HypotheticalKind, HypotheticalSet, PercentileCont};
use crate::state::AggState;
use freshet_common::value::{DataType, Value};
use freshet_common::wire::{decode_cbor, encode_cbor};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("aggregate \"{0}\" does not exist")]
    Unknown(String),
    #[error("wrong number of arguments for aggregate \"{agg}\": {detail}")]
    BadArgs { agg: &'static str, detail: String },
    #[error("transition state mismatch in aggregate \"{0}\"")]
    StateMismatch(&'static str),
    #[error("could not deserialize transition state for \"{agg}\": {detail}")]
    BadState { agg: &'static str, detail: String },
}

pub type Result<T> = std::result::Result<T, AggregateError>;

/// A streaming aggregate: a transition function building a mergeable state,
/// an associative combine over two states, and a finalize mapping the state
/// to the user-visible value.
pub trait Aggregate: Send + Sync {
    fn name(&self) -> &'static str;

    /// The matrel column type holding the state: `Internal` states are
    /// stored serialized, everything else in its natural type.
    fn state_type(&self) -> DataType;

    fn init(&self) -> AggState;

    fn transition(&self, state: &mut AggState, args: &[Value]) -> Result<()>;

    fn combine(&self, state: &mut AggState, other: &AggState) -> Result<()>;

    fn finalize(&self, state: &AggState) -> Result<Value>;

    /// Explicit marker for the user-facing `combine(...)` dummy.
    fn is_combine(&self) -> bool {
        false
    }

    fn combinefn(&self) -> String {
        format!("{}_combine", self.name())
    }

    fn finalfn(&self) -> String {
        format!("{}_final", self.name())
    }

    fn serializefn(&self) -> String {
        if self.state_type() == DataType::Internal {
            format!("{}_serialize", self.name())
        } else {
            String::new()
        }
    }

    fn deserializefn(&self) -> String {
        if self.state_type() == DataType::Internal {
            format!("{}_deserialize", self.name())
        } else {
            String::new()
        }
    }

    /// Maps a state to its matrel datum.
    fn state_to_datum(&self, state: &AggState) -> Result<Value> {
        if self.state_type() == DataType::Internal {
            let bytes = encode_cbor(state).map_err(|e| AggregateError::BadState {
                agg: self.name(),
                detail: e.to_string(),
            })?;
            Ok(Value::Bytes(bytes))
        } else {
            self.natural_datum(state)
        }
    }

    /// Maps a matrel datum back to a state.
    fn datum_to_state(&self, datum: &Value) -> Result<AggState> {
        if self.state_type() == DataType::Internal {
            match datum {
                Value::Bytes(bytes) => decode_cbor(bytes).map_err(|e| AggregateError::BadState {
                    agg: self.name(),
                    detail: e.to_string(),
                }),
                Value::Null => Ok(self.init()),
                other => Err(AggregateError::BadState {
                    agg: self.name(),
                    detail: format!("expected bytea state, got {other:?}"),
                }),
            }
        } else {
            self.natural_state(datum)
        }
    }

    /// Natural-type datum representation; only meaningful for non-internal
    /// states.
    fn natural_datum(&self, state: &AggState) -> Result<Value> {
        self.finalize(state)
    }

    /// Inverse of `natural_datum`.
    fn natural_state(&self, datum: &Value) -> Result<AggState> {
        let _ = datum;
        Err(AggregateError::StateMismatch(self.name()))
    }
}

lazy_static! {
    /// Every aggregate callable from a continuous view, keyed by name.
    pub static ref AGGREGATES: HashMap<&'static str, Arc<dyn Aggregate>> = {
        let entries: Vec<Arc<dyn Aggregate>> = vec![
            Arc::new(Count),
            Arc::new(Sum),
            Arc::new(Avg),
            Arc::new(Extremum::min()),
            Arc::new(Extremum::max()),
            Arc::new(ArrayAgg),
            Arc::new(SetAgg),
            Arc::new(HllCountDistinct),
            Arc::new(StringAgg),
            Arc::new(JsonAgg::json()),
            Arc::new(JsonAgg::jsonb()),
            Arc::new(JsonObjectAgg::json()),
            Arc::new(JsonObjectAgg::jsonb()),
            Arc::new(HypotheticalSet::new(HypotheticalKind::Rank)),
            Arc::new(HypotheticalSet::new(HypotheticalKind::DenseRank)),
            Arc::new(HypotheticalSet::new(HypotheticalKind::PercentRank)),
            Arc::new(HypotheticalSet::new(HypotheticalKind::CumeDist)),
            Arc::new(PercentileCont),
            Arc::new(CombineDummy),
        ];
        entries.into_iter().map(|a| (a.name(), a)).collect()
    };
}

/// Case-insensitive registry lookup.
pub fn lookup(name: &str) -> Option<Arc<dyn Aggregate>> {
    let lowered = name.to_ascii_lowercase();
    AGGREGATES.get(lowered.as_str()).cloned()
}

/// Finds the aggregate whose four-function signature matches, the fallback
/// the combine-aggregate resolver uses when the catalog has no explicit
/// mapping.
pub fn lookup_combine_target(
    combinefn: &str,
    finalfn: &str,
    serializefn: &str,
    deserializefn: &str,
) -> Option<Arc<dyn Aggregate>> {
    AGGREGATES
        .values()
        .find(|a| {
            !a.is_combine()
                && a.combinefn() == combinefn
                && a.finalfn() == finalfn
                && a.serializefn() == serializefn
                && a.deserializefn() == deserializefn
        })
        .cloned()
}

/// The user-facing `combine(...)` pseudo-aggregate. It never executes; the
/// resolver rewrites references to it into the underlying aggregate's
/// combine before planning.
struct CombineDummy;

impl Aggregate for CombineDummy {
    fn name(&self) -> &'static str {
        "combine"
    }

    fn state_type(&self) -> DataType {
        DataType::Internal
    }

    fn is_combine(&self) -> bool {
        true
    }

    fn init(&self) -> AggState {
        AggState::Count(0)
    }

    fn transition(&self, _state: &mut AggState, _args: &[Value]) -> Result<()> {
        Err(AggregateError::BadArgs {
            agg: "combine",
            detail: "combine() must reference a continuous view aggregate".to_owned(),
        })
    }

    fn combine(&self, _state: &mut AggState, _other: &AggState) -> Result<()> {
        Err(AggregateError::StateMismatch("combine"))
    }

    fn finalize(&self, _state: &AggState) -> Result<Value> {
        Err(AggregateError::StateMismatch("combine"))
    }
}
