use crate::hll::Hll;
use freshet_common::value::Value;
use serde::{Deserialize, Serialize};

/// A numeric accumulator that stays integral until a float contributes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NumericSum {
    Empty,
    Int(i64),
    Float(f64),
}

impl NumericSum {
    pub fn add_int(&mut self, i: i64) {
        *self = match *self {
            NumericSum::Empty => NumericSum::Int(i),
            NumericSum::Int(acc) => NumericSum::Int(acc.wrapping_add(i)),
            NumericSum::Float(acc) => NumericSum::Float(acc + i as f64),
        };
    }

    pub fn add_float(&mut self, f: f64) {
        *self = match *self {
            NumericSum::Empty => NumericSum::Float(f),
            NumericSum::Int(acc) => NumericSum::Float(acc as f64 + f),
            NumericSum::Float(acc) => NumericSum::Float(acc + f),
        };
    }

    pub fn merge(&mut self, other: &NumericSum) {
        match other {
            NumericSum::Empty => {}
            NumericSum::Int(i) => self.add_int(*i),
            NumericSum::Float(f) => self.add_float(*f),
        }
    }

    pub fn to_value(self) -> Value {
        match self {
            NumericSum::Empty => Value::Null,
            NumericSum::Int(i) => Value::Int(i),
            NumericSum::Float(f) => Value::Float(f),
        }
    }
}

/// The mergeable transition state of one aggregate over some subset of its
/// input. Internal-typed states travel serialized; the rest are stored in
/// their natural column type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggState {
    Count(i64),
    Sum(NumericSum),
    Avg { sum: NumericSum, count: i64 },
    Extreme(Option<Value>),
    Collect(Vec<Value>),
    StringAgg { parts: Vec<String>, delim: Option<String> },
    JsonAgg(Vec<serde_json::Value>),
    JsonObjectAgg(Vec<(String, serde_json::Value)>),
    Hll(Hll),
    Hypothetical(HypotheticalState),
    Percentile(PercentileState),
}

/// Counters a hypothetical-set aggregate maintains against its constant
/// hypothetical arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HypotheticalState {
    /// The hypothetical row, captured from the direct arguments.
    pub hypothetical: Vec<Value>,
    /// Rows ordering strictly before the hypothetical row.
    pub less: i64,
    /// Rows ordering before or equal.
    pub less_eq: i64,
    /// Distinct sort keys ordering strictly before, for dense_rank.
    pub distinct_less: Vec<Vec<Value>>,
    pub total: i64,
}

/// Exact mergeable state for percentile_cont.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PercentileState {
    pub fraction: f64,
    pub values: Vec<f64>,
}
