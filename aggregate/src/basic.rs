use crate::registry::{Aggregate, AggregateError, Result};
use crate::state::{AggState, NumericSum};
use freshet_common::value::{DataType, Value};
use std::cmp::Ordering;

/// `count(*)` and `count(x)`; the state is the running count itself.
pub struct Count;

impl Aggregate for Count {
    fn name(&self) -> &'static str {
        "count"
    }

    fn state_type(&self) -> DataType {
        DataType::Int
    }

    fn init(&self) -> AggState {
        AggState::Count(0)
    }

    fn transition(&self, state: &mut AggState, args: &[Value]) -> Result<()> {
        let AggState::Count(n) = state else {
            return Err(AggregateError::StateMismatch("count"));
        };
        // count(*) has no argument; count(x) skips nulls
        if args.is_empty() || !args[0].is_null() {
            *n += 1;
        }
        Ok(())
    }

    fn combine(&self, state: &mut AggState, other: &AggState) -> Result<()> {
        match (state, other) {
            (AggState::Count(a), AggState::Count(b)) => {
                *a += *b;
                Ok(())
            }
            _ => Err(AggregateError::StateMismatch("count")),
        }
    }

    fn finalize(&self, state: &AggState) -> Result<Value> {
        match state {
            AggState::Count(n) => Ok(Value::Int(*n)),
            _ => Err(AggregateError::StateMismatch("count")),
        }
    }

    fn natural_state(&self, datum: &Value) -> Result<AggState> {
        match datum {
            Value::Null => Ok(AggState::Count(0)),
            Value::Int(n) => Ok(AggState::Count(*n)),
            _ => Err(AggregateError::StateMismatch("count")),
        }
    }
}

/// `sum(x)`; integral until a float contributes.
pub struct Sum;

impl Aggregate for Sum {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn state_type(&self) -> DataType {
        DataType::Float
    }

    fn init(&self) -> AggState {
        AggState::Sum(NumericSum::Empty)
    }

    fn transition(&self, state: &mut AggState, args: &[Value]) -> Result<()> {
        let AggState::Sum(acc) = state else {
            return Err(AggregateError::StateMismatch("sum"));
        };
        match args.first() {
            Some(Value::Int(i)) => acc.add_int(*i),
            Some(Value::Float(f)) => acc.add_float(*f),
            Some(Value::Null) | None => {}
            Some(other) => {
                return Err(AggregateError::BadArgs {
                    agg: "sum",
                    detail: format!("cannot sum {other:?}"),
                });
            }
        }
        Ok(())
    }

    fn combine(&self, state: &mut AggState, other: &AggState) -> Result<()> {
        match (state, other) {
            (AggState::Sum(a), AggState::Sum(b)) => {
                a.merge(b);
                Ok(())
            }
            _ => Err(AggregateError::StateMismatch("sum")),
        }
    }

    fn finalize(&self, state: &AggState) -> Result<Value> {
        match state {
            AggState::Sum(acc) => Ok(acc.to_value()),
            _ => Err(AggregateError::StateMismatch("sum")),
        }
    }

    fn natural_state(&self, datum: &Value) -> Result<AggState> {
        match datum {
            Value::Null => Ok(AggState::Sum(NumericSum::Empty)),
            Value::Int(i) => Ok(AggState::Sum(NumericSum::Int(*i))),
            Value::Float(f) => Ok(AggState::Sum(NumericSum::Float(*f))),
            _ => Err(AggregateError::StateMismatch("sum")),
        }
    }
}

/// `avg(x)`; the state keeps sum and count, so it serializes as internal.
pub struct Avg;

impl Aggregate for Avg {
    fn name(&self) -> &'static str {
        "avg"
    }

    fn state_type(&self) -> DataType {
        DataType::Internal
    }

    fn init(&self) -> AggState {
        AggState::Avg {
            sum: NumericSum::Empty,
            count: 0,
        }
    }

    fn transition(&self, state: &mut AggState, args: &[Value]) -> Result<()> {
        let AggState::Avg { sum, count } = state else {
            return Err(AggregateError::StateMismatch("avg"));
        };
        match args.first() {
            Some(Value::Int(i)) => {
                sum.add_int(*i);
                *count += 1;
            }
            Some(Value::Float(f)) => {
                sum.add_float(*f);
                *count += 1;
            }
            Some(Value::Null) | None => {}
            Some(other) => {
                return Err(AggregateError::BadArgs {
                    agg: "avg",
                    detail: format!("cannot average {other:?}"),
                });
            }
        }
        Ok(())
    }

    fn combine(&self, state: &mut AggState, other: &AggState) -> Result<()> {
        match (state, other) {
            (
                AggState::Avg { sum, count },
                AggState::Avg {
                    sum: other_sum,
                    count: other_count,
                },
            ) => {
                sum.merge(other_sum);
                *count += *other_count;
                Ok(())
            }
            _ => Err(AggregateError::StateMismatch("avg")),
        }
    }

    fn finalize(&self, state: &AggState) -> Result<Value> {
        match state {
            AggState::Avg { sum, count } => {
                if *count == 0 {
                    return Ok(Value::Null);
                }
                let total = match sum {
                    NumericSum::Empty => 0.0,
                    NumericSum::Int(i) => *i as f64,
                    NumericSum::Float(f) => *f,
                };
                Ok(Value::Float(total / *count as f64))
            }
            _ => Err(AggregateError::StateMismatch("avg")),
        }
    }
}

/// `min(x)` / `max(x)`; the state is the current extreme value.
pub struct Extremum {
    name: &'static str,
    keep: Ordering,
}

impl Extremum {
    pub fn min() -> Self {
        Self {
            name: "min",
            keep: Ordering::Less,
        }
    }

    pub fn max() -> Self {
        Self {
            name: "max",
            keep: Ordering::Greater,
        }
    }

    fn consider(&self, current: &mut Option<Value>, candidate: &Value) {
        if candidate.is_null() {
            return;
        }
        match current {
            None => *current = Some(candidate.clone()),
            Some(held) => {
                if candidate.sql_cmp(held) == Some(self.keep) {
                    *current = Some(candidate.clone());
                }
            }
        }
    }
}

impl Aggregate for Extremum {
    fn name(&self) -> &'static str {
        self.name
    }

    fn state_type(&self) -> DataType {
        DataType::Text
    }

    fn init(&self) -> AggState {
        AggState::Extreme(None)
    }

    fn transition(&self, state: &mut AggState, args: &[Value]) -> Result<()> {
        let AggState::Extreme(current) = state else {
            return Err(AggregateError::StateMismatch(self.name));
        };
        if let Some(arg) = args.first() {
            self.consider(current, arg);
        }
        Ok(())
    }

    fn combine(&self, state: &mut AggState, other: &AggState) -> Result<()> {
        match (state, other) {
            (AggState::Extreme(current), AggState::Extreme(incoming)) => {
                if let Some(v) = incoming {
                    self.consider(current, v);
                }
                Ok(())
            }
            _ => Err(AggregateError::StateMismatch(self.name)),
        }
    }

    fn finalize(&self, state: &AggState) -> Result<Value> {
        match state {
            AggState::Extreme(current) => Ok(current.clone().unwrap_or(Value::Null)),
            _ => Err(AggregateError::StateMismatch(self.name)),
        }
    }

    fn natural_state(&self, datum: &Value) -> Result<AggState> {
        match datum {
            Value::Null => Ok(AggState::Extreme(None)),
            other => Ok(AggState::Extreme(Some(other.clone()))),
        }
    }
}
