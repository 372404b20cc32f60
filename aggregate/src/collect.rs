use crate::hll::Hll;
use crate::registry::{Aggregate, AggregateError, Result};
use crate::state::AggState;
use freshet_common::value::{DataType, Value};

/// `combinable_array_agg(x)`: concatenation-mergeable array_agg.
pub struct ArrayAgg;

impl Aggregate for ArrayAgg {
    fn name(&self) -> &'static str {
        "combinable_array_agg"
    }

    fn state_type(&self) -> DataType {
        DataType::Array
    }

    fn init(&self) -> AggState {
        AggState::Collect(Vec::new())
    }

    fn transition(&self, state: &mut AggState, args: &[Value]) -> Result<()> {
        let AggState::Collect(items) = state else {
            return Err(AggregateError::StateMismatch(self.name()));
        };
        if let Some(arg) = args.first() {
            items.push(arg.clone());
        }
        Ok(())
    }

    fn combine(&self, state: &mut AggState, other: &AggState) -> Result<()> {
        match (state, other) {
            (AggState::Collect(items), AggState::Collect(incoming)) => {
                items.extend(incoming.iter().cloned());
                Ok(())
            }
            _ => Err(AggregateError::StateMismatch(self.name())),
        }
    }

    fn finalize(&self, state: &AggState) -> Result<Value> {
        match state {
            AggState::Collect(items) => Ok(Value::Array(items.clone())),
            _ => Err(AggregateError::StateMismatch(self.name())),
        }
    }

    fn natural_state(&self, datum: &Value) -> Result<AggState> {
        match datum {
            Value::Null => Ok(AggState::Collect(Vec::new())),
            Value::Array(items) => Ok(AggState::Collect(items.clone())),
            _ => Err(AggregateError::StateMismatch(self.name())),
        }
    }
}

/// `set_agg(x)`: the DISTINCT variant of array_agg; order-insensitive set
/// union as the combine.
pub struct SetAgg;

impl Aggregate for SetAgg {
    fn name(&self) -> &'static str {
        "set_agg"
    }

    fn state_type(&self) -> DataType {
        DataType::Array
    }

    fn init(&self) -> AggState {
        AggState::Collect(Vec::new())
    }

    fn transition(&self, state: &mut AggState, args: &[Value]) -> Result<()> {
        let AggState::Collect(items) = state else {
            return Err(AggregateError::StateMismatch(self.name()));
        };
        if let Some(arg) = args.first()
            && !items.iter().any(|v| v.group_eq(arg))
        {
            items.push(arg.clone());
        }
        Ok(())
    }

    fn combine(&self, state: &mut AggState, other: &AggState) -> Result<()> {
        match (state, other) {
            (AggState::Collect(items), AggState::Collect(incoming)) => {
                for v in incoming {
                    if !items.iter().any(|held| held.group_eq(v)) {
                        items.push(v.clone());
                    }
                }
                Ok(())
            }
            _ => Err(AggregateError::StateMismatch(self.name())),
        }
    }

    fn finalize(&self, state: &AggState) -> Result<Value> {
        match state {
            AggState::Collect(items) => Ok(Value::Array(items.clone())),
            _ => Err(AggregateError::StateMismatch(self.name())),
        }
    }

    fn natural_state(&self, datum: &Value) -> Result<AggState> {
        match datum {
            Value::Null => Ok(AggState::Collect(Vec::new())),
            Value::Array(items) => Ok(AggState::Collect(items.clone())),
            _ => Err(AggregateError::StateMismatch(self.name())),
        }
    }
}

/// `hll_count_distinct(x)`: approximate COUNT(DISTINCT) over unbounded
/// input, backed by the HyperLogLog sketch.
pub struct HllCountDistinct;

impl Aggregate for HllCountDistinct {
    fn name(&self) -> &'static str {
        "hll_count_distinct"
    }

    fn state_type(&self) -> DataType {
        DataType::Internal
    }

    fn init(&self) -> AggState {
        AggState::Hll(Hll::new())
    }

    fn transition(&self, state: &mut AggState, args: &[Value]) -> Result<()> {
        let AggState::Hll(hll) = state else {
            return Err(AggregateError::StateMismatch(self.name()));
        };
        // count semantics: nulls don't contribute
        if !args.is_empty() && !args.iter().all(Value::is_null) {
            hll.add(args);
        }
        Ok(())
    }

    fn combine(&self, state: &mut AggState, other: &AggState) -> Result<()> {
        match (state, other) {
            (AggState::Hll(mine), AggState::Hll(theirs)) => {
                mine.merge(theirs);
                Ok(())
            }
            _ => Err(AggregateError::StateMismatch(self.name())),
        }
    }

    fn finalize(&self, state: &AggState) -> Result<Value> {
        match state {
            AggState::Hll(hll) => Ok(Value::Int(hll.cardinality())),
            _ => Err(AggregateError::StateMismatch(self.name())),
        }
    }
}

/// `combinable_string_agg(x, delim)`: parts stay split until finalize so
/// merges preserve the delimiter semantics.
pub struct StringAgg;

impl Aggregate for StringAgg {
    fn name(&self) -> &'static str {
        "combinable_string_agg"
    }

    fn state_type(&self) -> DataType {
        DataType::Internal
    }

    fn init(&self) -> AggState {
        AggState::StringAgg {
            parts: Vec::new(),
            delim: None,
        }
    }

    fn transition(&self, state: &mut AggState, args: &[Value]) -> Result<()> {
        let AggState::StringAgg { parts, delim } = state else {
            return Err(AggregateError::StateMismatch(self.name()));
        };
        if let Some(Value::Text(d)) = args.get(1)
            && delim.is_none()
        {
            *delim = Some(d.clone());
        }
        match args.first() {
            Some(Value::Null) | None => {}
            Some(v) => parts.push(v.output()),
        }
        Ok(())
    }

    fn combine(&self, state: &mut AggState, other: &AggState) -> Result<()> {
        match (state, other) {
            (
                AggState::StringAgg { parts, delim },
                AggState::StringAgg {
                    parts: other_parts,
                    delim: other_delim,
                },
            ) => {
                if delim.is_none() {
                    delim.clone_from(other_delim);
                }
                parts.extend(other_parts.iter().cloned());
                Ok(())
            }
            _ => Err(AggregateError::StateMismatch(self.name())),
        }
    }

    fn finalize(&self, state: &AggState) -> Result<Value> {
        match state {
            AggState::StringAgg { parts, delim } => {
                if parts.is_empty() {
                    return Ok(Value::Null);
                }
                let delim = delim.clone().unwrap_or_default();
                Ok(Value::Text(parts.join(&delim)))
            }
            _ => Err(AggregateError::StateMismatch(self.name())),
        }
    }
}

/// Lowers a datum into its JSON representation.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::Number((*i).into()),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
        Value::Interval(_) | Value::Bytes(_) => serde_json::Value::String(value.output()),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Json(j) => j.clone(),
        Value::Record(fields) => serde_json::Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), value_to_json(v)))
                .collect(),
        ),
    }
}

/// `combinable_json_agg(x)` / `combinable_jsonb_agg(x)`.
pub struct JsonAgg {
    name: &'static str,
}

impl JsonAgg {
    pub fn json() -> Self {
        Self {
            name: "combinable_json_agg",
        }
    }

    pub fn jsonb() -> Self {
        Self {
            name: "combinable_jsonb_agg",
        }
    }
}

impl Aggregate for JsonAgg {
    fn name(&self) -> &'static str {
        self.name
    }

    fn state_type(&self) -> DataType {
        DataType::Json
    }

    fn init(&self) -> AggState {
        AggState::JsonAgg(Vec::new())
    }

    fn transition(&self, state: &mut AggState, args: &[Value]) -> Result<()> {
        let AggState::JsonAgg(items) = state else {
            return Err(AggregateError::StateMismatch(self.name));
        };
        if let Some(arg) = args.first() {
            items.push(value_to_json(arg));
        }
        Ok(())
    }

    fn combine(&self, state: &mut AggState, other: &AggState) -> Result<()> {
        match (state, other) {
            (AggState::JsonAgg(items), AggState::JsonAgg(incoming)) => {
                items.extend(incoming.iter().cloned());
                Ok(())
            }
            _ => Err(AggregateError::StateMismatch(self.name)),
        }
    }

    fn finalize(&self, state: &AggState) -> Result<Value> {
        match state {
            AggState::JsonAgg(items) => Ok(Value::Json(serde_json::Value::Array(items.clone()))),
            _ => Err(AggregateError::StateMismatch(self.name)),
        }
    }

    fn natural_state(&self, datum: &Value) -> Result<AggState> {
        match datum {
            Value::Null => Ok(AggState::JsonAgg(Vec::new())),
            Value::Json(serde_json::Value::Array(items)) => Ok(AggState::JsonAgg(items.clone())),
            _ => Err(AggregateError::StateMismatch(self.name)),
        }
    }
}

/// `combinable_json_object_agg(k, v)` / `combinable_jsonb_object_agg(k, v)`.
/// Pairs stay ordered until finalize; a later key wins on merge.
pub struct JsonObjectAgg {
    name: &'static str,
}

impl JsonObjectAgg {
    pub fn json() -> Self {
        Self {
            name: "combinable_json_object_agg",
        }
    }

    pub fn jsonb() -> Self {
        Self {
            name: "combinable_jsonb_object_agg",
        }
    }
}

impl Aggregate for JsonObjectAgg {
    fn name(&self) -> &'static str {
        self.name
    }

    fn state_type(&self) -> DataType {
        DataType::Internal
    }

    fn init(&self) -> AggState {
        AggState::JsonObjectAgg(Vec::new())
    }

    fn transition(&self, state: &mut AggState, args: &[Value]) -> Result<()> {
        let AggState::JsonObjectAgg(pairs) = state else {
            return Err(AggregateError::StateMismatch(self.name));
        };
        let key = match args.first() {
            Some(Value::Null) | None => {
                return Err(AggregateError::BadArgs {
                    agg: self.name,
                    detail: "field name must not be null".to_owned(),
                });
            }
            Some(k) => k.output(),
        };
        let value = args.get(1).map(value_to_json).unwrap_or_default();
        pairs.push((key, value));
        Ok(())
    }

    fn combine(&self, state: &mut AggState, other: &AggState) -> Result<()> {
        match (state, other) {
            (AggState::JsonObjectAgg(pairs), AggState::JsonObjectAgg(incoming)) => {
                pairs.extend(incoming.iter().cloned());
                Ok(())
            }
            _ => Err(AggregateError::StateMismatch(self.name)),
        }
    }

    fn finalize(&self, state: &AggState) -> Result<Value> {
        match state {
            AggState::JsonObjectAgg(pairs) => {
                let mut object = serde_json::Map::new();
                for (k, v) in pairs {
                    object.insert(k.clone(), v.clone());
                }
                Ok(Value::Json(serde_json::Value::Object(object)))
            }
            _ => Err(AggregateError::StateMismatch(self.name)),
        }
    }
}
