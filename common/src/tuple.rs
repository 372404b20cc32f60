use crate::value::{DataType, Value};
use serde::{Deserialize, Serialize};

/// The name every stream implicitly carries as its last column.
pub const ARRIVAL_TIMESTAMP: &str = "arrival_timestamp";

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// An ordered set of columns describing a tuple shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleDesc {
    pub columns: Vec<Column>,
}

impl TupleDesc {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    /// Case-insensitive attribute lookup.
    pub fn attr(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column(&self, idx: usize) -> Option<&Column> {
        self.columns.get(idx)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    /// Appends `arrival_timestamp` if the descriptor doesn't carry it yet.
    pub fn with_arrival_timestamp(mut self) -> Self {
        if !self.has_column(ARRIVAL_TIMESTAMP) {
            self.columns
                .push(Column::new(ARRIVAL_TIMESTAMP, DataType::Timestamp));
        }
        self
    }
}

/// One tuple of datums, positionally matched to a descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn arity(&self) -> usize {
        self.values.len()
    }

    pub fn get(&self, idx: usize) -> &Value {
        self.values.get(idx).unwrap_or(&Value::Null)
    }

    /// Projects the named columns in order, Null for anything missing.
    pub fn project(&self, indexes: &[usize]) -> Row {
        Row::new(indexes.iter().map(|i| self.get(*i).clone()).collect())
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Row::new(values)
    }
}
