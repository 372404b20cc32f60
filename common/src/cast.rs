use crate::time::{parse_interval, parse_timestamp};
use crate::value::{DataType, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CastError {
    #[error("cannot cast {from} to {to}")]
    NoPath { from: String, to: DataType },
    #[error("invalid input syntax for type {ty}: {input:?}")]
    BadInput { ty: DataType, input: String },
}

pub type Result<T> = std::result::Result<T, CastError>;

/// Coerces a datum to a target type: the direct cast graph first, then the
/// textual round trip through the source type's output function.
pub fn coerce(value: &Value, to: DataType) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    if value.data_type() == Some(to) {
        return Ok(value.clone());
    }
    if let Some(direct) = direct_cast(value, to) {
        return Ok(direct);
    }
    from_text(&value.output(), to)
}

fn direct_cast(value: &Value, to: DataType) -> Option<Value> {
    match (value, to) {
        (Value::Int(i), DataType::Float) => Some(Value::Float(*i as f64)),
        (Value::Float(f), DataType::Int) => {
            if f.is_finite() {
                Some(Value::Int(f.round() as i64))
            } else {
                None
            }
        }
        (Value::Bool(b), DataType::Int) => Some(Value::Int(i64::from(*b))),
        (Value::Int(i), DataType::Bool) => Some(Value::Bool(*i != 0)),
        (_, DataType::Text) => Some(Value::Text(value.output())),
        (Value::Text(s), DataType::Json) => serde_json::from_str(s).ok().map(Value::Json),
        (Value::Json(j), DataType::Int) => j.as_i64().map(Value::Int),
        (Value::Json(j), DataType::Float) => j.as_f64().map(Value::Float),
        _ => None,
    }
}

/// The equivalent of `input_fn`: parses the textual form of a datum.
pub fn from_text(input: &str, to: DataType) -> Result<Value> {
    let bad = || CastError::BadInput {
        ty: to,
        input: input.to_owned(),
    };
    match to {
        DataType::Bool => match input.trim().to_ascii_lowercase().as_str() {
            "t" | "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
            "f" | "false" | "0" | "no" | "off" => Ok(Value::Bool(false)),
            _ => Err(bad()),
        },
        DataType::Int => {
            let trimmed = input.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                Ok(Value::Int(i))
            } else if let Ok(f) = trimmed.parse::<f64>() {
                if f.is_finite() && f.fract() == 0.0 {
                    Ok(Value::Int(f as i64))
                } else {
                    Err(bad())
                }
            } else {
                Err(bad())
            }
        }
        DataType::Float => input.trim().parse::<f64>().map(Value::Float).map_err(|_| bad()),
        DataType::Text => Ok(Value::Text(input.to_owned())),
        DataType::Timestamp => parse_timestamp(input.trim())
            .map(Value::Timestamp)
            .map_err(|_| bad()),
        DataType::Interval => parse_interval(input.trim())
            .map(Value::Interval)
            .map_err(|_| bad()),
        DataType::Json => serde_json::from_str(input).map(Value::Json).map_err(|_| bad()),
        DataType::Bytes | DataType::Array | DataType::Record | DataType::Internal => {
            Err(CastError::NoPath {
                from: "text".to_owned(),
                to,
            })
        }
    }
}
