use chrono::{DateTime, TimeDelta, Utc};
use freshet_common::cast;
use freshet_common::time::{self, date_round};
use freshet_common::tuple::{Row, TupleDesc};
use freshet_common::value::{DataType, Value};
use sqlparser::ast::{BinaryOperator, Expr, UnaryOperator};
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EvalError {
    #[error("column \"{0}\" does not exist")]
    UnknownColumn(String),
    #[error("function {0}() does not exist")]
    UnknownFunction(String),
    #[error("operator is not supported: {0}")]
    UnknownOperator(String),
    #[error("invalid operand: {0}")]
    BadOperand(String),
    #[error("cannot evaluate {0} outside a query")]
    NotConstant(String),
    #[error(transparent)]
    Cast(#[from] cast::CastError),
}

pub type Result<T> = std::result::Result<T, EvalError>;

/// Name bindings an expression evaluates against. Qualified names register
/// under both `alias.column` and `column`.
#[derive(Debug, Clone)]
pub struct Scope {
    entries: Vec<(String, Value)>,
    pub now: DateTime<Utc>,
}

impl Scope {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            entries: Vec::new(),
            now,
        }
    }

    pub fn push_col(&mut self, name: &str, value: Value) {
        self.entries.push((name.to_ascii_lowercase(), value));
    }

    /// Binds every column of a row, optionally under a table alias as well.
    pub fn push_row(&mut self, desc: &TupleDesc, row: &Row, alias: Option<&str>) {
        for (idx, col) in desc.columns.iter().enumerate() {
            let value = row.get(idx).clone();
            if let Some(alias) = alias {
                self.entries.push((
                    format!("{}.{}", alias.to_ascii_lowercase(), col.name.to_ascii_lowercase()),
                    value.clone(),
                ));
            }
            self.entries.push((col.name.to_ascii_lowercase(), value));
        }
    }

    fn resolve(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, v)| v)
    }
}

/// Maps a SQL type name onto the datum model. Matching happens on the
/// rendered name so dialect-specific aliases all land in the same bucket.
pub fn cast_target(data_type: &sqlparser::ast::DataType) -> Option<DataType> {
    let name = data_type.to_string().to_ascii_lowercase();
    let base = name.split(&['(', ' '][..]).next().unwrap_or("");
    match base {
        "int" | "int2" | "int4" | "int8" | "integer" | "bigint" | "smallint" => Some(DataType::Int),
        "double" | "float" | "float4" | "float8" | "real" | "numeric" | "decimal" => {
            Some(DataType::Float)
        }
        "text" | "varchar" | "char" | "character" | "string" => Some(DataType::Text),
        "bool" | "boolean" => Some(DataType::Bool),
        "timestamp" | "timestamptz" | "datetime" | "date" => Some(DataType::Timestamp),
        "interval" => Some(DataType::Interval),
        "json" | "jsonb" => Some(DataType::Json),
        "bytea" => Some(DataType::Bytes),
        _ => None,
    }
}

fn literal(value: &sqlparser::ast::Value) -> Result<Value> {
    use sqlparser::ast::Value as Lit;
    Ok(match value {
        Lit::Null => Value::Null,
        Lit::Boolean(b) => Value::Bool(*b),
        Lit::Number(text, _) => {
            if let Ok(i) = text.parse::<i64>() {
                Value::Int(i)
            } else {
                text.parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| EvalError::BadOperand(format!("bad numeric literal {text:?}")))?
            }
        }
        Lit::SingleQuotedString(s)
        | Lit::DoubleQuotedString(s)
        | Lit::EscapedStringLiteral(s) => Value::Text(s.clone()),
        other => {
            return Err(EvalError::BadOperand(format!(
                "unsupported literal {other}"
            )));
        }
    })
}

/// Evaluates an expression with no column bindings; clock functions are
/// rejected. Used for interval literals and constant target expressions.
pub fn eval_const(expr: &Expr) -> Result<Value> {
    let scope = Scope::new(DateTime::<Utc>::UNIX_EPOCH);
    eval_inner(expr, &scope, true)
}

/// Evaluates an expression against a scope.
pub fn eval(expr: &Expr, scope: &Scope) -> Result<Value> {
    eval_inner(expr, scope, false)
}

fn eval_inner(expr: &Expr, scope: &Scope, const_only: bool) -> Result<Value> {
    match expr {
        Expr::Value(v) => literal(v),
        Expr::Nested(inner) => eval_inner(inner, scope, const_only),
        Expr::Identifier(ident) => {
            let key = ident.value.to_ascii_lowercase();
            scope
                .resolve(&key)
                .cloned()
                .ok_or(EvalError::UnknownColumn(key))
        }
        Expr::CompoundIdentifier(parts) => {
            let full = parts
                .iter()
                .map(|i| i.value.to_ascii_lowercase())
                .collect::<Vec<_>>()
                .join(".");
            if let Some(v) = scope.resolve(&full) {
                return Ok(v.clone());
            }
            let last = parts
                .last()
                .map(|i| i.value.to_ascii_lowercase())
                .unwrap_or_default();
            scope
                .resolve(&last)
                .cloned()
                .ok_or(EvalError::UnknownColumn(full))
        }
        Expr::BinaryOp { left, op, right } => {
            let l = eval_inner(left, scope, const_only)?;
            let r = eval_inner(right, scope, const_only)?;
            binary_op(op, l, r)
        }
        Expr::UnaryOp { op, expr } => {
            let v = eval_inner(expr, scope, const_only)?;
            match op {
                UnaryOperator::Minus => match v {
                    Value::Null => Ok(Value::Null),
                    Value::Int(i) => Ok(Value::Int(-i)),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    Value::Interval(us) => Ok(Value::Interval(-us)),
                    other => Err(EvalError::BadOperand(format!("cannot negate {other:?}"))),
                },
                UnaryOperator::Plus => Ok(v),
                UnaryOperator::Not => match v {
                    Value::Null => Ok(Value::Null),
                    Value::Bool(b) => Ok(Value::Bool(!b)),
                    other => Err(EvalError::BadOperand(format!("NOT over {other:?}"))),
                },
                other => Err(EvalError::UnknownOperator(other.to_string())),
            }
        }
        Expr::Cast {
            expr, data_type, ..
        } => {
            let v = eval_inner(expr, scope, const_only)?;
            let target = cast_target(data_type)
                .ok_or_else(|| EvalError::BadOperand(format!("unknown type {data_type}")))?;
            Ok(cast::coerce(&v, target)?)
        }
        Expr::IsNull(inner) => Ok(Value::Bool(
            eval_inner(inner, scope, const_only)?.is_null(),
        )),
        Expr::IsNotNull(inner) => Ok(Value::Bool(
            !eval_inner(inner, scope, const_only)?.is_null(),
        )),
        Expr::IsTrue(inner) => Ok(Value::Bool(
            eval_inner(inner, scope, const_only)?.as_bool() == Some(true),
        )),
        Expr::IsNotTrue(inner) => Ok(Value::Bool(
            eval_inner(inner, scope, const_only)?.as_bool() != Some(true),
        )),
        Expr::IsFalse(inner) => Ok(Value::Bool(
            eval_inner(inner, scope, const_only)?.as_bool() == Some(false),
        )),
        Expr::IsNotFalse(inner) => Ok(Value::Bool(
            eval_inner(inner, scope, const_only)?.as_bool() != Some(false),
        )),
        Expr::Between {
            expr,
            negated,
            low,
            high,
        } => {
            let v = eval_inner(expr, scope, const_only)?;
            let lo = eval_inner(low, scope, const_only)?;
            let hi = eval_inner(high, scope, const_only)?;
            match (v.sql_cmp(&lo), v.sql_cmp(&hi)) {
                (Some(a), Some(b)) => {
                    let within = a != Ordering::Less && b != Ordering::Greater;
                    Ok(Value::Bool(within != *negated))
                }
                _ => Ok(Value::Null),
            }
        }
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let v = eval_inner(expr, scope, const_only)?;
            if v.is_null() {
                return Ok(Value::Null);
            }
            let mut found = false;
            for item in list {
                let candidate = eval_inner(item, scope, const_only)?;
                if v.sql_cmp(&candidate) == Some(Ordering::Equal) {
                    found = true;
                    break;
                }
            }
            Ok(Value::Bool(found != *negated))
        }
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            let operand_val = operand
                .as_ref()
                .map(|o| eval_inner(o, scope, const_only))
                .transpose()?;
            for (cond, result) in conditions.iter().zip(results.iter()) {
                let cond_val = eval_inner(cond, scope, const_only)?;
                let matched = match &operand_val {
                    Some(op) => op.sql_cmp(&cond_val) == Some(Ordering::Equal),
                    None => cond_val.as_bool() == Some(true),
                };
                if matched {
                    return eval_inner(result, scope, const_only);
                }
            }
            match else_result {
                Some(e) => eval_inner(e, scope, const_only),
                None => Ok(Value::Null),
            }
        }
        Expr::Interval(interval) => {
            let inner = eval_inner(&interval.value, scope, const_only)?;
            match inner {
                Value::Text(text) => {
                    let micros = match &interval.leading_field {
                        Some(field) => {
                            let qty: f64 = text.trim().parse().map_err(|_| {
                                EvalError::BadOperand(format!("bad interval {text:?}"))
                            })?;
                            let unit = time::parse_interval(&format!("1 {field}"))
                                .map_err(|e| EvalError::BadOperand(e.to_string()))?;
                            (qty * unit as f64).round() as i64
                        }
                        None => time::parse_interval(&text)
                            .map_err(|e| EvalError::BadOperand(e.to_string()))?,
                    };
                    Ok(Value::Interval(micros))
                }
                Value::Int(i) => Ok(Value::Interval(
                    i * time::USECS_PER_SEC,
                )),
                other => Err(EvalError::BadOperand(format!("bad interval {other:?}"))),
            }
        }
        Expr::Function(func) => eval_function(func, scope, const_only),
        // record field access, e.g. (new).x on an output-stream delta
        Expr::CompositeAccess { expr, key } => {
            let base = eval_inner(expr, scope, const_only)?;
            match base {
                Value::Null => Ok(Value::Null),
                Value::Record(fields) => Ok(fields
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(&key.value))
                    .map(|(_, v)| v.clone())
                    .unwrap_or(Value::Null)),
                other => Err(EvalError::BadOperand(format!(
                    "cannot take field {} of {other:?}",
                    key.value
                ))),
            }
        }
        Expr::Tuple(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval_inner(item, scope, const_only)?);
            }
            Ok(Value::Array(values))
        }
        other => Err(EvalError::BadOperand(format!(
            "unsupported expression {other}"
        ))),
    }
}

fn eval_function(
    func: &sqlparser::ast::Function,
    scope: &Scope,
    const_only: bool,
) -> Result<Value> {
    let name = crate::util::func_name(func);
    let (arg_exprs, _star) = crate::util::func_arg_exprs(func);
    let mut args = Vec::with_capacity(arg_exprs.len());
    for arg in &arg_exprs {
        args.push(eval_inner(arg, scope, const_only)?);
    }

    match name.as_str() {
        "clock_timestamp" | "now" | "transaction_timestamp" => {
            if const_only {
                Err(EvalError::NotConstant(name))
            } else {
                Ok(Value::Timestamp(scope.now))
            }
        }
        "date_round" => {
            let ts = args
                .first()
                .and_then(Value::as_timestamp)
                .ok_or_else(|| EvalError::BadOperand("date_round expects a timestamp".into()))?;
            let step = match args.get(1) {
                Some(Value::Interval(us)) => *us,
                Some(Value::Text(text)) => time::parse_interval(text)
                    .map_err(|e| EvalError::BadOperand(e.to_string()))?,
                _ => {
                    return Err(EvalError::BadOperand(
                        "date_round expects an interval step".into(),
                    ));
                }
            };
            Ok(Value::Timestamp(date_round(ts, step)))
        }
        "date_trunc" => {
            let field = args
                .first()
                .and_then(|v| v.as_text().map(str::to_owned))
                .ok_or_else(|| EvalError::BadOperand("date_trunc expects a field name".into()))?;
            let ts = args
                .get(1)
                .and_then(Value::as_timestamp)
                .ok_or_else(|| EvalError::BadOperand("date_trunc expects a timestamp".into()))?;
            let step = time::parse_interval(&format!("1 {field}"))
                .map_err(|e| EvalError::BadOperand(e.to_string()))?;
            Ok(Value::Timestamp(date_round(ts, step)))
        }
        "abs" => match args.first() {
            Some(Value::Int(i)) => Ok(Value::Int(i.abs())),
            Some(Value::Float(f)) => Ok(Value::Float(f.abs())),
            Some(Value::Null) | None => Ok(Value::Null),
            Some(other) => Err(EvalError::BadOperand(format!("abs over {other:?}"))),
        },
        "floor" | "ceil" | "ceiling" | "round" => match args.first() {
            Some(Value::Int(i)) => Ok(Value::Int(*i)),
            Some(Value::Float(f)) => {
                let out = match name.as_str() {
                    "floor" => f.floor(),
                    "round" => f.round(),
                    _ => f.ceil(),
                };
                Ok(Value::Float(out))
            }
            Some(Value::Null) | None => Ok(Value::Null),
            Some(other) => Err(EvalError::BadOperand(format!("{name} over {other:?}"))),
        },
        "lower" => Ok(text_fn(&args, |s| s.to_lowercase())),
        "upper" => Ok(text_fn(&args, |s| s.to_uppercase())),
        "length" | "char_length" => match args.first() {
            Some(Value::Text(s)) => Ok(Value::Int(s.chars().count() as i64)),
            _ => Ok(Value::Null),
        },
        "coalesce" => {
            for arg in &args {
                if !arg.is_null() {
                    return Ok(arg.clone());
                }
            }
            Ok(Value::Null)
        }
        "nullif" => {
            if args.len() == 2 && args[0].sql_cmp(&args[1]) == Some(Ordering::Equal) {
                Ok(Value::Null)
            } else {
                Ok(args.first().cloned().unwrap_or(Value::Null))
            }
        }
        _ => Err(EvalError::UnknownFunction(name)),
    }
}

fn text_fn(args: &[Value], f: impl Fn(&str) -> String) -> Value {
    match args.first() {
        Some(Value::Text(s)) => Value::Text(f(s)),
        _ => Value::Null,
    }
}

fn binary_op(op: &BinaryOperator, l: Value, r: Value) -> Result<Value> {
    use BinaryOperator::*;
    match op {
        And => Ok(match (l.as_bool(), r.as_bool(), l.is_null() || r.is_null()) {
            (Some(false), _, _) | (_, Some(false), _) => Value::Bool(false),
            (_, _, true) => Value::Null,
            _ => Value::Bool(true),
        }),
        Or => Ok(match (l.as_bool(), r.as_bool(), l.is_null() || r.is_null()) {
            (Some(true), _, _) | (_, Some(true), _) => Value::Bool(true),
            (_, _, true) => Value::Null,
            _ => Value::Bool(false),
        }),
        Eq | NotEq | Lt | LtEq | Gt | GtEq => {
            if l.is_null() || r.is_null() {
                return Ok(Value::Null);
            }
            let ord = l.sql_cmp(&r).ok_or_else(|| {
                EvalError::BadOperand(format!("cannot compare {l:?} with {r:?}"))
            })?;
            let result = match op {
                Eq => ord == Ordering::Equal,
                NotEq => ord != Ordering::Equal,
                Lt => ord == Ordering::Less,
                LtEq => ord != Ordering::Greater,
                Gt => ord == Ordering::Greater,
                GtEq => ord != Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        Plus | Minus | Multiply | Divide | Modulo => arith(op, l, r),
        StringConcat => {
            if l.is_null() || r.is_null() {
                return Ok(Value::Null);
            }
            Ok(Value::Text(format!("{}{}", l.output(), r.output())))
        }
        other => Err(EvalError::UnknownOperator(other.to_string())),
    }
}

fn arith(op: &BinaryOperator, l: Value, r: Value) -> Result<Value> {
    use BinaryOperator::*;
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }

    // timestamp/interval arithmetic
    match (&l, &r, op) {
        (Value::Timestamp(ts), Value::Interval(us), Plus) => {
            return Ok(Value::Timestamp(*ts + TimeDelta::microseconds(*us)));
        }
        (Value::Interval(us), Value::Timestamp(ts), Plus) => {
            return Ok(Value::Timestamp(*ts + TimeDelta::microseconds(*us)));
        }
        (Value::Timestamp(ts), Value::Interval(us), Minus) => {
            return Ok(Value::Timestamp(*ts - TimeDelta::microseconds(*us)));
        }
        (Value::Timestamp(a), Value::Timestamp(b), Minus) => {
            return Ok(Value::Interval(
                (*a - *b).num_microseconds().unwrap_or(i64::MAX),
            ));
        }
        (Value::Interval(a), Value::Interval(b), Plus) => {
            return Ok(Value::Interval(a + b));
        }
        (Value::Interval(a), Value::Interval(b), Minus) => {
            return Ok(Value::Interval(a - b));
        }
        _ => {}
    }

    match (l.as_float(), r.as_float()) {
        (Some(a), Some(b)) => {
            let both_int = matches!((&l, &r), (Value::Int(_), Value::Int(_)));
            let out = match op {
                Plus => a + b,
                Minus => a - b,
                Multiply => a * b,
                Divide => {
                    if b == 0.0 {
                        return Err(EvalError::BadOperand("division by zero".into()));
                    }
                    if both_int {
                        // integer division truncates
                        return Ok(Value::Int(l.as_int().unwrap() / r.as_int().unwrap()));
                    }
                    a / b
                }
                Modulo => {
                    if b == 0.0 {
                        return Err(EvalError::BadOperand("division by zero".into()));
                    }
                    if both_int {
                        return Ok(Value::Int(l.as_int().unwrap() % r.as_int().unwrap()));
                    }
                    a % b
                }
                _ => unreachable!(),
            };
            if both_int && out.fract() == 0.0 && out.abs() < 9.2e18 {
                Ok(Value::Int(out as i64))
            } else {
                Ok(Value::Float(out))
            }
        }
        _ => Err(EvalError::BadOperand(format!(
            "cannot apply {op} to {l:?} and {r:?}"
        ))),
    }
}
