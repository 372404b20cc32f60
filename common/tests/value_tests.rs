use freshet_common::cast::{coerce, from_text};
use freshet_common::hash::{hash_group, ls_hash_group};
use freshet_common::value::{DataType, Value};
use std::cmp::Ordering;

#[test]
fn test_numeric_comparison_unifies_int_and_float() {
    assert_eq!(
        Value::Int(2).sql_cmp(&Value::Float(2.0)),
        Some(Ordering::Equal)
    );
    assert_eq!(
        Value::Float(1.5).sql_cmp(&Value::Int(2)),
        Some(Ordering::Less)
    );
    assert_eq!(Value::Null.sql_cmp(&Value::Int(1)), None);
}

#[test]
fn test_group_eq_treats_nulls_as_one_group() {
    assert!(Value::Null.group_eq(&Value::Null));
    assert!(!Value::Null.group_eq(&Value::Int(0)));
    assert!(Value::Int(3).group_eq(&Value::Float(3.0)));
}

#[test]
fn test_group_hash_unifies_numeric_keys() {
    let a = hash_group(&[Value::Int(42)]);
    let b = hash_group(&[Value::Float(42.0)]);
    assert_eq!(a, b);
    assert_ne!(a, hash_group(&[Value::Int(43)]));
}

#[test]
fn test_ls_hash_group_differs_but_is_stable() {
    let key = vec![Value::from("abc"), Value::Int(1)];
    assert_eq!(ls_hash_group(&key), ls_hash_group(&key));
    assert_ne!(ls_hash_group(&key), ls_hash_group(&[Value::from("abd"), Value::Int(1)]));
}

#[test]
fn test_cast_graph_and_text_fallback() {
    assert_eq!(coerce(&Value::Int(3), DataType::Float).unwrap(), Value::Float(3.0));
    assert_eq!(coerce(&Value::from("42"), DataType::Int).unwrap(), Value::Int(42));
    assert_eq!(
        coerce(&Value::Float(7.0), DataType::Text).unwrap(),
        Value::from("7")
    );
    assert_eq!(coerce(&Value::Null, DataType::Int).unwrap(), Value::Null);
    assert!(coerce(&Value::from("nope"), DataType::Int).is_err());
}

#[test]
fn test_from_text_parses_bools_and_timestamps() {
    assert_eq!(from_text("t", DataType::Bool).unwrap(), Value::Bool(true));
    assert_eq!(from_text("off", DataType::Bool).unwrap(), Value::Bool(false));
    assert!(from_text("2024-05-01 10:00:00", DataType::Timestamp).is_ok());
    assert!(from_text("10 seconds", DataType::Interval).is_ok());
}

#[test]
fn test_output_forms() {
    assert_eq!(Value::Bool(true).output(), "t");
    assert_eq!(Value::Int(-5).output(), "-5");
    assert_eq!(
        Value::Array(vec![Value::Int(1), Value::Int(2)]).output(),
        "{1,2}"
    );
    assert_eq!(Value::Bytes(vec![0xde, 0xad]).output(), "\\xdead");
}
