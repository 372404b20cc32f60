use freshet_aggregate::{AggState, lookup, lookup_combine_target};
use freshet_common::value::Value;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn feed(agg: &dyn freshet_aggregate::Aggregate, values: &[Value]) -> AggState {
    let mut state = agg.init();
    for value in values {
        agg.transition(&mut state, std::slice::from_ref(value)).unwrap();
    }
    state
}

/// Splitting the input arbitrarily and combining the partial states must
/// match feeding everything into one state.
fn assert_combine_matches(name: &str, values: &[Value]) {
    let agg = lookup(name).expect(name);
    let whole = feed(agg.as_ref(), values);

    for split in [0, 1, values.len() / 2, values.len()] {
        let mut left = feed(agg.as_ref(), &values[..split]);
        let right = feed(agg.as_ref(), &values[split..]);
        agg.combine(&mut left, &right).unwrap();
        assert_eq!(
            agg.finalize(&left).unwrap(),
            agg.finalize(&whole).unwrap(),
            "{name} split at {split}"
        );
    }
}

#[test]
fn test_count_combines() {
    let mut state = lookup("count").unwrap().init();
    let agg = lookup("count").unwrap();
    for _ in 0..5 {
        agg.transition(&mut state, &[]).unwrap();
    }
    agg.transition(&mut state, &[Value::Null]).unwrap();
    assert_eq!(agg.finalize(&state).unwrap(), Value::Int(5));

    let values: Vec<Value> = (0..100).map(Value::Int).collect();
    assert_combine_matches("count", &values);
}

#[test]
fn test_sum_stays_integral_until_floats() {
    let agg = lookup("sum").unwrap();
    let ints = feed(agg.as_ref(), &[Value::Int(1), Value::Int(2), Value::Int(3)]);
    assert_eq!(agg.finalize(&ints).unwrap(), Value::Int(6));

    let mixed = feed(agg.as_ref(), &[Value::Int(1), Value::Float(0.5)]);
    assert_eq!(agg.finalize(&mixed).unwrap(), Value::Float(1.5));

    let empty = agg.init();
    assert_eq!(agg.finalize(&empty).unwrap(), Value::Null);
}

#[test]
fn test_avg_min_max_combine() {
    let values: Vec<Value> = (1..=10).map(Value::Int).collect();
    assert_combine_matches("avg", &values);
    assert_combine_matches("min", &values);
    assert_combine_matches("max", &values);

    let agg = lookup("avg").unwrap();
    let state = feed(agg.as_ref(), &values);
    assert_eq!(agg.finalize(&state).unwrap(), Value::Float(5.5));
}

#[test]
fn test_array_agg_concatenates() {
    let values: Vec<Value> = vec![Value::Int(3), Value::Int(1), Value::Int(3)];
    let agg = lookup("combinable_array_agg").unwrap();
    let state = feed(agg.as_ref(), &values);
    assert_eq!(
        agg.finalize(&state).unwrap(),
        Value::Array(vec![Value::Int(3), Value::Int(1), Value::Int(3)])
    );
    assert_combine_matches("combinable_array_agg", &values);
}

#[test]
fn test_set_agg_dedups() {
    let agg = lookup("set_agg").unwrap();
    let state = feed(
        agg.as_ref(),
        &[Value::Int(1), Value::Int(2), Value::Int(1), Value::Null, Value::Null],
    );
    let Value::Array(items) = agg.finalize(&state).unwrap() else {
        panic!("set_agg must finalize to an array");
    };
    assert_eq!(items.len(), 3);
}

#[test]
fn test_string_agg_preserves_delimiter_across_combines() {
    let agg = lookup("combinable_string_agg").unwrap();
    let mut left = agg.init();
    agg.transition(&mut left, &[Value::from("a"), Value::from(",")])
        .unwrap();
    agg.transition(&mut left, &[Value::from("b"), Value::from(",")])
        .unwrap();
    let mut right = agg.init();
    agg.transition(&mut right, &[Value::from("c"), Value::from(",")])
        .unwrap();
    agg.combine(&mut left, &right).unwrap();
    assert_eq!(agg.finalize(&left).unwrap(), Value::from("a,b,c"));
}

#[test]
fn test_json_object_agg_last_key_wins() {
    let agg = lookup("combinable_json_object_agg").unwrap();
    let mut state = agg.init();
    agg.transition(&mut state, &[Value::from("k"), Value::Int(1)])
        .unwrap();
    agg.transition(&mut state, &[Value::from("k"), Value::Int(2)])
        .unwrap();
    let Value::Json(out) = agg.finalize(&state).unwrap() else {
        panic!("expected json output");
    };
    assert_eq!(out["k"], serde_json::json!(2));
}

#[test]
fn test_hll_count_distinct_error_bound() {
    let agg = lookup("hll_count_distinct").unwrap();
    let mut state = agg.init();
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..10_000 {
        let v = rng.gen_range(0..1000i64);
        agg.transition(&mut state, &[Value::Int(v)]).unwrap();
    }
    let Value::Int(estimate) = agg.finalize(&state).unwrap() else {
        panic!("expected integer estimate");
    };
    // 2^14 registers put the relative error around 0.81%
    assert!((estimate - 1000).abs() <= 50, "estimate {estimate} too far from 1000");
}

#[test]
fn test_hll_merge_is_union() {
    let agg = lookup("hll_count_distinct").unwrap();
    let mut left = agg.init();
    let mut right = agg.init();
    for i in 0..500i64 {
        agg.transition(&mut left, &[Value::Int(i)]).unwrap();
        agg.transition(&mut right, &[Value::Int(i + 250)]).unwrap();
    }
    agg.combine(&mut left, &right).unwrap();
    let Value::Int(estimate) = agg.finalize(&left).unwrap() else {
        panic!("expected integer estimate");
    };
    assert!((estimate - 750).abs() <= 40, "union estimate {estimate}");
}

#[test]
fn test_state_round_trips_through_datum() {
    for name in ["count", "sum", "min", "combinable_array_agg", "hll_count_distinct", "avg"] {
        let agg = lookup(name).unwrap();
        let state = feed(agg.as_ref(), &[Value::Int(4), Value::Int(9)]);
        let datum = agg.state_to_datum(&state).unwrap();
        let back = agg.datum_to_state(&datum).unwrap();
        assert_eq!(
            agg.finalize(&back).unwrap(),
            agg.finalize(&state).unwrap(),
            "{name} datum round trip"
        );
    }
}

#[test]
fn test_percentile_cont_interpolates() {
    let agg = lookup("combinable_percentile_cont").unwrap();
    let mut state = agg.init();
    for v in [10.0, 20.0, 30.0, 40.0] {
        agg.transition(&mut state, &[Value::Float(0.5), Value::Float(v)])
            .unwrap();
    }
    assert_eq!(agg.finalize(&state).unwrap(), Value::Float(25.0));
}

#[test]
fn test_hypothetical_rank_counts_lower_rows() {
    let agg = lookup("combinable_rank").unwrap();
    let mut state = agg.init();
    // rank(25) within group (order by v) over v in {10, 20, 30}
    for v in [10, 20, 30] {
        agg.transition(&mut state, &[Value::Int(25), Value::Int(v)])
            .unwrap();
    }
    assert_eq!(agg.finalize(&state).unwrap(), Value::Int(3));

    let dense = lookup("combinable_dense_rank").unwrap();
    let mut state = dense.init();
    for v in [10, 10, 20, 30] {
        dense
            .transition(&mut state, &[Value::Int(25), Value::Int(v)])
            .unwrap();
    }
    assert_eq!(dense.finalize(&state).unwrap(), Value::Int(3));
}

#[test]
fn test_combine_dummy_is_flagged() {
    let combine = lookup("combine").unwrap();
    assert!(combine.is_combine());
    assert!(!lookup("sum").unwrap().is_combine());
}

#[test]
fn test_signature_lookup_finds_underlying_aggregate() {
    let sum = lookup("sum").unwrap();
    let found = lookup_combine_target(
        &sum.combinefn(),
        &sum.finalfn(),
        &sum.serializefn(),
        &sum.deserializefn(),
    )
    .expect("signature lookup");
    assert_eq!(found.name(), "sum");
}
