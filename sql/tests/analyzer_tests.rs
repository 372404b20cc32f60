use freshet_common::tuple::{Column, TupleDesc};
use freshet_common::value::DataType;
use freshet_sql::analyze::{SchemaProvider, validate_cont_query};
use freshet_sql::error::AnalyzeError;

struct TestSchema;

impl SchemaProvider for TestSchema {
    fn is_stream(&self, name: &str) -> bool {
        matches!(name, "s" | "s2" | "clicks")
    }

    fn relation_exists(&self, name: &str) -> bool {
        matches!(name, "t" | "users")
    }

    fn stream_desc(&self, name: &str) -> Option<TupleDesc> {
        self.is_stream(name).then(|| {
            TupleDesc::new(vec![
                Column::new("x", DataType::Int),
                Column::new("y", DataType::Int),
                Column::new("ts", DataType::Timestamp),
            ])
            .with_arrival_timestamp()
        })
    }

    fn has_index(&self, _table: &str, column: &str) -> bool {
        column == "id"
    }
}

fn validate(sql: &str) -> Result<freshet_sql::analyze::ContAnalysis, AnalyzeError> {
    validate_cont_query(sql, &TestSchema)
}

#[test]
fn test_accepts_simple_grouped_aggregate() {
    let analysis = validate("SELECT x::int, count(*) FROM s GROUP BY x").unwrap();
    assert_eq!(analysis.stream, "s");
    assert!(analysis.has_aggs);
    assert!(!analysis.is_sw);
}

#[test]
fn test_rejects_ctes() {
    let err = validate("WITH w AS (SELECT 1) SELECT x::int FROM s").unwrap_err();
    assert!(matches!(err, AnalyzeError::CteNotSupported));
}

#[test]
fn test_rejects_having_and_order_by() {
    assert!(matches!(
        validate("SELECT count(*) FROM s GROUP BY x HAVING count(*) > 1").unwrap_err(),
        AnalyzeError::HavingNotSupported
    ));
    assert!(matches!(
        validate("SELECT x::int FROM s ORDER BY x").unwrap_err(),
        AnalyzeError::OrderByNotSupported
    ));
}

#[test]
fn test_rejects_window_functions() {
    assert!(matches!(
        validate("SELECT sum(x) OVER (PARTITION BY y) FROM s").unwrap_err(),
        AnalyzeError::WindowNotSupported
    ));
}

#[test]
fn test_rejects_wildcard_target() {
    assert!(matches!(
        validate("SELECT * FROM s").unwrap_err(),
        AnalyzeError::WildcardTarget(_)
    ));
}

#[test]
fn test_requires_exactly_one_stream() {
    assert!(matches!(
        validate("SELECT t.id FROM t").unwrap_err(),
        AnalyzeError::NoStream
    ));
    assert!(matches!(
        validate("SELECT s.x::int FROM s JOIN s2 ON s.x = s2.x").unwrap_err(),
        AnalyzeError::StreamStreamJoin(_)
    ));
}

#[test]
fn test_allows_stream_table_join() {
    let analysis =
        validate("SELECT s.x::int, t.id FROM s JOIN t ON s.x = t.id GROUP BY s.x, t.id").unwrap();
    assert_eq!(analysis.rels, vec!["t".to_owned()]);
}

#[test]
fn test_distinct_agg_only_for_count_and_array_agg() {
    assert!(validate("SELECT count(DISTINCT x) FROM s").is_ok());
    assert!(validate("SELECT array_agg(DISTINCT x) FROM s").is_ok());
    assert!(matches!(
        validate("SELECT sum(DISTINCT x) FROM s").unwrap_err(),
        AnalyzeError::DistinctAggNotSupported(_)
    ));
}

#[test]
fn test_sliding_window_classification() {
    let analysis = validate(
        "SELECT count(*) FROM s WHERE arrival_timestamp > clock_timestamp() - interval '10 seconds'",
    )
    .unwrap();
    assert!(analysis.is_sw);
    assert_eq!(analysis.sw_column.as_deref(), Some("arrival_timestamp"));
    assert_eq!(analysis.sw_interval_us, Some(10_000_000));
}

#[test]
fn test_sliding_window_mirrored_operands() {
    let analysis = validate(
        "SELECT count(*) FROM s WHERE clock_timestamp() - interval '5 seconds' < ts",
    )
    .unwrap();
    assert!(analysis.is_sw);
    assert_eq!(analysis.sw_column.as_deref(), Some("ts"));
}

#[test]
fn test_clock_timestamp_in_or_is_rejected() {
    let err = validate(
        "SELECT count(*) FROM s WHERE x::int = 1 OR arrival_timestamp > clock_timestamp() - interval '10 seconds'",
    )
    .unwrap_err();
    assert!(matches!(err, AnalyzeError::ClockTimestampPlacement));
}

#[test]
fn test_clock_timestamp_appears_at_most_once() {
    let err = validate(
        "SELECT count(*) FROM s WHERE arrival_timestamp > clock_timestamp() - interval '10 seconds' \
         AND ts > clock_timestamp() - interval '20 seconds'",
    )
    .unwrap_err();
    assert!(matches!(err, AnalyzeError::ClockTimestampCount));
}

#[test]
fn test_clock_timestamp_accepts_extra_conjuncts() {
    let analysis = validate(
        "SELECT count(*) FROM s WHERE x::int > 3 AND arrival_timestamp > clock_timestamp() - interval '10 seconds'",
    )
    .unwrap();
    assert!(analysis.is_sw);
}

#[test]
fn test_bad_window_operator_gets_hint() {
    let err = validate(
        "SELECT count(*) FROM s WHERE arrival_timestamp < clock_timestamp() - interval '10 seconds'",
    )
    .unwrap_err();
    let text = err.to_string();
    assert!(text.contains("sliding window expressions must look like"));
}

#[test]
fn test_sliding_window_rejects_distinct() {
    let err = validate(
        "SELECT DISTINCT x::int FROM s WHERE arrival_timestamp > clock_timestamp() - interval '10 seconds'",
    )
    .unwrap_err();
    assert!(matches!(err, AnalyzeError::SlidingWindowDistinct));
}

#[test]
fn test_reserved_arrival_timestamp_alias() {
    assert!(matches!(
        validate("SELECT x::int AS arrival_timestamp FROM s").unwrap_err(),
        AnalyzeError::ReservedColumn
    ));
    assert!(validate("SELECT arrival_timestamp FROM s").is_ok());
}

#[test]
fn test_subselect_restrictions() {
    assert!(validate("SELECT x FROM (SELECT x::int FROM s) sub").is_ok());
    let err = validate("SELECT c FROM (SELECT count(*) AS c FROM s) sub").unwrap_err();
    assert!(matches!(err, AnalyzeError::BadSubselect { .. }));
    let err = validate("SELECT x FROM (SELECT x::int FROM s ORDER BY x) sub").unwrap_err();
    assert!(matches!(err, AnalyzeError::BadSubselect { .. }));
}

#[test]
fn test_unknown_relation() {
    assert!(matches!(
        validate("SELECT x::int FROM nope").unwrap_err(),
        AnalyzeError::UnknownRelation(_)
    ));
}
