use freshet_common::tuple::{Column, TupleDesc};
use freshet_common::value::DataType;
use freshet_sql::analyze::{ProcType, SchemaProvider, validate_cont_query};
use freshet_sql::options::apply_sliding_window;
use freshet_sql::plan::{CombinerColumn, WorkerTarget, compile_combiner, compile_overlay, compile_worker};
use freshet_sql::rewrite::{TransformResult, transform_select_for_cont_process};

struct TestSchema;

impl SchemaProvider for TestSchema {
    fn is_stream(&self, name: &str) -> bool {
        name == "s"
    }

    fn relation_exists(&self, name: &str) -> bool {
        name == "t"
    }

    fn stream_desc(&self, name: &str) -> Option<TupleDesc> {
        self.is_stream(name).then(|| {
            TupleDesc::new(vec![
                Column::new("x", DataType::Int),
                Column::new("y", DataType::Int),
            ])
            .with_arrival_timestamp()
        })
    }

    fn has_index(&self, _table: &str, _column: &str) -> bool {
        true
    }
}

fn transform(sql: &str, proc_type: ProcType) -> TransformResult {
    let analysis = validate_cont_query(sql, &TestSchema).expect("analysis");
    transform_select_for_cont_process(&analysis, "v_mrel", 5.0, proc_type).expect("transform")
}

#[test]
fn test_worker_keeps_grouping_and_names_targets() {
    let out = transform("SELECT x::int, count(*) FROM s GROUP BY x", ProcType::Worker);
    let sql = out.proc.to_sql();
    assert!(sql.contains("count(*) AS count"), "{sql}");
    assert!(sql.contains("AS x"), "{sql}");
    assert!(sql.contains("GROUP BY x"), "{sql}");
    assert!(sql.contains("FROM s"), "{sql}");
}

#[test]
fn test_combiner_reads_matrel_and_combines() {
    let out = transform("SELECT x::int, count(*) FROM s GROUP BY x", ProcType::Combiner);
    let sql = out.proc.to_sql();
    assert!(sql.contains("FROM v_mrel"), "{sql}");
    assert!(sql.contains("combine(count)"), "{sql}");
    assert!(sql.to_lowercase().contains("group by x"), "{sql}");
    // the combiner never re-filters
    assert!(!sql.to_uppercase().contains("WHERE"), "{sql}");
}

#[test]
fn test_overlay_references_matrel_columns() {
    let out = transform("SELECT x::int, count(*) FROM s GROUP BY x", ProcType::Worker);
    let sql = out.view.to_sql();
    assert!(sql.contains("FROM v_mrel"), "{sql}");
    assert!(sql.contains("x AS x"), "{sql}");
    assert!(sql.contains("count AS count"), "{sql}");
}

#[test]
fn test_count_distinct_substitutes_hll_variant() {
    let out = transform("SELECT count(DISTINCT x::int) FROM s", ProcType::Worker);
    let sql = out.proc.to_sql();
    assert!(sql.contains("hll_count_distinct(x::INT) AS count"), "{sql}");
    assert!(!sql.to_uppercase().contains("DISTINCT"), "{sql}");
}

#[test]
fn test_array_agg_variants() {
    let plain = transform("SELECT array_agg(x::int) FROM s", ProcType::Worker)
        .proc
        .to_sql();
    assert!(plain.contains("combinable_array_agg"), "{plain}");

    let distinct = transform("SELECT array_agg(DISTINCT x::int) FROM s", ProcType::Worker)
        .proc
        .to_sql();
    assert!(distinct.contains("set_agg"), "{distinct}");
}

#[test]
fn test_within_group_flattens_into_arguments() {
    let out = transform(
        "SELECT percentile_cont(0.5) WITHIN GROUP (ORDER BY x::int) FROM s",
        ProcType::Worker,
    );
    let sql = out.proc.to_sql();
    assert!(
        sql.contains("combinable_percentile_cont(0.5, x::INT)"),
        "{sql}"
    );
    assert!(!sql.to_uppercase().contains("WITHIN GROUP"), "{sql}");
}

#[test]
fn test_expression_over_aggregate_is_hoisted() {
    let out = transform(
        "SELECT x::int, sum(y::int) / count(*) AS ratio FROM s GROUP BY x",
        ProcType::Worker,
    );
    let worker_sql = out.proc.to_sql();
    // both aggregates land in the worker under internal names
    assert!(worker_sql.contains("sum(y::INT)"), "{worker_sql}");
    assert!(worker_sql.contains("count(*)"), "{worker_sql}");

    let view_sql = out.view.to_sql();
    assert!(view_sql.contains("/"), "{view_sql}");
    assert!(view_sql.contains("AS ratio"), "{view_sql}");
}

#[test]
fn test_distinct_becomes_grouping() {
    let out = transform("SELECT DISTINCT x::int, y::int FROM s", ProcType::Worker);
    let sql = out.proc.to_sql();
    assert!(sql.to_lowercase().contains("group by"), "{sql}");
    assert!(!out.proc.group_by.is_empty());
    assert!(!out.view.distinct_on.is_empty());
}

#[test]
fn test_sliding_window_truncates_timestamp() {
    let body = apply_sliding_window("SELECT count(*) FROM s", "10 seconds", None).unwrap();
    let out = transform(&body, ProcType::Worker);
    let worker_sql = out.proc.to_sql();
    assert!(worker_sql.contains("date_round(arrival_timestamp"), "{worker_sql}");
    assert!(worker_sql.to_lowercase().contains("group by date_round"), "{worker_sql}");
    // worker still filters stale tuples on ingest
    assert!(worker_sql.to_uppercase().contains("WHERE"), "{worker_sql}");

    // the overlay merges across buckets and re-applies the predicate
    let view_sql = out.view.to_sql();
    assert!(view_sql.contains("combine(count)"), "{view_sql}");
    assert!(view_sql.contains("clock_timestamp()"), "{view_sql}");
    assert!(out.view.group_by.is_empty(), "global aggregate merges all buckets");
    assert!(out.view_combines);
    assert_eq!(out.sw_time_col.as_deref(), Some("arrival_timestamp"));
}

#[test]
fn test_sliding_window_with_grouping_keeps_user_group_in_view() {
    let body =
        apply_sliding_window("SELECT x::int, count(*) FROM s GROUP BY x", "1 minute", None)
            .unwrap();
    let out = transform(&body, ProcType::Worker);
    assert_eq!(out.view.group_by.len(), 1, "user group only");
    let combiner = transform(&body, ProcType::Combiner);
    // combiner groups by both the user group and the bucket
    assert_eq!(combiner.proc.group_by.len(), 2);
}

#[test]
fn test_sliding_window_without_aggregates_passes_through() {
    let body = apply_sliding_window("SELECT x::int FROM s", "10 seconds", None).unwrap();
    let out = transform(&body, ProcType::Worker);
    assert!(!out.view_combines);
    let sql = out.proc.to_sql();
    // the raw timestamp is hoisted, not truncated
    assert!(!sql.contains("date_round"), "{sql}");
}

#[test]
fn test_rewrite_is_idempotent() {
    for proc_type in [ProcType::Worker, ProcType::Combiner] {
        let sql = "SELECT x::int, count(*) FROM s GROUP BY x";
        let first = transform(sql, proc_type);
        let second = transform(sql, proc_type);
        assert_eq!(first.proc.to_sql(), second.proc.to_sql());
        assert_eq!(first.view.to_sql(), second.view.to_sql());
    }
}

#[test]
fn test_analyzer_accepts_applied_sliding_window() {
    // the predicate apply_sliding_window generates must satisfy the
    // analyzer's own placement rules
    let body = apply_sliding_window("SELECT count(*) FROM s", "30 seconds", Some("arrival_timestamp"))
        .unwrap();
    let analysis = validate_cont_query(&body, &TestSchema).unwrap();
    assert!(analysis.is_sw);
    assert_eq!(analysis.sw_interval_us, Some(30_000_000));
}

#[test]
fn test_plans_compile_end_to_end() {
    let out = transform("SELECT x::int, count(*) FROM s GROUP BY x", ProcType::Worker);
    let combiner_t = transform("SELECT x::int, count(*) FROM s GROUP BY x", ProcType::Combiner);

    let worker = compile_worker(&out.proc.to_sql(), &|n| n == "s").unwrap();
    assert_eq!(worker.targets.len(), 2);
    assert!(matches!(worker.targets[0], WorkerTarget::Scalar { .. }));
    assert!(matches!(worker.targets[1], WorkerTarget::Agg { .. }));

    let combiner = compile_combiner(&combiner_t.proc.to_sql(), &worker).unwrap();
    assert_eq!(combiner.group_idxs, vec![0]);
    assert!(matches!(
        combiner.columns[1].1,
        CombinerColumn::Combine { idx: 1, .. }
    ));

    let overlay = compile_overlay(&out.view.to_sql(), &worker, false).unwrap();
    assert_eq!(overlay.targets.len(), 2);
}

#[test]
fn test_constant_targets_reevaluated_in_combiner() {
    let out = transform("SELECT 1 AS const_ref, count(*) FROM s", ProcType::Combiner);
    let sql = out.proc.to_sql();
    // the constant must not be referenced as an ungrouped column
    assert!(sql.contains("1 AS const_ref"), "{sql}");
}
