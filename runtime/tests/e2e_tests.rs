use freshet_common::settings::Settings;
use freshet_common::value::{DataType, Value};
use freshet_runtime::engine::{Engine, EngineOptions};
use std::sync::{Arc, Mutex};

fn test_engine() -> Arc<Engine> {
    let settings = Settings {
        synchronous_stream_insert: true,
        max_wait_ms: 5,
        ..Settings::default()
    };
    Engine::new(EngineOptions {
        settings,
        ..EngineOptions::default()
    })
    .expect("engine")
}

fn ints(rows: &[Vec<i64>]) -> Vec<Vec<Value>> {
    rows.iter()
        .map(|r| r.iter().map(|i| Value::Int(*i)).collect())
        .collect()
}

#[tokio::test]
async fn test_grouped_count_matches_batch_semantics() {
    let engine = test_engine();
    engine
        .create_stream("s", vec![("x".to_owned(), DataType::Int)])
        .unwrap();
    engine
        .create_continuous_view("v", "SELECT x::int, count(*) FROM s GROUP BY x", &[])
        .unwrap();

    engine
        .insert("s", &["x"], ints(&[vec![1], vec![1], vec![2]]))
        .await
        .unwrap();

    let result = engine.query("SELECT * FROM v ORDER BY x").unwrap();
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.rows[0].values, vec![Value::Int(1), Value::Int(2)]);
    assert_eq!(result.rows[1].values, vec![Value::Int(2), Value::Int(1)]);

    // more rows fold in without recomputation from scratch
    engine
        .insert("s", &["x"], ints(&[vec![2], vec![3]]))
        .await
        .unwrap();
    let result = engine.query("SELECT * FROM v ORDER BY x").unwrap();
    assert_eq!(result.rows.len(), 3);
    assert_eq!(result.rows[1].values, vec![Value::Int(2), Value::Int(2)]);
    assert_eq!(result.rows[2].values, vec![Value::Int(3), Value::Int(1)]);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_at_most_one_matrel_row_per_group() {
    let engine = test_engine();
    engine
        .create_stream("s", vec![("x".to_owned(), DataType::Int)])
        .unwrap();
    engine
        .create_continuous_view("v", "SELECT x::int, count(*) FROM s GROUP BY x", &[])
        .unwrap();

    for _ in 0..5 {
        engine
            .insert("s", &["x"], ints(&[vec![1], vec![2], vec![1]]))
            .await
            .unwrap();
    }

    let cv = engine.core().cache.query_by_name("v").unwrap();
    assert_eq!(engine.core().matrels.len(cv.matrel), 2);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_count_distinct_uses_hll_within_error_bound() {
    let engine = test_engine();
    engine
        .create_stream("s", vec![("x".to_owned(), DataType::Int)])
        .unwrap();
    engine
        .create_continuous_view("v", "SELECT count(DISTINCT x::int) FROM s", &[])
        .unwrap();

    // 10k rows over 1000 distinct values, in chunks
    for chunk in 0..10 {
        let rows: Vec<Vec<Value>> = (0..1000)
            .map(|i| vec![Value::Int((chunk * 997 + i) % 1000)])
            .collect();
        engine.insert("s", &["x"], rows).await.unwrap();
    }

    let result = engine.query_view("v").unwrap();
    let Value::Int(estimate) = result.rows[0].values[0] else {
        panic!("expected integer count, got {:?}", result.rows[0].values[0]);
    };
    assert!(
        (estimate - 1000).abs() <= 50,
        "hll estimate {estimate} outside the documented error bound"
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn test_combine_concatenates_per_group_arrays() {
    let engine = test_engine();
    engine
        .create_stream(
            "s",
            vec![
                ("g".to_owned(), DataType::Int),
                ("x".to_owned(), DataType::Int),
            ],
        )
        .unwrap();
    engine
        .create_continuous_view(
            "v",
            "SELECT g::int, array_agg(x::int) AS agg FROM s GROUP BY g",
            &[],
        )
        .unwrap();

    engine
        .insert("s", &["g", "x"], ints(&[vec![1, 10], vec![1, 20], vec![2, 30]]))
        .await
        .unwrap();

    let result = engine.query("SELECT combine(agg) FROM v").unwrap();
    assert_eq!(result.rows.len(), 1);
    let Value::Array(items) = &result.rows[0].values[0] else {
        panic!("expected an array, got {:?}", result.rows[0].values[0]);
    };
    let mut got: Vec<i64> = items.iter().filter_map(Value::as_int).collect();
    got.sort_unstable();
    assert_eq!(got, vec![10, 20, 30]);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cv_over_output_stream_combines_upstream_states() {
    let engine = test_engine();
    engine
        .create_stream("s", vec![("x".to_owned(), DataType::Int)])
        .unwrap();
    engine
        .create_continuous_view("v1", "SELECT x::int, count(*) FROM s GROUP BY x", &[])
        .unwrap();
    // a downstream view reading v1's deltas; the resolver follows the
    // combine through the output-stream column to v1's count
    engine
        .create_continuous_view(
            "v2",
            "SELECT combine((new).count) AS total FROM v1_osrel",
            &[],
        )
        .unwrap();

    engine
        .insert("s", &["x"], ints(&[vec![1], vec![1], vec![2]]))
        .await
        .unwrap();

    // the delta hop through v1's output stream is asynchronous
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    let mut total = None;
    while tokio::time::Instant::now() < deadline {
        let result = engine.query_view("v2").unwrap();
        if let Some(row) = result.rows.first() {
            total = row.values.first().and_then(Value::as_int);
            if total == Some(3) {
                break;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(total, Some(3), "v2 should combine v1's delta states");

    engine.shutdown().await;
}

#[tokio::test]
async fn test_combine_over_plain_stream_rejected_at_definition() {
    let engine = test_engine();
    engine
        .create_stream("s", vec![("x".to_owned(), DataType::Int)])
        .unwrap();

    let err = engine
        .create_continuous_view("bad", "SELECT combine(x) FROM s", &[])
        .unwrap_err();
    assert!(
        err.to_string()
            .contains("combine() argument must be a continuous view aggregate column"),
        "{err}"
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn test_synchronous_insert_reaches_every_reader() {
    let engine = test_engine();
    engine
        .create_stream("s", vec![("x".to_owned(), DataType::Int)])
        .unwrap();
    engine
        .create_continuous_view("v1", "SELECT count(*) FROM s", &[])
        .unwrap();
    engine
        .create_continuous_view("v2", "SELECT sum(x::int) FROM s", &[])
        .unwrap();

    engine
        .insert("s", &["x"], ints(&[vec![1], vec![2], vec![3]]))
        .await
        .unwrap();

    // the acknowledged insert must already be visible in both views
    let v1 = engine.query_view("v1").unwrap();
    assert_eq!(v1.rows[0].values[0], Value::Int(3));
    let v2 = engine.query_view("v2").unwrap();
    assert_eq!(v2.rows[0].values[0], Value::Int(6));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_stream_table_join() {
    let engine = test_engine();
    engine
        .create_stream("s", vec![("x".to_owned(), DataType::Int)])
        .unwrap();
    engine
        .create_table(
            "t",
            vec![
                ("id".to_owned(), DataType::Int),
                ("name".to_owned(), DataType::Text),
            ],
        )
        .unwrap();
    engine.create_table_index("t", "id").unwrap();
    engine
        .insert_table(
            "t",
            vec![
                vec![Value::Int(1), Value::from("one")],
                vec![Value::Int(2), Value::from("two")],
            ],
        )
        .unwrap();

    engine
        .create_continuous_view(
            "v",
            "SELECT t.name, count(*) FROM s JOIN t ON s.x::int = t.id GROUP BY t.name",
            &[],
        )
        .unwrap();

    engine
        .insert("s", &["x"], ints(&[vec![1], vec![1], vec![2], vec![9]]))
        .await
        .unwrap();

    let result = engine.query("SELECT * FROM v ORDER BY name").unwrap();
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.rows[0].values, vec![Value::from("one"), Value::Int(2)]);
    assert_eq!(result.rows[1].values, vec![Value::from("two"), Value::Int(1)]);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_distinct_view_dedups() {
    let engine = test_engine();
    engine
        .create_stream("s", vec![("x".to_owned(), DataType::Int)])
        .unwrap();
    engine
        .create_continuous_view("v", "SELECT DISTINCT x::int FROM s", &[])
        .unwrap();

    engine
        .insert("s", &["x"], ints(&[vec![1], vec![1], vec![2], vec![2], vec![2]]))
        .await
        .unwrap();

    let result = engine.query("SELECT * FROM v ORDER BY x").unwrap();
    assert_eq!(result.rows.len(), 2);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_transform_routes_rows_to_output_function() {
    let engine = test_engine();
    engine
        .create_stream("s", vec![("x".to_owned(), DataType::Int)])
        .unwrap();

    let captured: Arc<Mutex<Vec<Vec<Value>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();
    engine.register_output_func(
        "capture",
        Arc::new(move |_desc, rows| {
            let mut held = sink.lock().unwrap();
            for row in rows {
                held.push(row.values.clone());
            }
        }),
    );
    engine
        .create_continuous_transform("tr", "SELECT x::int FROM s", Some("capture"))
        .unwrap();

    engine
        .insert("s", &["x"], ints(&[vec![5], vec![7]]))
        .await
        .unwrap();

    // transforms have no matrel to acknowledge against, so give the worker
    // a moment to flush
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let held = captured.lock().unwrap().clone();
    assert_eq!(held, vec![vec![Value::Int(5)], vec![Value::Int(7)]]);

    assert!(engine.query_view("tr").is_err());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_reading_a_stream_directly_is_rejected() {
    let engine = test_engine();
    engine
        .create_stream("s", vec![("x".to_owned(), DataType::Int)])
        .unwrap();
    let err = engine.query("SELECT x FROM s").unwrap_err();
    assert!(
        err.to_string()
            .contains("streams can only be read from a continuous view's FROM clause"),
        "{err}"
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn test_drop_view_cascades() {
    let engine = test_engine();
    engine
        .create_stream("s", vec![("x".to_owned(), DataType::Int)])
        .unwrap();
    engine
        .create_continuous_view("v", "SELECT count(*) FROM s", &[])
        .unwrap();

    engine.insert("s", &["x"], ints(&[vec![1]])).await.unwrap();
    engine.drop_continuous_view("v").unwrap();

    assert!(engine.query_view("v").is_err());
    // the stream no longer has readers, so inserts are no-ops
    let count = engine.insert("s", &["x"], ints(&[vec![1]])).await.unwrap();
    assert_eq!(count, 0);
    engine.drop_stream("s").unwrap();

    engine.shutdown().await;
}

#[tokio::test]
async fn test_stats_surface_counts_executions() {
    let engine = test_engine();
    engine
        .create_stream("s", vec![("x".to_owned(), DataType::Int)])
        .unwrap();
    engine
        .create_continuous_view("v", "SELECT count(*) FROM s", &[])
        .unwrap();

    engine
        .insert("s", &["x"], ints(&[vec![1], vec![2]]))
        .await
        .unwrap();

    let procs = engine.proc_stats();
    assert!(procs.iter().any(|p| p.name.starts_with("worker")));
    assert!(procs.iter().any(|p| p.name.starts_with("combiner")));
    let worker = procs.iter().find(|p| p.name == "worker0").unwrap();
    assert!(worker.input_rows >= 2);

    let views = engine.query_stats();
    let v = views.iter().find(|r| r.name == "v").unwrap();
    assert!(v.input_rows >= 2);
    assert!(v.errors == 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_step_factor_option_validation() {
    let engine = test_engine();
    engine
        .create_stream("s", vec![("x".to_owned(), DataType::Int)])
        .unwrap();

    let err = engine
        .create_continuous_view(
            "v",
            "SELECT count(*) FROM s",
            &[
                ("sw".to_owned(), "10 seconds".to_owned()),
                ("step_factor".to_owned(), "0.25".to_owned()),
            ],
        )
        .unwrap_err();
    assert!(err.to_string().contains("step_factor"), "{err}");

    let err = engine
        .create_continuous_view(
            "v",
            "SELECT count(*) FROM s",
            &[("step_factor".to_owned(), "25".to_owned())],
        )
        .unwrap_err();
    assert!(
        err.to_string().contains("sliding window"),
        "step_factor without a window: {err}"
    );

    engine
        .create_continuous_view(
            "v",
            "SELECT count(*) FROM s",
            &[
                ("sw".to_owned(), "10 seconds".to_owned()),
                ("step_factor".to_owned(), "25".to_owned()),
            ],
        )
        .unwrap();

    engine.shutdown().await;
}
