use chrono::{TimeZone, Utc};
use freshet_common::settings::Settings;
use freshet_common::time::ManualClock;
use freshet_common::value::{DataType, Value};
use freshet_runtime::engine::{Engine, EngineOptions};
use std::sync::Arc;

fn sw_engine(clock: Arc<ManualClock>) -> Arc<Engine> {
    let settings = Settings {
        synchronous_stream_insert: true,
        max_wait_ms: 5,
        sw_vacuum_interval_ms: 50,
        ..Settings::default()
    };
    Engine::new(EngineOptions { settings, clock }).expect("engine")
}

#[tokio::test]
async fn test_sliding_window_count_expires() {
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(t0));
    let engine = sw_engine(clock.clone());

    engine
        .create_stream("s", vec![("x".to_owned(), DataType::Int)])
        .unwrap();
    engine
        .create_continuous_view(
            "v",
            "SELECT count(*) FROM s",
            &[("sw".to_owned(), "10 seconds".to_owned())],
        )
        .unwrap();

    engine
        .insert("s", &["x"], vec![vec![Value::Int(1)]])
        .await
        .unwrap();
    clock.advance_micros(5_000_000);
    engine
        .insert("s", &["x"], vec![vec![Value::Int(2)]])
        .await
        .unwrap();

    // read at T+6: both tuples inside the window
    clock.advance_micros(1_000_000);
    let result = engine.query_view("v").unwrap();
    assert_eq!(result.rows[0].values[0], Value::Int(2));

    // read at T+12: the first tuple has aged out
    clock.advance_micros(6_000_000);
    let result = engine.query_view("v").unwrap();
    assert_eq!(result.rows[0].values[0], Value::Int(1));

    // read at T+20: nothing remains
    clock.advance_micros(8_000_000);
    let result = engine.query_view("v").unwrap();
    assert!(
        result.rows.is_empty()
            || result.rows[0].values[0] == Value::Int(0),
        "expected empty window, got {:?}",
        result.rows
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn test_vacuum_deletes_expired_matrel_rows() {
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(t0));
    let engine = sw_engine(clock.clone());

    engine
        .create_stream("s", vec![("x".to_owned(), DataType::Int)])
        .unwrap();
    engine
        .create_continuous_view(
            "v",
            "SELECT count(*) FROM s",
            &[("sw".to_owned(), "2 seconds".to_owned())],
        )
        .unwrap();

    engine
        .insert("s", &["x"], vec![vec![Value::Int(1)], vec![Value::Int(2)]])
        .await
        .unwrap();

    let cv = engine.core().cache.query_by_name("v").unwrap();
    assert!(engine.core().matrels.len(cv.matrel) >= 1);

    // move past the window and give the vacuum ticker a few periods
    clock.advance_micros(10_000_000);
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;

    assert_eq!(
        engine.core().matrels.len(cv.matrel),
        0,
        "expired rows must be garbage collected"
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn test_sliding_window_with_grouping_merges_buckets_per_group() {
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(t0));
    let engine = sw_engine(clock.clone());

    engine
        .create_stream("s", vec![("x".to_owned(), DataType::Int)])
        .unwrap();
    engine
        .create_continuous_view(
            "v",
            "SELECT x::int, count(*) FROM s GROUP BY x",
            &[("sw".to_owned(), "1 minute".to_owned())],
        )
        .unwrap();

    // rows for the same group land in different buckets
    engine
        .insert("s", &["x"], vec![vec![Value::Int(7)]])
        .await
        .unwrap();
    clock.advance_micros(10_000_000);
    engine
        .insert("s", &["x"], vec![vec![Value::Int(7)], vec![Value::Int(8)]])
        .await
        .unwrap();

    let result = engine.query("SELECT * FROM v ORDER BY x").unwrap();
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.rows[0].values, vec![Value::Int(7), Value::Int(2)]);
    assert_eq!(result.rows[1].values, vec![Value::Int(8), Value::Int(1)]);

    // the matrel keeps one row per (group, bucket)
    let cv = engine.core().cache.query_by_name("v").unwrap();
    assert!(engine.core().matrels.len(cv.matrel) >= 3);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_view_change_hooks_fire_on_expiry() {
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(t0));
    let engine = sw_engine(clock.clone());

    engine
        .create_stream("s", vec![("x".to_owned(), DataType::Int)])
        .unwrap();
    engine
        .create_continuous_view(
            "v",
            "SELECT count(*) FROM s",
            &[("sw".to_owned(), "2 seconds".to_owned())],
        )
        .unwrap();

    let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = fired.clone();
    engine
        .register_view_change_hook(
            "v",
            Arc::new(move |_old, _new| {
                counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }),
        )
        .unwrap();

    engine
        .insert("s", &["x"], vec![vec![Value::Int(1)]])
        .await
        .unwrap();
    assert!(fired.load(std::sync::atomic::Ordering::Relaxed) >= 1, "insert fires the hook");

    clock.advance_micros(10_000_000);
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    assert!(
        fired.load(std::sync::atomic::Ordering::Relaxed) >= 2,
        "expiry fires the hook again"
    );

    engine.shutdown().await;
}
