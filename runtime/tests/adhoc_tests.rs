use freshet_common::settings::Settings;
use freshet_common::value::{DataType, Value};
use freshet_runtime::adhoc::AdhocEvent;
use freshet_runtime::engine::{Engine, EngineOptions};
use std::sync::Arc;
use std::time::Duration;

fn adhoc_engine() -> Arc<Engine> {
    let settings = Settings {
        max_wait_ms: 5,
        adhoc_heartbeat_ms: 50,
        ..Settings::default()
    };
    Engine::new(EngineOptions {
        settings,
        ..EngineOptions::default()
    })
    .expect("engine")
}

/// Pulls events until a row batch arrives or the deadline passes.
async fn next_rows(query: &mut freshet_runtime::adhoc::AdhocQuery) -> Option<Vec<Vec<Value>>> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, query.events.recv()).await {
            Ok(Some(AdhocEvent::Rows(rows))) => {
                return Some(rows.into_iter().map(|r| r.values).collect());
            }
            Ok(Some(AdhocEvent::Heartbeat)) => continue,
            Ok(None) => return None,
            Err(_) => return None,
        }
    }
}

/// Keeps pulling row batches until one satisfies the predicate; batches may
/// split across microbatch boundaries.
async fn wait_for_rows(
    query: &mut freshet_runtime::adhoc::AdhocQuery,
    pred: impl Fn(&[Vec<Value>]) -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        match next_rows(query).await {
            Some(rows) if pred(&rows) => return true,
            Some(_) => continue,
            None => return false,
        }
    }
    false
}

#[tokio::test]
async fn test_adhoc_streams_incremental_counts() {
    let engine = adhoc_engine();
    engine
        .create_stream("s", vec![("x".to_owned(), DataType::Int)])
        .unwrap();

    let mut query = engine
        .exec_adhoc_query("SELECT count(*) FROM s")
        .await
        .unwrap();
    assert_eq!(query.desc.columns.len(), 1);

    engine
        .insert("s", &["x"], vec![vec![Value::Int(1)]])
        .await
        .unwrap();
    assert!(
        wait_for_rows(&mut query, |rows| rows == [vec![Value::Int(1)]]).await,
        "count should reach 1"
    );

    engine
        .insert(
            "s",
            &["x"],
            vec![vec![Value::Int(2)], vec![Value::Int(3)]],
        )
        .await
        .unwrap();
    assert!(
        wait_for_rows(&mut query, |rows| rows == [vec![Value::Int(3)]]).await,
        "count should reach 3"
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn test_adhoc_heartbeats_flow_while_idle() {
    let engine = adhoc_engine();
    engine
        .create_stream("s", vec![("x".to_owned(), DataType::Int)])
        .unwrap();

    let mut query = engine
        .exec_adhoc_query("SELECT count(*) FROM s")
        .await
        .unwrap();

    let mut beats = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while beats < 3 && tokio::time::Instant::now() < deadline {
        if let Ok(Some(AdhocEvent::Heartbeat)) =
            tokio::time::timeout(Duration::from_millis(500), query.events.recv()).await
        {
            beats += 1;
        }
    }
    assert!(beats >= 3, "heartbeats should keep flowing with no input");

    engine.shutdown().await;
}

#[tokio::test]
async fn test_adhoc_grouped_query_updates_changed_groups() {
    let engine = adhoc_engine();
    engine
        .create_stream("s", vec![("x".to_owned(), DataType::Int)])
        .unwrap();

    let mut query = engine
        .exec_adhoc_query("SELECT x::int, count(*) FROM s GROUP BY x")
        .await
        .unwrap();

    engine
        .insert("s", &["x"], vec![vec![Value::Int(1)], vec![Value::Int(1)]])
        .await
        .unwrap();
    assert!(
        wait_for_rows(&mut query, |rows| {
            rows.contains(&vec![Value::Int(1), Value::Int(2)])
        })
        .await,
        "group (1, 2) should appear"
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn test_adhoc_cleanup_after_client_disconnect() {
    let engine = adhoc_engine();
    engine
        .create_stream("s", vec![("x".to_owned(), DataType::Int)])
        .unwrap();

    let query = engine
        .exec_adhoc_query("SELECT count(*) FROM s")
        .await
        .unwrap();
    let id = query.id;
    assert!(engine.core().adhoc.ids().contains(&id));

    // dropping the receiver kills the query at its next heartbeat
    drop(query);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!engine.core().adhoc.ids().contains(&id));

    engine.shutdown().await;
}
