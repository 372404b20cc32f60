use freshet_catalog::cache::{CacheId, CatalogCache, CatalogTuple};
use freshet_catalog::store::CatalogStore;
use freshet_catalog::types::{CombineRow, ContAction, ContQueryRow};
use freshet_common::tuple::{Column, TupleDesc};
use freshet_common::value::{DataType, Value};
use std::sync::Arc;

fn sample_query(id: u32, name: &str, matrel: u32) -> ContQueryRow {
    ContQueryRow {
        id,
        name: name.to_owned(),
        defrel: 100 + id,
        query: "SELECT count(*) FROM s".to_owned(),
        matrel,
        matrel_name: format!("{name}_mrel"),
        osrel: 200 + id,
        osrel_name: format!("{name}_osrel"),
        seqrel: 300 + id,
        pk_index: 400 + id,
        lookup_index: 500 + id,
        worker_sql: "SELECT count(*) AS count FROM s".to_owned(),
        combiner_sql: format!("SELECT combine(count) AS count FROM {name}_mrel"),
        overlay_sql: format!("SELECT count AS count FROM {name}_mrel"),
        matrel_desc: TupleDesc::new(vec![Column::new("count", DataType::Int)]),
        group_cols: vec![],
        sw_step_factor: 0,
        sw_attno: None,
        sw_interval_us: None,
        ttl_us: None,
        ttl_attno: None,
        action: ContAction::Materialize,
        output_func: None,
        gc: false,
        active: true,
    }
}

#[test]
fn test_lookup_by_name_and_negative_caching() {
    let store = Arc::new(CatalogStore::new());
    let cache = CatalogCache::new(store.clone());

    // miss is cached as a NULL tuple
    assert!(cache.query_by_name("v").is_none());
    assert!(cache.query_by_name("v").is_none());

    store.define_query(sample_query(1, "v", 10)).unwrap();

    // the write invalidated the cache, so the next lookup sees the row
    let found = cache.query_by_name("v").expect("cached row");
    assert_eq!(found.id, 1);
    assert_eq!(found.matrel, 10);
}

#[test]
fn test_lookup_is_idempotent_and_keyed() {
    let store = Arc::new(CatalogStore::new());
    store.define_query(sample_query(1, "a", 11)).unwrap();
    store.define_query(sample_query(2, "b", 12)).unwrap();
    let cache = CatalogCache::new(store);

    for _ in 0..3 {
        assert_eq!(cache.query_by_id(1).unwrap().name, "a");
        assert_eq!(cache.query_by_id(2).unwrap().name, "b");
    }

    match cache.lookup(CacheId::QueryByMatrel, &[Value::Int(12)]) {
        Some(CatalogTuple::Query(q)) => assert_eq!(q.name, "b"),
        other => panic!("unexpected lookup result: {other:?}"),
    }
}

#[test]
fn test_invalidation_observed_after_delete() {
    let store = Arc::new(CatalogStore::new());
    store.define_query(sample_query(7, "gone", 70)).unwrap();
    let cache = CatalogCache::new(store.clone());

    assert!(cache.query_by_id(7).is_some());
    store.remove_query(7);
    assert!(cache.query_by_id(7).is_none());
}

#[test]
fn test_stream_readers_tracked() {
    let store = Arc::new(CatalogStore::new());
    let relid = store.allocate_relid();
    store
        .define_stream(
            relid,
            "s",
            TupleDesc::new(vec![Column::new("x", DataType::Int)]),
            false,
        )
        .unwrap();
    store.add_stream_reader(relid, 1).unwrap();
    store.add_stream_reader(relid, 2).unwrap();

    let cache = CatalogCache::new(store.clone());
    let stream = cache.stream_by_name("s").unwrap();
    assert_eq!(stream.readers.len(), 2);

    store.remove_stream_reader(relid, 1);
    let stream = cache.stream_by_name("s").unwrap();
    assert_eq!(stream.readers.len(), 1);
}

#[test]
fn test_combine_lookup_by_signature() {
    let store = Arc::new(CatalogStore::new());
    store.define_combine(CombineRow {
        combinefn: "sum_combine".to_owned(),
        finalfn: "sum_final".to_owned(),
        serializefn: String::new(),
        deserializefn: String::new(),
        combine_agg: "sum".to_owned(),
    });
    let cache = CatalogCache::new(store);

    let keys = [
        Value::from("sum_combine"),
        Value::from("sum_final"),
        Value::from(""),
        Value::from(""),
    ];
    match cache.lookup(CacheId::CombineBySignature, &keys) {
        Some(CatalogTuple::Combine(row)) => assert_eq!(row.combine_agg, "sum"),
        other => panic!("unexpected lookup result: {other:?}"),
    }

    let wrong = [
        Value::from("sum_combine"),
        Value::from("avg_final"),
        Value::from(""),
        Value::from(""),
    ];
    assert!(cache.lookup(CacheId::CombineBySignature, &wrong).is_none());
}

#[test]
fn test_duplicate_view_rejected() {
    let store = CatalogStore::new();
    store.define_query(sample_query(1, "v", 1)).unwrap();
    assert!(store.define_query(sample_query(2, "V", 2)).is_err());
}
