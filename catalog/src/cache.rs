use crate::store::{CatalogRelation, CatalogStore};
use crate::types::{CombineRow, ContQueryRow, QueryId, RelId, StreamRow};
use freshet_common::hash::hash_group;
use freshet_common::value::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One logical index on a catalog table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheId {
    QueryById,
    QueryByName,
    QueryByMatrel,
    QueryByOsrel,
    StreamByRelid,
    StreamByName,
    CombineBySignature,
}

impl CacheId {
    fn relation(self) -> CatalogRelation {
        match self {
            CacheId::QueryById
            | CacheId::QueryByName
            | CacheId::QueryByMatrel
            | CacheId::QueryByOsrel => CatalogRelation::PipelineQuery,
            CacheId::StreamByRelid | CacheId::StreamByName => CatalogRelation::PipelineStream,
            CacheId::CombineBySignature => CatalogRelation::PipelineCombine,
        }
    }
}

/// A cached catalog tuple. `None` entries are negative cache hits.
#[derive(Debug, Clone)]
pub enum CatalogTuple {
    Query(Arc<ContQueryRow>),
    Stream(Arc<StreamRow>),
    Combine(Arc<CombineRow>),
}

struct Entry {
    valid: bool,
    keys: Vec<Value>,
    tuple: Option<CatalogTuple>,
}

#[derive(Default)]
struct CacheTable {
    seen_version: u64,
    buckets: HashMap<u64, Vec<Entry>>,
}

/// Per-process cache over the catalog store. Lookups take variadic datum
/// keys hashed with the group hash; misses fall through to a direct scan and
/// cache the result, including NULL tuples. A write to a catalog relation
/// bumps its version, which flips every derived entry invalid on the next
/// lookup.
pub struct CatalogCache {
    store: Arc<CatalogStore>,
    tables: Mutex<HashMap<CacheId, CacheTable>>,
}

impl CatalogCache {
    pub fn new(store: Arc<CatalogStore>) -> Self {
        Self {
            store,
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<CatalogStore> {
        &self.store
    }

    /// Read-only, idempotent keyed lookup.
    pub fn lookup(&self, id: CacheId, keys: &[Value]) -> Option<CatalogTuple> {
        let version = self.store.version(id.relation());
        let hash = hash_group(keys);

        let mut tables = self.tables.lock().expect("catalog cache poisoned");
        let table = tables.entry(id).or_default();

        if table.seen_version != version {
            for bucket in table.buckets.values_mut() {
                for entry in bucket.iter_mut() {
                    entry.valid = false;
                }
            }
            table.seen_version = version;
        }

        let bucket = table.buckets.entry(hash).or_default();
        if let Some(entry) = bucket
            .iter()
            .find(|e| e.valid && keys_eq(&e.keys, keys))
        {
            return entry.tuple.clone();
        }

        let tuple = self.scan(id, keys);
        bucket.retain(|e| !keys_eq(&e.keys, keys));
        bucket.push(Entry {
            valid: true,
            keys: keys.to_vec(),
            tuple: tuple.clone(),
        });
        tuple
    }

    fn scan(&self, id: CacheId, keys: &[Value]) -> Option<CatalogTuple> {
        match id {
            CacheId::QueryById => {
                let qid = keys.first()?.as_int()? as QueryId;
                self.store
                    .query_by_id(qid)
                    .map(|q| CatalogTuple::Query(Arc::new(q)))
            }
            CacheId::QueryByName => {
                let name = keys.first()?.as_text()?.to_owned();
                self.store
                    .query_by_name(&name)
                    .map(|q| CatalogTuple::Query(Arc::new(q)))
            }
            CacheId::QueryByMatrel => {
                let relid = keys.first()?.as_int()? as RelId;
                self.store
                    .query_by_matrel(relid)
                    .map(|q| CatalogTuple::Query(Arc::new(q)))
            }
            CacheId::QueryByOsrel => {
                let relid = keys.first()?.as_int()? as RelId;
                self.store
                    .query_by_osrel(relid)
                    .map(|q| CatalogTuple::Query(Arc::new(q)))
            }
            CacheId::StreamByRelid => {
                let relid = keys.first()?.as_int()? as RelId;
                self.store
                    .stream_by_relid(relid)
                    .map(|s| CatalogTuple::Stream(Arc::new(s)))
            }
            CacheId::StreamByName => {
                let name = keys.first()?.as_text()?.to_owned();
                self.store
                    .stream_by_name(&name)
                    .map(|s| CatalogTuple::Stream(Arc::new(s)))
            }
            CacheId::CombineBySignature => {
                if keys.len() != 4 {
                    return None;
                }
                let combinefn = keys[0].as_text()?;
                let finalfn = keys[1].as_text()?;
                let serializefn = keys[2].as_text()?;
                let deserializefn = keys[3].as_text()?;
                self.store
                    .combine_by_signature(combinefn, finalfn, serializefn, deserializefn)
                    .map(|c| CatalogTuple::Combine(Arc::new(c)))
            }
        }
    }

    /// Convenience accessor: CV by name through the cache.
    pub fn query_by_name(&self, name: &str) -> Option<Arc<ContQueryRow>> {
        match self.lookup(CacheId::QueryByName, &[Value::from(name)]) {
            Some(CatalogTuple::Query(q)) => Some(q),
            _ => None,
        }
    }

    /// Convenience accessor: CV by id through the cache.
    pub fn query_by_id(&self, id: QueryId) -> Option<Arc<ContQueryRow>> {
        match self.lookup(CacheId::QueryById, &[Value::Int(i64::from(id))]) {
            Some(CatalogTuple::Query(q)) => Some(q),
            _ => None,
        }
    }

    /// Convenience accessor: stream by name through the cache.
    pub fn stream_by_name(&self, name: &str) -> Option<Arc<StreamRow>> {
        match self.lookup(CacheId::StreamByName, &[Value::from(name)]) {
            Some(CatalogTuple::Stream(s)) => Some(s),
            _ => None,
        }
    }

    /// Convenience accessor: stream by relation id through the cache.
    pub fn stream_by_relid(&self, relid: RelId) -> Option<Arc<StreamRow>> {
        match self.lookup(CacheId::StreamByRelid, &[Value::Int(i64::from(relid))]) {
            Some(CatalogTuple::Stream(s)) => Some(s),
            _ => None,
        }
    }
}

fn keys_eq(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.group_eq(y))
}
