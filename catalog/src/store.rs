use crate::types::{CombineRow, ContQueryRow, QueryId, RelId, StreamRow};
use freshet_common::tuple::TupleDesc;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("stream \"{0}\" already exists")]
    DuplicateStream(String),
    #[error("continuous view \"{0}\" already exists")]
    DuplicateView(String),
    #[error("stream \"{0}\" does not exist")]
    UnknownStream(String),
    #[error("continuous view \"{0}\" does not exist")]
    UnknownView(String),
}

pub type Result<T> = std::result::Result<T, CatalogError>;

/// The catalog tables that carry continuous-query metadata. Any write to one
/// of them invalidates every cache table derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogRelation {
    PipelineQuery,
    PipelineStream,
    PipelineCombine,
}

impl CatalogRelation {
    fn index(self) -> usize {
        match self {
            CatalogRelation::PipelineQuery => 0,
            CatalogRelation::PipelineStream => 1,
            CatalogRelation::PipelineCombine => 2,
        }
    }
}

#[derive(Default)]
struct Inner {
    queries: BTreeMap<QueryId, ContQueryRow>,
    streams: BTreeMap<RelId, StreamRow>,
    combines: Vec<CombineRow>,
    next_query_id: QueryId,
    next_relid: RelId,
}

/// In-process stand-in for host catalog storage. Lookups are direct scans;
/// the cache in [`crate::cache`] sits in front of them.
pub struct CatalogStore {
    inner: RwLock<Inner>,
    versions: [AtomicU64; 3],
}

impl Default for CatalogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_query_id: 1,
                next_relid: 1,
                ..Inner::default()
            }),
            versions: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    /// Current invalidation version of a catalog relation.
    pub fn version(&self, rel: CatalogRelation) -> u64 {
        self.versions[rel.index()].load(Ordering::Acquire)
    }

    /// The relcache-invalidation analogue: every write path calls this so
    /// caches observe the change on their next lookup.
    fn invalidate(&self, rel: CatalogRelation) {
        self.versions[rel.index()].fetch_add(1, Ordering::AcqRel);
    }

    pub fn allocate_relid(&self) -> RelId {
        let mut inner = self.inner.write().expect("catalog poisoned");
        let id = inner.next_relid;
        inner.next_relid += 1;
        id
    }

    pub fn allocate_query_id(&self) -> QueryId {
        let mut inner = self.inner.write().expect("catalog poisoned");
        let id = inner.next_query_id;
        inner.next_query_id += 1;
        id
    }

    pub fn define_stream(
        &self,
        relid: RelId,
        name: &str,
        desc: TupleDesc,
        is_output: bool,
    ) -> Result<()> {
        let mut inner = self.inner.write().expect("catalog poisoned");
        if inner
            .streams
            .values()
            .any(|s| s.name.eq_ignore_ascii_case(name))
        {
            return Err(CatalogError::DuplicateStream(name.to_owned()));
        }
        debug!("defining stream {name} as relation {relid}");
        inner.streams.insert(
            relid,
            StreamRow {
                relid,
                name: name.to_owned(),
                desc,
                readers: Default::default(),
                is_output,
            },
        );
        drop(inner);
        self.invalidate(CatalogRelation::PipelineStream);
        Ok(())
    }

    pub fn drop_stream(&self, relid: RelId) {
        let mut inner = self.inner.write().expect("catalog poisoned");
        inner.streams.remove(&relid);
        drop(inner);
        self.invalidate(CatalogRelation::PipelineStream);
    }

    pub fn add_stream_reader(&self, relid: RelId, query: QueryId) -> Result<()> {
        let mut inner = self.inner.write().expect("catalog poisoned");
        let stream = inner
            .streams
            .get_mut(&relid)
            .ok_or_else(|| CatalogError::UnknownStream(relid.to_string()))?;
        stream.readers.insert(query);
        drop(inner);
        self.invalidate(CatalogRelation::PipelineStream);
        Ok(())
    }

    pub fn remove_stream_reader(&self, relid: RelId, query: QueryId) {
        let mut inner = self.inner.write().expect("catalog poisoned");
        if let Some(stream) = inner.streams.get_mut(&relid) {
            stream.readers.remove(&query);
        }
        drop(inner);
        self.invalidate(CatalogRelation::PipelineStream);
    }

    pub fn define_query(&self, row: ContQueryRow) -> Result<()> {
        let mut inner = self.inner.write().expect("catalog poisoned");
        if inner
            .queries
            .values()
            .any(|q| q.name.eq_ignore_ascii_case(&row.name))
        {
            return Err(CatalogError::DuplicateView(row.name));
        }
        debug!("defining continuous view {} with id {}", row.name, row.id);
        inner.queries.insert(row.id, row);
        drop(inner);
        self.invalidate(CatalogRelation::PipelineQuery);
        Ok(())
    }

    pub fn remove_query(&self, id: QueryId) {
        let mut inner = self.inner.write().expect("catalog poisoned");
        inner.queries.remove(&id);
        drop(inner);
        self.invalidate(CatalogRelation::PipelineQuery);
    }

    pub fn set_query_active(&self, id: QueryId, active: bool) {
        let mut inner = self.inner.write().expect("catalog poisoned");
        if let Some(q) = inner.queries.get_mut(&id) {
            q.active = active;
        }
        drop(inner);
        self.invalidate(CatalogRelation::PipelineQuery);
    }

    pub fn define_combine(&self, row: CombineRow) {
        let mut inner = self.inner.write().expect("catalog poisoned");
        inner.combines.push(row);
        drop(inner);
        self.invalidate(CatalogRelation::PipelineCombine);
    }

    pub fn query_by_id(&self, id: QueryId) -> Option<ContQueryRow> {
        self.inner
            .read()
            .expect("catalog poisoned")
            .queries
            .get(&id)
            .cloned()
    }

    pub fn query_by_name(&self, name: &str) -> Option<ContQueryRow> {
        self.inner
            .read()
            .expect("catalog poisoned")
            .queries
            .values()
            .find(|q| q.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn query_by_matrel(&self, relid: RelId) -> Option<ContQueryRow> {
        self.inner
            .read()
            .expect("catalog poisoned")
            .queries
            .values()
            .find(|q| q.matrel == relid)
            .cloned()
    }

    pub fn query_by_osrel(&self, relid: RelId) -> Option<ContQueryRow> {
        self.inner
            .read()
            .expect("catalog poisoned")
            .queries
            .values()
            .find(|q| q.osrel == relid)
            .cloned()
    }

    pub fn all_query_ids(&self) -> Vec<QueryId> {
        self.inner
            .read()
            .expect("catalog poisoned")
            .queries
            .keys()
            .copied()
            .collect()
    }

    pub fn stream_by_relid(&self, relid: RelId) -> Option<StreamRow> {
        self.inner
            .read()
            .expect("catalog poisoned")
            .streams
            .get(&relid)
            .cloned()
    }

    pub fn stream_by_name(&self, name: &str) -> Option<StreamRow> {
        self.inner
            .read()
            .expect("catalog poisoned")
            .streams
            .values()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn combine_by_signature(
        &self,
        combinefn: &str,
        finalfn: &str,
        serializefn: &str,
        deserializefn: &str,
    ) -> Option<CombineRow> {
        self.inner
            .read()
            .expect("catalog poisoned")
            .combines
            .iter()
            .find(|c| {
                c.combinefn == combinefn
                    && c.finalfn == finalfn
                    && c.serializefn == serializefn
                    && c.deserializefn == deserializefn
            })
            .cloned()
    }
}
