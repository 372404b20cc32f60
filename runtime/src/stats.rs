use freshet_catalog::types::QueryId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Counters kept by one worker/combiner task or one continuous view.
#[derive(Debug, Default)]
pub struct Counters {
    pub input_rows: AtomicU64,
    pub output_rows: AtomicU64,
    pub input_bytes: AtomicU64,
    pub output_bytes: AtomicU64,
    pub errors: AtomicU64,
    pub executions: AtomicU64,
}

impl Counters {
    pub fn record_exec(&self, input_rows: u64, output_rows: u64, input_bytes: u64) {
        self.input_rows.fetch_add(input_rows, Ordering::Relaxed);
        self.output_rows.fetch_add(output_rows, Ordering::Relaxed);
        self.input_bytes.fetch_add(input_bytes, Ordering::Relaxed);
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// A snapshot row of the stats surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsRow {
    pub name: String,
    pub input_rows: u64,
    pub output_rows: u64,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub errors: u64,
    pub executions: u64,
}

fn snapshot(name: String, counters: &Counters) -> StatsRow {
    StatsRow {
        name,
        input_rows: counters.input_rows.load(Ordering::Relaxed),
        output_rows: counters.output_rows.load(Ordering::Relaxed),
        input_bytes: counters.input_bytes.load(Ordering::Relaxed),
        output_bytes: counters.output_bytes.load(Ordering::Relaxed),
        errors: counters.errors.load(Ordering::Relaxed),
        executions: counters.executions.load(Ordering::Relaxed),
    }
}

/// Registry backing the set-returning stats functions.
#[derive(Default)]
pub struct StatsRegistry {
    procs: RwLock<Vec<(String, Arc<Counters>)>>,
    views: RwLock<HashMap<QueryId, (String, Arc<Counters>)>>,
}

impl StatsRegistry {
    pub fn register_proc(&self, name: &str) -> Arc<Counters> {
        let counters = Arc::new(Counters::default());
        self.procs
            .write()
            .expect("stats poisoned")
            .push((name.to_owned(), counters.clone()));
        counters
    }

    pub fn register_view(&self, id: QueryId, name: &str) -> Arc<Counters> {
        let counters = Arc::new(Counters::default());
        self.views
            .write()
            .expect("stats poisoned")
            .insert(id, (name.to_owned(), counters.clone()));
        counters
    }

    pub fn view_counters(&self, id: QueryId) -> Option<Arc<Counters>> {
        self.views
            .read()
            .expect("stats poisoned")
            .get(&id)
            .map(|(_, c)| c.clone())
    }

    pub fn drop_view(&self, id: QueryId) {
        self.views.write().expect("stats poisoned").remove(&id);
    }

    /// Per-process counters, one row per worker/combiner task.
    pub fn proc_stats(&self) -> Vec<StatsRow> {
        self.procs
            .read()
            .expect("stats poisoned")
            .iter()
            .map(|(name, counters)| snapshot(name.clone(), counters))
            .collect()
    }

    /// Per-view counters.
    pub fn query_stats(&self) -> Vec<StatsRow> {
        let mut rows: Vec<StatsRow> = self
            .views
            .read()
            .expect("stats poisoned")
            .values()
            .map(|(name, counters)| snapshot(name.clone(), counters))
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }
}
