use crate::adhoc::AdhocManager;
use crate::host_tables::HostTables;
use crate::matrel::MatRelStore;
use crate::stats::StatsRegistry;
use crate::stream::{AckRegistry, StreamTupleState};
use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use freshet_catalog::cache::CatalogCache;
use freshet_catalog::naming;
use freshet_catalog::store::CatalogStore;
use freshet_catalog::types::{CombineRow, ContAction, ContQueryRow, QueryId, StreamRow};
use freshet_common::settings::Settings;
use freshet_common::time::{Clock, SystemClock};
use freshet_common::tuple::{Column, Row, TupleDesc};
use freshet_common::value::{DataType, Value};
use freshet_common::wire::encode_cbor;
use freshet_cqueue::RingBuffer;
use freshet_sql::analyze::{ProcType, SchemaProvider, validate_cont_query};
use freshet_sql::combine::resolve_worker_combines;
use freshet_sql::options::{ViewOptions, apply_sliding_window, check_window_options};
use freshet_sql::plan::{CombinerPlan, OverlayPlan, WorkerPlan, compile_combiner, compile_overlay, compile_worker, matrel_desc};
use freshet_sql::rewrite::transform_select_for_cont_process;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Sliding-window runtime facts shared by workers and combiners.
#[derive(Debug, Clone)]
pub struct SwRuntime {
    /// Matrel attribute of the truncated window column.
    pub attno: usize,
    pub window_us: i64,
}

/// Everything a worker or combiner needs to execute one continuous view.
pub struct CvRuntime {
    pub cv: Arc<ContQueryRow>,
    pub worker: WorkerPlan,
    pub combiner: CombinerPlan,
    pub overlay: OverlayPlan,
    /// Declared stream shape, arrival_timestamp included.
    pub stream_desc: TupleDesc,
    pub sw: Option<SwRuntime>,
}

/// Compiled plans per view, refreshed when the query catalog changes.
#[derive(Default)]
pub struct PlanCache {
    inner: Mutex<HashMap<QueryId, (u64, Arc<CvRuntime>)>>,
}

impl PlanCache {
    pub fn get(&self, core: &EngineCore, id: QueryId) -> Result<Option<Arc<CvRuntime>>> {
        let version = core
            .catalog
            .version(freshet_catalog::store::CatalogRelation::PipelineQuery);
        {
            let cached = self.inner.lock().expect("plan cache poisoned");
            if let Some((seen, runtime)) = cached.get(&id)
                && *seen == version
            {
                return Ok(Some(runtime.clone()));
            }
        }
        let Some(cv) = core.cache.query_by_id(id) else {
            self.inner.lock().expect("plan cache poisoned").remove(&id);
            return Ok(None);
        };
        let runtime = Arc::new(core.compile_runtime(&cv)?);
        self.inner
            .lock()
            .expect("plan cache poisoned")
            .insert(id, (version, runtime.clone()));
        Ok(Some(runtime))
    }

    pub fn invalidate(&self, id: QueryId) {
        self.inner.lock().expect("plan cache poisoned").remove(&id);
    }
}

/// A view-change callback: `(old, new)` overlay rows for the affected
/// result group; None on either side for appearance/expiry.
pub type ViewChangeHook = Arc<dyn Fn(Option<&Row>, Option<&Row>) + Send + Sync>;

#[derive(Default)]
pub struct HookRegistry {
    map: RwLock<HashMap<QueryId, Vec<ViewChangeHook>>>,
}

impl HookRegistry {
    pub fn register(&self, id: QueryId, hook: ViewChangeHook) {
        self.map
            .write()
            .expect("hooks poisoned")
            .entry(id)
            .or_default()
            .push(hook);
    }

    pub fn has(&self, id: QueryId) -> bool {
        self.map
            .read()
            .expect("hooks poisoned")
            .get(&id)
            .is_some_and(|hooks| !hooks.is_empty())
    }

    pub fn fire(&self, id: QueryId, old: Option<&Row>, new: Option<&Row>) {
        let hooks = {
            self.map
                .read()
                .expect("hooks poisoned")
                .get(&id)
                .cloned()
                .unwrap_or_default()
        };
        for hook in hooks {
            hook(old, new);
        }
    }

    pub fn drop_view(&self, id: QueryId) {
        self.map.write().expect("hooks poisoned").remove(&id);
    }
}

/// A transform's output function.
pub type OutputFunc = Arc<dyn Fn(&TupleDesc, &[Row]) + Send + Sync>;

#[derive(Default)]
pub struct OutputFuncRegistry {
    map: RwLock<HashMap<String, OutputFunc>>,
}

impl OutputFuncRegistry {
    pub fn register(&self, name: &str, func: OutputFunc) {
        self.map
            .write()
            .expect("output funcs poisoned")
            .insert(name.to_ascii_lowercase(), func);
    }

    pub fn get(&self, name: &str) -> Option<OutputFunc> {
        self.map
            .read()
            .expect("output funcs poisoned")
            .get(&name.to_ascii_lowercase())
            .cloned()
    }
}

/// Shared state every engine task sees.
pub struct EngineCore {
    pub settings: Settings,
    pub clock: Arc<dyn Clock>,
    pub catalog: Arc<CatalogStore>,
    pub cache: CatalogCache,
    pub matrels: MatRelStore,
    pub tables: HostTables,
    pub worker_queues: Vec<Arc<RingBuffer>>,
    pub combiner_queues: Vec<Arc<RingBuffer>>,
    pub acks: AckRegistry,
    pub stats: StatsRegistry,
    pub plans: PlanCache,
    pub hooks: HookRegistry,
    pub outputs: OutputFuncRegistry,
    pub adhoc: AdhocManager,
    pub terminate: AtomicBool,
    view_indexes: RwLock<Vec<ViewIndex>>,
}

/// A user index on a continuous view, rewritten onto the matrel column
/// backing the indexed expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewIndex {
    pub name: String,
    pub view: String,
    pub matrel_column: String,
}

struct EngineSchema<'a> {
    core: &'a EngineCore,
}

impl SchemaProvider for EngineSchema<'_> {
    fn is_stream(&self, name: &str) -> bool {
        self.core.cache.stream_by_name(name).is_some()
    }

    fn relation_exists(&self, name: &str) -> bool {
        self.core.tables.exists(name)
    }

    fn stream_desc(&self, name: &str) -> Option<TupleDesc> {
        self.core
            .cache
            .stream_by_name(name)
            .map(|s| s.desc.clone().with_arrival_timestamp())
    }

    fn has_index(&self, table: &str, column: &str) -> bool {
        self.core.tables.has_index(table, column)
    }
}

impl EngineCore {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn terminated(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    fn schema(&self) -> EngineSchema<'_> {
        EngineSchema { core: self }
    }

    /// Compiles worker/combiner/overlay plans for one view.
    pub fn compile_runtime(&self, cv: &Arc<ContQueryRow>) -> Result<CvRuntime> {
        let mut worker = compile_worker(&cv.worker_sql, &|name| {
            self.cache.stream_by_name(name).is_some()
        })?;
        resolve_worker_combines(&mut worker, &self.cache)?;
        let combiner: CombinerPlan = compile_combiner(&cv.combiner_sql, &worker)?;
        let overlay: OverlayPlan = compile_overlay(&cv.overlay_sql, &worker, false)?;
        // a sliding window view-combines when it aggregates or groups; a
        // plain windowed projection reads through directly
        let view_combines = cv.is_sliding_window()
            && (worker.has_aggs()
                || cv.group_cols.iter().any(|col| Some(*col) != cv.sw_attno));
        let overlay = OverlayPlan {
            view_combines,
            ..overlay
        };
        let stream = self
            .cache
            .stream_by_name(&worker.stream)
            .ok_or_else(|| anyhow!("stream \"{}\" does not exist", worker.stream))?;
        let sw = match (cv.sw_attno, cv.sw_interval_us) {
            (Some(attno), Some(window_us)) => Some(SwRuntime { attno, window_us }),
            _ => None,
        };
        Ok(CvRuntime {
            cv: cv.clone(),
            worker,
            combiner,
            overlay,
            stream_desc: stream.desc.clone().with_arrival_timestamp(),
            sw,
        })
    }

    /// Pushes already-shaped tuples down the C7 insert path: worker queues
    /// for continuous views, private queues for adhoc readers.
    pub async fn push_stream_tuples(
        &self,
        stream: &StreamRow,
        desc: &TupleDesc,
        rows: Vec<Vec<Value>>,
        synchronous: bool,
    ) -> Result<u64> {
        let adhoc_ids = self.adhoc.ids();
        let worker_targets: Vec<QueryId> = stream
            .readers
            .iter()
            .copied()
            .filter(|id| !adhoc_ids.contains(id))
            .collect();
        let adhoc_targets: Vec<QueryId> = stream
            .readers
            .iter()
            .copied()
            .filter(|id| adhoc_ids.contains(id))
            .collect();

        if worker_targets.is_empty() && adhoc_targets.is_empty() {
            return Ok(0);
        }

        let arrival = self.now();
        let ack = if synchronous && !worker_targets.is_empty() {
            Some(self.acks.create(rows.len() as i64))
        } else {
            None
        };

        let mut count = 0u64;
        if !worker_targets.is_empty() {
            // batched pushes hold the head lock once per queue
            let queue = &self.worker_queues[stream.relid as usize % self.worker_queues.len()];
            let lock = queue.lock_head().await;
            for values in &rows {
                let tuple = StreamTupleState {
                    desc: desc.clone(),
                    values: values.clone(),
                    arrival,
                    ack,
                    targets: worker_targets.clone(),
                };
                let payload = encode_cbor(&tuple)?;
                lock.push(&payload).await.with_context(|| "stream insert")?;
                count += 1;
            }
        }

        for adhoc_id in adhoc_targets {
            let Some(queue) = self.adhoc.queue(adhoc_id) else {
                continue;
            };
            for values in &rows {
                let tuple = StreamTupleState {
                    desc: desc.clone(),
                    values: values.clone(),
                    arrival,
                    ack: None,
                    targets: vec![adhoc_id],
                };
                let payload = encode_cbor(&tuple)?;
                if queue.push(&payload).await.is_err() {
                    break;
                }
                count = count.max(rows.len() as u64);
            }
        }

        if let Some(ack) = ack {
            self.acks.wait(ack).await;
        }
        Ok(count)
    }

    /// Emits `(old, new)` delta records onto a view's output stream so
    /// downstream views can combine on output.
    pub async fn emit_osrel_deltas(
        &self,
        cv: &ContQueryRow,
        desc: &TupleDesc,
        deltas: &[(Option<Row>, Option<Row>)],
    ) -> Result<()> {
        let Some(osrel) = self.cache.stream_by_relid(cv.osrel) else {
            return Ok(());
        };
        if osrel.readers.is_empty() {
            return Ok(());
        }
        let rows: Vec<Vec<Value>> = deltas
            .iter()
            .map(|(old, new)| {
                vec![
                    old.as_ref()
                        .map(|r| crate::stream::record_of(desc, r))
                        .unwrap_or(Value::Null),
                    new.as_ref()
                        .map(|r| crate::stream::record_of(desc, r))
                        .unwrap_or(Value::Null),
                ]
            })
            .collect();
        self.push_stream_tuples(&osrel, &osrel.desc, rows, false)
            .await?;
        Ok(())
    }
}

/// Construction options; defaults use the wall clock.
pub struct EngineOptions {
    pub settings: Settings,
    pub clock: Arc<dyn Clock>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

/// The result of a view or adhoc read.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub desc: TupleDesc,
    pub rows: Vec<Row>,
}

/// The continuous-query engine: owns the catalog, the queues and the
/// long-running worker/combiner tasks.
pub struct Engine {
    core: Arc<EngineCore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Result<Arc<Self>> {
        let settings = options.settings;
        let worker_queues: Vec<Arc<RingBuffer>> = (0..settings.num_workers.max(1))
            .map(|_| RingBuffer::new(settings.queue_size))
            .collect();
        let combiner_queues: Vec<Arc<RingBuffer>> = (0..settings.num_combiners.max(1))
            .map(|_| RingBuffer::new(settings.queue_size))
            .collect();

        let catalog = Arc::new(CatalogStore::new());
        let cache = CatalogCache::new(catalog.clone());

        let core = Arc::new(EngineCore {
            settings,
            clock: options.clock,
            catalog,
            cache,
            matrels: MatRelStore::default(),
            tables: HostTables::default(),
            worker_queues,
            combiner_queues,
            acks: AckRegistry::default(),
            stats: StatsRegistry::default(),
            plans: PlanCache::default(),
            hooks: HookRegistry::default(),
            outputs: OutputFuncRegistry::default(),
            adhoc: AdhocManager::default(),
            terminate: AtomicBool::new(false),
            view_indexes: RwLock::new(Vec::new()),
        });

        // register the explicit combine mappings for every known aggregate
        for agg in freshet_aggregate::AGGREGATES.values() {
            if agg.is_combine() {
                continue;
            }
            core.catalog.define_combine(CombineRow {
                combinefn: agg.combinefn(),
                finalfn: agg.finalfn(),
                serializefn: agg.serializefn(),
                deserializefn: agg.deserializefn(),
                combine_agg: agg.name().to_owned(),
            });
        }

        let engine = Arc::new(Self {
            core: core.clone(),
            handles: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::new();
        for (idx, queue) in core.worker_queues.iter().enumerate() {
            let consumer = queue
                .attach_consumer()
                .map_err(|e| anyhow!("worker queue: {e}"))?;
            handles.push(tokio::spawn(crate::worker::worker_main(
                core.clone(),
                consumer,
                idx,
            )));
        }
        for (idx, queue) in core.combiner_queues.iter().enumerate() {
            let consumer = queue
                .attach_consumer()
                .map_err(|e| anyhow!("combiner queue: {e}"))?;
            handles.push(tokio::spawn(crate::combiner::combiner_main(
                core.clone(),
                consumer,
                idx,
            )));
        }
        *engine.handles.lock().expect("handles poisoned") = handles;
        Ok(engine)
    }

    pub fn core(&self) -> &Arc<EngineCore> {
        &self.core
    }

    pub fn settings(&self) -> &Settings {
        &self.core.settings
    }

    /// Declares a stream relation.
    pub fn create_stream(&self, name: &str, columns: Vec<(String, DataType)>) -> Result<()> {
        let desc = TupleDesc::new(
            columns
                .into_iter()
                .map(|(name, data_type)| Column::new(name, data_type))
                .collect(),
        );
        let relid = self.core.catalog.allocate_relid();
        self.core.catalog.define_stream(relid, name, desc, false)?;
        info!("created stream {name}");
        Ok(())
    }

    pub fn drop_stream(&self, name: &str) -> Result<()> {
        let stream = self
            .core
            .cache
            .stream_by_name(name)
            .ok_or_else(|| anyhow!("stream \"{name}\" does not exist"))?;
        if !stream.readers.is_empty() {
            bail!("stream \"{name}\" still has continuous views reading from it");
        }
        self.core.catalog.drop_stream(stream.relid);
        Ok(())
    }

    /// Creates an ordinary relation streams can join against.
    pub fn create_table(&self, name: &str, columns: Vec<(String, DataType)>) -> Result<()> {
        let desc = TupleDesc::new(
            columns
                .into_iter()
                .map(|(name, data_type)| Column::new(name, data_type))
                .collect(),
        );
        self.core.tables.create(name, desc)?;
        Ok(())
    }

    pub fn insert_table(&self, name: &str, rows: Vec<Vec<Value>>) -> Result<()> {
        self.core
            .tables
            .insert(name, rows.into_iter().map(Row::new).collect())?;
        Ok(())
    }

    pub fn create_table_index(&self, name: &str, column: &str) -> Result<()> {
        self.core.tables.create_index(name, column)?;
        Ok(())
    }

    /// Registers a continuous view. `with_options` carries the recognized
    /// WITH options (`sw`, `sw_column`, `step_factor`, `action`, ...).
    pub fn create_continuous_view(
        &self,
        name: &str,
        sql: &str,
        with_options: &[(String, String)],
    ) -> Result<QueryId> {
        let core = &self.core;
        let options = ViewOptions::from_pairs(with_options)?;
        let action = options.action()?;

        let body = match &options.sw {
            Some(sw) => apply_sliding_window(sql, sw, options.sw_column.as_deref())?,
            None => sql.to_owned(),
        };

        let analysis = validate_cont_query(&body, &core.schema())?;
        check_window_options(&options, analysis.is_sw)?;

        let step_factor = if analysis.is_sw {
            options
                .step_factor
                .unwrap_or(core.settings.sliding_window_step_factor)
        } else {
            0
        };

        let matrel_name = naming::matrel_name(name);
        let worker_t = transform_select_for_cont_process(
            &analysis,
            &matrel_name,
            f64::from(step_factor),
            ProcType::Worker,
        )?;
        let combiner_t = transform_select_for_cont_process(
            &analysis,
            &matrel_name,
            f64::from(step_factor),
            ProcType::Combiner,
        )?;

        let worker_sql = worker_t.proc.to_sql();
        let combiner_sql = combiner_t.proc.to_sql();
        let overlay_sql = worker_t.view.to_sql();
        debug!("worker query for {name}: {worker_sql}");
        debug!("combiner query for {name}: {combiner_sql}");
        debug!("overlay query for {name}: {overlay_sql}");

        let stream = core
            .cache
            .stream_by_name(&analysis.stream)
            .ok_or_else(|| anyhow!("stream \"{}\" does not exist", analysis.stream))?;
        let stream_desc = stream.desc.clone().with_arrival_timestamp();

        let mut worker_plan =
            compile_worker(&worker_sql, &|n| core.cache.stream_by_name(n).is_some())?;
        // combine() targets over an upstream output stream resolve to their
        // terminal aggregates here, so a bad chain fails the DDL
        resolve_worker_combines(&mut worker_plan, &core.cache)?;
        let mat_desc = matrel_desc(&worker_plan, Some(&stream_desc))?;
        let combiner_plan = compile_combiner(&combiner_sql, &worker_plan)?;

        let sw_attno = worker_t
            .sw_time_col
            .as_deref()
            .and_then(|col| worker_plan.target_index(col));
        let ttl_us = match options.ttl_us()? {
            Some(ttl) => Some(ttl),
            None => analysis.sw_interval_us,
        };
        let ttl_attno = match &options.ttl_column {
            Some(col) => worker_plan.target_index(col),
            None => sw_attno,
        };

        let id = core.catalog.allocate_query_id();
        let defrel = core.catalog.allocate_relid();
        let matrel = core.catalog.allocate_relid();
        let osrel = core.catalog.allocate_relid();
        let seqrel = core.catalog.allocate_relid();
        let pk_index = core.catalog.allocate_relid();
        let lookup_index = core.catalog.allocate_relid();

        if action == ContAction::Materialize {
            core.matrels
                .create(matrel, mat_desc.clone(), combiner_plan.group_idxs.clone());
        }

        let osrel_desc = TupleDesc::new(vec![
            Column::new("old", DataType::Record),
            Column::new("new", DataType::Record),
        ]);
        core.catalog
            .define_stream(osrel, &naming::osrel_name(name), osrel_desc, true)?;

        let row = ContQueryRow {
            id,
            name: name.to_owned(),
            defrel,
            query: sql.to_owned(),
            matrel,
            matrel_name: matrel_name.clone(),
            osrel,
            osrel_name: naming::osrel_name(name),
            seqrel,
            pk_index,
            lookup_index,
            worker_sql,
            combiner_sql,
            overlay_sql,
            matrel_desc: mat_desc,
            group_cols: combiner_plan.group_idxs.clone(),
            sw_step_factor: step_factor,
            sw_attno: if analysis.is_sw { sw_attno } else { None },
            sw_interval_us: analysis.sw_interval_us,
            ttl_us,
            ttl_attno,
            action,
            output_func: options.outputfunc.clone(),
            gc: analysis.is_sw || options.ttl.is_some(),
            active: true,
        };

        if let Err(e) = core.catalog.define_query(row) {
            core.matrels.drop_table(matrel);
            core.catalog.drop_stream(osrel);
            return Err(e.into());
        }
        core.catalog.add_stream_reader(stream.relid, id)?;
        core.stats.register_view(id, name);
        info!("created continuous view {name} over stream {}", stream.name);
        Ok(id)
    }

    /// Registers a continuous transform: rows go to the output function and
    /// the output stream, never to a matrel.
    pub fn create_continuous_transform(
        &self,
        name: &str,
        sql: &str,
        outputfunc: Option<&str>,
    ) -> Result<QueryId> {
        let mut options = vec![("action".to_owned(), "transform".to_owned())];
        if let Some(func) = outputfunc {
            options.push(("outputfunc".to_owned(), func.to_owned()));
        }
        self.create_continuous_view(name, sql, &options)
    }

    pub fn register_output_func(&self, name: &str, func: OutputFunc) {
        self.core.outputs.register(name, func);
    }

    pub fn register_view_change_hook(&self, view: &str, hook: ViewChangeHook) -> Result<()> {
        let cv = self
            .core
            .cache
            .query_by_name(view)
            .ok_or_else(|| anyhow!("continuous view \"{view}\" does not exist"))?;
        self.core.hooks.register(cv.id, hook);
        Ok(())
    }

    /// Drops a view and everything it owns: matrel, indexes, output stream,
    /// sequence.
    pub fn drop_continuous_view(&self, name: &str) -> Result<()> {
        let cv = self
            .core
            .cache
            .query_by_name(name)
            .ok_or_else(|| anyhow!("continuous view \"{name}\" does not exist"))?;
        let stream = self
            .core
            .cache
            .stream_by_name(&self.stream_of(&cv)?)
            .ok_or_else(|| anyhow!("stream backing \"{name}\" is gone"))?;
        self.core.catalog.remove_stream_reader(stream.relid, cv.id);
        self.core.catalog.remove_query(cv.id);
        self.core.catalog.drop_stream(cv.osrel);
        self.core.matrels.drop_table(cv.matrel);
        self.core.stats.drop_view(cv.id);
        self.core.hooks.drop_view(cv.id);
        self.core.plans.invalidate(cv.id);
        info!("dropped continuous view {name}");
        Ok(())
    }

    fn stream_of(&self, cv: &ContQueryRow) -> Result<String> {
        let plan = compile_worker(&cv.worker_sql, &|n| {
            self.core.cache.stream_by_name(n).is_some()
        })?;
        Ok(plan.stream)
    }

    /// Empties a view's materialization relation.
    pub fn truncate_continuous_view(&self, name: &str) -> Result<()> {
        let cv = self
            .core
            .cache
            .query_by_name(name)
            .ok_or_else(|| anyhow!("continuous view \"{name}\" does not exist"))?;
        self.core.matrels.truncate(cv.matrel);
        Ok(())
    }

    /// CREATE INDEX on a continuous view: the target is rewritten to the
    /// matrel, and an expression element becomes a functional index on the
    /// hoisted column computing it.
    pub fn create_view_index(&self, index_name: &str, view: &str, element: &str) -> Result<()> {
        let cv = self
            .core
            .cache
            .query_by_name(view)
            .ok_or_else(|| anyhow!("continuous view \"{view}\" does not exist"))?;
        let runtime = self
            .core
            .plans
            .get(&self.core, cv.id)?
            .ok_or_else(|| anyhow!("continuous view \"{view}\" does not exist"))?;

        // a bare column indexes the matrel column of the same name; an
        // expression element indexes the worker column that computes it
        let expr = freshet_sql::util::parse_expr(element)?;
        let matrel_column = runtime
            .worker
            .targets
            .iter()
            .map(|t| t.name().to_owned())
            .find(|name| name.eq_ignore_ascii_case(element))
            .or_else(|| {
                runtime.worker.targets.iter().find_map(|t| match t {
                    freshet_sql::plan::WorkerTarget::Scalar { name, expr: e } if *e == expr => {
                        Some(name.clone())
                    }
                    _ => None,
                })
            })
            .ok_or_else(|| {
                anyhow!("\"{element}\" is not an indexable column of \"{view}\"")
            })?;

        self.core
            .view_indexes
            .write()
            .expect("view indexes poisoned")
            .push(ViewIndex {
                name: index_name.to_owned(),
                view: view.to_owned(),
                matrel_column,
            });
        Ok(())
    }

    pub fn view_indexes(&self, view: &str) -> Vec<ViewIndex> {
        self.core
            .view_indexes
            .read()
            .expect("view indexes poisoned")
            .iter()
            .filter(|ix| ix.view.eq_ignore_ascii_case(view))
            .cloned()
            .collect()
    }

    pub fn activate(&self, name: &str, active: bool) -> Result<()> {
        let cv = self
            .core
            .cache
            .query_by_name(name)
            .ok_or_else(|| anyhow!("continuous view \"{name}\" does not exist"))?;
        self.core.catalog.set_query_active(cv.id, active);
        Ok(())
    }

    /// Appends rows to a stream; every reader view incorporates them. With
    /// synchronous inserts enabled, returns only after combiners applied
    /// the rows.
    pub async fn insert(
        &self,
        stream_name: &str,
        columns: &[&str],
        rows: Vec<Vec<Value>>,
    ) -> Result<u64> {
        let stream = self
            .core
            .cache
            .stream_by_name(stream_name)
            .ok_or_else(|| anyhow!("stream \"{stream_name}\" does not exist"))?;

        // the inserting session's descriptor: declared types where known
        let desc = TupleDesc::new(
            columns
                .iter()
                .map(|col| {
                    let data_type = stream
                        .desc
                        .attr(col)
                        .map(|i| stream.desc.columns[i].data_type)
                        .unwrap_or(DataType::Text);
                    Column::new((*col).to_owned(), data_type)
                })
                .collect(),
        );

        self.core
            .push_stream_tuples(
                &stream,
                &desc,
                rows,
                self.core.settings.synchronous_stream_insert,
            )
            .await
    }

    /// Reads a continuous view through its overlay.
    pub fn query_view(&self, name: &str) -> Result<QueryResult> {
        let cv = self
            .core
            .cache
            .query_by_name(name)
            .ok_or_else(|| anyhow!("continuous view \"{name}\" does not exist"))?;
        if cv.action != ContAction::Materialize {
            bail!("continuous transform \"{name}\" has no materialized results");
        }
        let runtime = self
            .core
            .plans
            .get(&self.core, cv.id)?
            .ok_or_else(|| anyhow!("continuous view \"{name}\" does not exist"))?;
        let rows = self.core.matrels.scan(cv.matrel);
        let out = crate::executor::run_overlay(
            &runtime.overlay,
            &cv.matrel_desc,
            &rows,
            self.core.now(),
        )?;
        Ok(QueryResult {
            desc: crate::executor::overlay_desc(&runtime.overlay, &cv.matrel_desc),
            rows: out,
        })
    }

    /// Runs a one-shot SELECT over a continuous view, combine() included.
    pub fn query(&self, sql: &str) -> Result<QueryResult> {
        crate::query::run_user_query(&self.core, sql)
    }

    /// Starts an adhoc continuous query; results stream to the returned
    /// receiver until it is dropped.
    pub async fn exec_adhoc_query(&self, sql: &str) -> Result<crate::adhoc::AdhocQuery> {
        crate::adhoc::exec_adhoc_query(self.core.clone(), sql).await
    }

    pub fn proc_stats(&self) -> Vec<crate::stats::StatsRow> {
        self.core.stats.proc_stats()
    }

    pub fn query_stats(&self) -> Vec<crate::stats::StatsRow> {
        self.core.stats.query_stats()
    }

    /// Stops every task and tears down the queues.
    pub async fn shutdown(&self) {
        self.core.terminate.store(true, Ordering::Release);
        for queue in &self.core.worker_queues {
            queue.close();
        }
        for queue in &self.core.combiner_queues {
            queue.close();
        }
        self.core.adhoc.close_all();
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.handles.lock().expect("handles poisoned"));
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Stable shard assignment of a group hash onto a combiner queue.
pub fn combiner_for(hash: u64, num_combiners: usize) -> usize {
    (hash % num_combiners.max(1) as u64) as usize
}

/// Set of continuous-view ids targeted by a batch of stream tuples.
pub fn batch_targets(tuples: &[StreamTupleState]) -> HashSet<QueryId> {
    let mut ids = HashSet::new();
    for tuple in tuples {
        ids.extend(tuple.targets.iter().copied());
    }
    ids
}
