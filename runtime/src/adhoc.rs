use crate::engine::EngineCore;
use crate::executor::{keys_eq, run_overlay, run_worker_plan};
use crate::microbatch;
use crate::stream::{StreamProjection, StreamTupleState};
use anyhow::{Context, Result, anyhow};
use freshet_aggregate::AggState;
use freshet_catalog::types::QueryId;
use freshet_common::tuple::{Row, TupleDesc};
use freshet_cqueue::RingBuffer;
use freshet_sql::analyze::{ProcType, validate_cont_query};
use freshet_sql::plan::{CombinerColumn, OverlayPlan, WorkerPlan, compile_combiner, compile_overlay, compile_worker, matrel_desc};
use freshet_sql::rewrite::transform_select_for_cont_process;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Registry of adhoc readers: insert fanout pushes to their private queues
/// instead of the worker queues.
#[derive(Default)]
pub struct AdhocManager {
    map: RwLock<HashMap<QueryId, Arc<RingBuffer>>>,
}

impl AdhocManager {
    pub fn ids(&self) -> HashSet<QueryId> {
        self.map
            .read()
            .expect("adhoc registry poisoned")
            .keys()
            .copied()
            .collect()
    }

    pub fn queue(&self, id: QueryId) -> Option<Arc<RingBuffer>> {
        self.map
            .read()
            .expect("adhoc registry poisoned")
            .get(&id)
            .cloned()
    }

    fn register(&self, id: QueryId, queue: Arc<RingBuffer>) {
        self.map
            .write()
            .expect("adhoc registry poisoned")
            .insert(id, queue);
    }

    fn unregister(&self, id: QueryId) {
        self.map.write().expect("adhoc registry poisoned").remove(&id);
    }

    pub fn close_all(&self) {
        for queue in self.map.read().expect("adhoc registry poisoned").values() {
            queue.close();
        }
    }
}

/// What an adhoc client receives: updated result rows as they change, plus
/// a heartbeat used to detect a dead peer.
#[derive(Debug, Clone)]
pub enum AdhocEvent {
    Heartbeat,
    Rows(Vec<Row>),
}

/// A running adhoc continuous query. Dropping the receiver tears the query
/// down at its next send.
pub struct AdhocQuery {
    pub id: QueryId,
    pub desc: TupleDesc,
    pub events: mpsc::Receiver<AdhocEvent>,
}

struct AdhocPlans {
    worker: WorkerPlan,
    combiner: freshet_sql::plan::CombinerPlan,
    overlay: OverlayPlan,
    stream_desc: TupleDesc,
    mat_desc: TupleDesc,
}

/// Rewrites and runs a one-shot continuous query with no matrel: worker and
/// combiner execute in this task over tuplestores, and the overlay streams
/// changed rows to the client.
pub async fn exec_adhoc_query(core: Arc<EngineCore>, sql: &str) -> Result<AdhocQuery> {
    struct Schema<'a> {
        core: &'a EngineCore,
    }
    impl freshet_sql::analyze::SchemaProvider for Schema<'_> {
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

    let analysis = validate_cont_query(sql, &Schema { core: &core })?;
    let name = format!("adhoc_{}", Uuid::new_v4().simple());
    let matrel_name = format!("{name}_mrel");
    let step_factor = f64::from(core.settings.sliding_window_step_factor);

    let worker_t =
        transform_select_for_cont_process(&analysis, &matrel_name, step_factor, ProcType::Worker)?;
    let combiner_t = transform_select_for_cont_process(
        &analysis,
        &matrel_name,
        step_factor,
        ProcType::Combiner,
    )?;

    let mut worker = compile_worker(&worker_t.proc.to_sql(), &|n| {
        core.cache.stream_by_name(n).is_some()
    })?;
    freshet_sql::combine::resolve_worker_combines(&mut worker, &core.cache)?;
    let combiner = compile_combiner(&combiner_t.proc.to_sql(), &worker)?;
    let overlay = compile_overlay(&worker_t.view.to_sql(), &worker, false)?;
    let overlay = OverlayPlan {
        view_combines: worker_t.view_combines,
        ..overlay
    };

    let stream = core
        .cache
        .stream_by_name(&analysis.stream)
        .ok_or_else(|| anyhow!("stream \"{}\" does not exist", analysis.stream))?;
    let stream_desc = stream.desc.clone().with_arrival_timestamp();
    let mat_desc = matrel_desc(&worker, Some(&stream_desc))?;

    let id = core.catalog.allocate_query_id();
    let queue = RingBuffer::new(core.settings.queue_size);
    core.adhoc.register(id, queue.clone());
    core.catalog.add_stream_reader(stream.relid, id)?;
    core.stats.register_view(id, &name);

    let desc = crate::executor::overlay_desc(&overlay, &mat_desc);
    let (tx, rx) = mpsc::channel(64);
    let plans = AdhocPlans {
        worker,
        combiner,
        overlay,
        stream_desc,
        mat_desc,
    };
    let stream_relid = stream.relid;
    let core_task = core.clone();
    tokio::spawn(async move {
        if let Err(e) = adhoc_main(&core_task, id, &queue, plans, tx).await {
            warn!("adhoc query {id} ended: {e:#}");
        }
        // release the private queue and drop the synthetic view
        core_task.catalog.remove_stream_reader(stream_relid, id);
        core_task.adhoc.unregister(id);
        core_task.stats.drop_view(id);
        queue.close();
        debug!("adhoc query {id} cleaned up");
    });

    Ok(AdhocQuery {
        id,
        desc,
        events: rx,
    })
}

struct AdhocGroup {
    key: Vec<freshet_common::value::Value>,
    row: Row,
}

async fn adhoc_main(
    core: &Arc<EngineCore>,
    id: QueryId,
    queue: &Arc<RingBuffer>,
    plans: AdhocPlans,
    tx: mpsc::Sender<AdhocEvent>,
) -> Result<()> {
    let mut consumer = queue
        .attach_consumer()
        .map_err(|e| anyhow!("adhoc queue: {e}"))?;
    let heartbeat = Duration::from_millis(core.settings.adhoc_heartbeat_ms);
    let batch_size = core.settings.batch_size;
    let max_wait = Duration::from_millis(core.settings.max_wait_ms);

    // the in-memory matrel analogue: one tuplestore row per group
    let mut index: HashMap<u64, Vec<usize>> = HashMap::new();
    let mut groups: Vec<AdhocGroup> = Vec::new();
    let mut last_beat = tokio::time::Instant::now();

    loop {
        if core.terminated() {
            return Ok(());
        }
        if last_beat.elapsed() >= heartbeat {
            // a failed flush means the client is gone
            if tx.send(AdhocEvent::Heartbeat).await.is_err() {
                return Ok(());
            }
            last_beat = tokio::time::Instant::now();
        }

        match tokio::time::timeout(heartbeat, consumer.sleep_if_empty()).await {
            Err(_) => continue,
            Ok(Err(_)) => return Ok(()),
            Ok(Ok(())) => {}
        }

        let batch =
            microbatch::read_batch::<StreamTupleState>(&mut consumer, batch_size, max_wait).await?;
        if batch.is_empty() {
            microbatch::release(&mut consumer);
            continue;
        }
        let now = core.now();

        // worker step over the microbatch
        let mut projections: Vec<(TupleDesc, StreamProjection)> = Vec::new();
        let mut rows = Vec::with_capacity(batch.len());
        for tuple in &batch.tuples {
            let projection = match projections.iter().position(|(d, _)| *d == tuple.desc) {
                Some(found) => &projections[found].1,
                None => {
                    let built = StreamProjection::new(&tuple.desc, &plans.stream_desc);
                    projections.push((tuple.desc.clone(), built));
                    &projections.last().expect("just pushed").1
                }
            };
            rows.push(projection.project(tuple));
        }
        let output = run_worker_plan(
            &plans.worker,
            &plans.combiner.group_idxs,
            &plans.stream_desc,
            &rows,
            &core.tables,
            now,
        )
        .with_context(|| "adhoc worker step")?;
        microbatch::release(&mut consumer);

        if let Some(counters) = core.stats.view_counters(id) {
            counters.record_exec(rows.len() as u64, output.rows.len() as u64, batch.bytes as u64);
        }

        // combiner step against the in-memory groups
        let mut touched: Vec<usize> = Vec::new();
        for partial in &output.rows {
            let group_cols = &plans.combiner.group_idxs;
            let key: Vec<_> = group_cols.iter().map(|i| partial.get(*i).clone()).collect();
            let hash = freshet_common::hash::hash_group(&key);
            let found = index
                .entry(hash)
                .or_default()
                .iter()
                .copied()
                .find(|i| keys_eq(&groups[*i].key, &key));
            match found {
                Some(i) => {
                    let merged = combine_rows(&plans.combiner.columns, &groups[i].row, partial)?;
                    groups[i].row = merged;
                    touched.push(i);
                }
                None => {
                    groups.push(AdhocGroup {
                        key,
                        row: partial.clone(),
                    });
                    index.entry(hash).or_default().push(groups.len() - 1);
                    touched.push(groups.len() - 1);
                }
            }
        }
        touched.sort_unstable();
        touched.dedup();

        // overlay step over the touched groups only
        let changed: Vec<(crate::matrel::RowId, Row)> = touched
            .iter()
            .map(|i| (*i as u64, groups[*i].row.clone()))
            .collect();
        let out = run_overlay(&plans.overlay, &plans.mat_desc, &changed, now)
            .with_context(|| "adhoc overlay step")?;
        if !out.is_empty() && tx.send(AdhocEvent::Rows(out)).await.is_err() {
            return Ok(());
        }
        last_beat = tokio::time::Instant::now();
    }
}

fn combine_rows(
    columns: &[(String, CombinerColumn)],
    existing: &Row,
    incoming: &Row,
) -> Result<Row> {
    let mut values = Vec::with_capacity(columns.len());
    for (out_idx, (_, column)) in columns.iter().enumerate() {
        let value = match column {
            CombinerColumn::Group { .. } => existing.get(out_idx).clone(),
            CombinerColumn::Combine { idx, agg } => {
                let mut held: AggState = agg.datum_to_state(existing.get(out_idx))?;
                let incoming_state = agg.datum_to_state(incoming.get(*idx))?;
                agg.combine(&mut held, &incoming_state)?;
                agg.state_to_datum(&held)?
            }
            CombinerColumn::Const(expr) => freshet_sql::expr::eval_const(expr)
                .with_context(|| "constant combiner target")?,
        };
        values.push(value);
    }
    Ok(Row::new(values))
}
