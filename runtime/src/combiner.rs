use crate::engine::{CvRuntime, EngineCore};
use crate::executor::{keys_eq, run_overlay};
use crate::matrel::RowId;
use crate::microbatch;
use crate::sw::SwState;
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use freshet_aggregate::AggState;
use freshet_catalog::types::QueryId;
use freshet_common::tuple::Row;
use freshet_common::value::Value;
use freshet_cqueue::Consumer;
use freshet_sql::expr::eval_const;
use freshet_sql::plan::CombinerColumn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Hashed partial results routed from a worker to one combiner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinerMessage {
    pub cv: QueryId,
    pub rows: Vec<Row>,
    pub acks: Vec<u64>,
}

/// The combiner main loop: group incoming partials by fingerprint, look up
/// matching matrel rows through the hashed group index, combine and
/// persist, then emit deltas. Sliding-window views additionally keep the
/// in-memory expiry structures current and vacuum them on a timer.
pub async fn combiner_main(core: Arc<EngineCore>, mut consumer: Consumer, index: usize) {
    let counters = core.stats.register_proc(&format!("combiner{index}"));
    let batch_size = core.settings.batch_size;
    let max_wait = Duration::from_millis(core.settings.max_wait_ms);
    let vacuum_interval = Duration::from_millis(core.settings.sw_vacuum_interval_ms);
    let mut sw_states: HashMap<QueryId, SwState> = HashMap::new();
    debug!("combiner{index} started");

    loop {
        if core.terminated() {
            break;
        }

        match tokio::time::timeout(vacuum_interval, consumer.sleep_if_empty()).await {
            Ok(Err(_)) => break,
            Ok(Ok(())) => {
                let batch = match microbatch::read_batch::<CombinerMessage>(
                    &mut consumer,
                    batch_size,
                    max_wait,
                )
                .await
                {
                    Ok(batch) => batch,
                    Err(_) => break,
                };
                let now = core.now();
                let mut input_rows = 0u64;
                for message in batch.tuples {
                    let acks = message.acks.clone();
                    input_rows += message.rows.len() as u64;
                    if let Err(e) = process_message(&core, &mut sw_states, message, now).await {
                        warn!("combiner batch failed: {e:#}");
                        counters.record_error();
                    }
                    for ack in acks {
                        core.acks.adjust(ack, -1);
                    }
                }
                counters.record_exec(input_rows, 0, batch.bytes as u64);
                microbatch::release(&mut consumer);
            }
            Err(_) => {}
        }

        if let Err(e) = vacuum(&core, &mut sw_states).await {
            warn!("sliding-window vacuum failed: {e:#}");
        }
    }
    debug!("combiner{index} exiting");
}

/// One reduced partial group with its merged transition states.
struct Reduced {
    row: Row,
    states: Vec<Option<AggState>>,
}

/// Combines incoming partial rows that share a group before touching the
/// matrel, so each group is looked up once per batch.
fn reduce_partials(
    columns: &[(String, CombinerColumn)],
    group_idxs: &[usize],
    rows: Vec<Row>,
) -> Result<Vec<Reduced>> {
    let mut index: HashMap<u64, Vec<usize>> = HashMap::new();
    let mut reduced: Vec<Reduced> = Vec::new();

    for row in rows {
        let key: Vec<Value> = group_idxs.iter().map(|i| row.get(*i).clone()).collect();
        let hash = freshet_common::hash::hash_group(&key);
        let found = index.entry(hash).or_default().iter().copied().find(|i| {
            let held: Vec<Value> = group_idxs
                .iter()
                .map(|g| reduced[*i].row.get(*g).clone())
                .collect();
            keys_eq(&held, &key)
        });

        match found {
            Some(i) => {
                for (out_idx, (_, column)) in columns.iter().enumerate() {
                    if let CombinerColumn::Combine { idx, agg } = column {
                        let incoming = agg.datum_to_state(row.get(*idx))?;
                        match &mut reduced[i].states[out_idx] {
                            Some(held) => agg.combine(held, &incoming)?,
                            slot @ None => *slot = Some(incoming),
                        }
                    }
                }
            }
            None => {
                let mut states = vec![None; columns.len()];
                for (out_idx, (_, column)) in columns.iter().enumerate() {
                    if let CombinerColumn::Combine { idx, agg } = column {
                        states[out_idx] = Some(agg.datum_to_state(row.get(*idx))?);
                    }
                }
                reduced.push(Reduced { row, states });
                index.entry(hash).or_default().push(reduced.len() - 1);
            }
        }
    }
    Ok(reduced)
}

/// Builds the matrel row for a reduced group, merging against an existing
/// row when one matched the group fingerprint.
fn build_row(
    columns: &[(String, CombinerColumn)],
    existing: Option<&Row>,
    incoming: &Reduced,
) -> Result<Row> {
    let mut values = Vec::with_capacity(columns.len());
    for (out_idx, (_, column)) in columns.iter().enumerate() {
        let value = match column {
            CombinerColumn::Group { idx } => match existing {
                Some(old) => old.get(out_idx).clone(),
                None => incoming.row.get(*idx).clone(),
            },
            CombinerColumn::Combine { agg, .. } => {
                let mut state = match &incoming.states[out_idx] {
                    Some(state) => state.clone(),
                    None => agg.init(),
                };
                if let Some(old) = existing {
                    let mut held = agg.datum_to_state(old.get(out_idx))?;
                    agg.combine(&mut held, &state)?;
                    state = held;
                }
                agg.state_to_datum(&state)?
            }
            CombinerColumn::Const(expr) => eval_const(expr)
                .with_context(|| "constant combiner target")?,
        };
        values.push(value);
    }
    Ok(Row::new(values))
}

async fn process_message(
    core: &Arc<EngineCore>,
    sw_states: &mut HashMap<QueryId, SwState>,
    message: CombinerMessage,
    now: DateTime<Utc>,
) -> Result<()> {
    let Some(runtime) = core.plans.get(core, message.cv)? else {
        // the view was dropped while the batch was in flight
        return Ok(());
    };
    let cv = &runtime.cv;
    let relid = cv.matrel;

    // first contact with a sliding-window view materializes the expiry
    // structures with one matrel scan
    if let Some(sw) = &runtime.sw
        && cv.gc
        && !sw_states.contains_key(&cv.id)
    {
        let mut state = SwState::new(sw.attno, sw.window_us, &cv.group_cols);
        state.init_from_scan(&core.matrels.scan(relid));
        sw_states.insert(cv.id, state);
    }

    // a projection-only view has no groups to merge into; every partial
    // row becomes its own matrel row
    let pure_projection = runtime.combiner.group_idxs.is_empty()
        && !runtime
            .combiner
            .columns
            .iter()
            .any(|(_, c)| matches!(c, CombinerColumn::Combine { .. }));

    let mut deltas: Vec<(RowId, Option<Row>, Row)> = Vec::new();
    if pure_projection {
        for row in &message.rows {
            let reduced = Reduced {
                row: row.clone(),
                states: vec![None; runtime.combiner.columns.len()],
            };
            let new = build_row(&runtime.combiner.columns, None, &reduced)?;
            let (row_id, _) = core.matrels.insert(relid, new.clone())?;
            if let Some(sw) = sw_states.get_mut(&cv.id) {
                sw.track_insert(row_id, &new);
            }
            deltas.push((row_id, None, new));
        }
        if core.hooks.has(cv.id) {
            fire_change_hooks(core, &runtime, sw_states.get(&cv.id), &deltas, now)?;
        }
        let osrel_deltas: Vec<(Option<Row>, Option<Row>)> = deltas
            .iter()
            .map(|(_, old, new)| (old.clone(), Some(new.clone())))
            .collect();
        core.emit_osrel_deltas(cv, &cv.matrel_desc, &osrel_deltas)
            .await?;
        if let Some(view_counters) = core.stats.view_counters(cv.id) {
            view_counters.record_exec(0, deltas.len() as u64, 0);
        }
        return Ok(());
    }

    let reduced = reduce_partials(
        &runtime.combiner.columns,
        &runtime.combiner.group_idxs,
        message.rows,
    )?;

    for group in reduced {
        let fingerprint = core
            .matrels
            .fingerprint(relid, &group.row)
            .ok_or_else(|| anyhow!("matrel for view {} is gone", cv.name))?;

        let group_cols = &runtime.combiner.group_idxs;
        let key: Vec<Value> = group_cols.iter().map(|i| group.row.get(*i).clone()).collect();
        let existing = core
            .matrels
            .lookup_group(relid, fingerprint)
            .into_iter()
            .find(|(_, row)| {
                let held: Vec<Value> = group_cols.iter().map(|i| row.get(*i).clone()).collect();
                keys_eq(&held, &key)
            });

        match existing {
            Some((row_id, old)) => {
                let new = build_row(&runtime.combiner.columns, Some(&old), &group)?;
                core.matrels.update(relid, row_id, new.clone())?;
                if let Some(sw) = sw_states.get_mut(&cv.id) {
                    sw.track_update(row_id, &new);
                }
                deltas.push((row_id, Some(old), new));
            }
            None => {
                let new = build_row(&runtime.combiner.columns, None, &group)?;
                let (row_id, _) = core.matrels.insert(relid, new.clone())?;
                if let Some(sw) = sw_states.get_mut(&cv.id) {
                    sw.track_insert(row_id, &new);
                }
                deltas.push((row_id, None, new));
            }
        }
    }

    if core.hooks.has(cv.id) {
        fire_change_hooks(core, &runtime, sw_states.get(&cv.id), &deltas, now)?;
    }

    let osrel_deltas: Vec<(Option<Row>, Option<Row>)> = deltas
        .iter()
        .map(|(_, old, new)| (old.clone(), Some(new.clone())))
        .collect();
    core.emit_osrel_deltas(cv, &cv.matrel_desc, &osrel_deltas)
        .await?;

    if let Some(view_counters) = core.stats.view_counters(cv.id) {
        view_counters.record_exec(0, deltas.len() as u64, 0);
    }
    Ok(())
}

/// Re-runs the overlay over the affected result group and hands `(old,
/// new)` output rows to the registered hooks.
fn fire_change_hooks(
    core: &Arc<EngineCore>,
    runtime: &Arc<CvRuntime>,
    sw: Option<&SwState>,
    deltas: &[(RowId, Option<Row>, Row)],
    now: DateTime<Utc>,
) -> Result<()> {
    let cv = &runtime.cv;
    for (row_id, old, new) in deltas {
        let group_rows: Vec<(RowId, Row)> = match sw {
            Some(sw) => {
                let user_hash = sw.user_hash(new);
                sw.result_group_rows(user_hash)
                    .into_iter()
                    .filter_map(|id| core.matrels.get(cv.matrel, id).map(|r| (id, r)))
                    .collect()
            }
            None => vec![(*row_id, new.clone())],
        };

        let new_out = run_overlay(&runtime.overlay, &cv.matrel_desc, &group_rows, now)?;

        // the previous output is the same group with this row at its old
        // value, or absent entirely for a fresh group
        let old_rows: Vec<(RowId, Row)> = group_rows
            .iter()
            .filter_map(|(id, row)| {
                if id == row_id {
                    old.clone().map(|o| (*id, o))
                } else {
                    Some((*id, row.clone()))
                }
            })
            .collect();
        let old_out = run_overlay(&runtime.overlay, &cv.matrel_desc, &old_rows, now)?;

        core.hooks
            .fire(cv.id, old_out.first(), new_out.first());
    }
    Ok(())
}

/// Drains expired buckets in timestamp order and emits the deletions as one
/// combiner batch.
async fn vacuum(
    core: &Arc<EngineCore>,
    sw_states: &mut HashMap<QueryId, SwState>,
) -> Result<()> {
    let now = core.now();
    let now_us = now.timestamp_micros();

    for (cv_id, state) in sw_states.iter_mut() {
        let expired = state.drain_expired(now_us);
        if expired.is_empty() {
            continue;
        }
        let Some(runtime) = core.plans.get(core, *cv_id)? else {
            continue;
        };
        let cv = &runtime.cv;
        debug!("vacuuming {} expired rows from {}", expired.len(), cv.name);

        let mut osrel_deltas = Vec::with_capacity(expired.len());
        for row_id in expired {
            if let Some(old) = core.matrels.delete(cv.matrel, row_id)? {
                if core.hooks.has(cv.id) {
                    let old_out =
                        run_overlay(&runtime.overlay, &cv.matrel_desc, &[(row_id, old.clone())], now)?;
                    core.hooks.fire(cv.id, old_out.first(), None);
                }
                osrel_deltas.push((Some(old), None));
            }
        }
        core.emit_osrel_deltas(cv, &cv.matrel_desc, &osrel_deltas)
            .await?;
    }
    Ok(())
}
