use crate::combiner::CombinerMessage;
use crate::engine::{CvRuntime, EngineCore, batch_targets, combiner_for};
use crate::executor::run_worker_plan;
use crate::microbatch;
use crate::stream::{StreamProjection, StreamTupleState};
use anyhow::Result;
use chrono::{DateTime, Utc};
use freshet_catalog::types::ContAction;
use freshet_common::tuple::{Row, TupleDesc};
use freshet_common::wire::encode_cbor;
use freshet_cqueue::Consumer;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The worker main loop: wait on the ring buffer, execute each targeted
/// view's worker plan over the microbatch, and route partial results to
/// combiners hashed by group. Any error aborts the batch for that view,
/// charges its stats and the loop keeps going; the offending batch is not
/// retried.
pub async fn worker_main(core: Arc<EngineCore>, mut consumer: Consumer, index: usize) {
    let counters = core.stats.register_proc(&format!("worker{index}"));
    let batch_size = core.settings.batch_size;
    let max_wait = Duration::from_millis(core.settings.max_wait_ms);
    debug!("worker{index} started");

    loop {
        if core.terminated() {
            break;
        }
        let batch = match microbatch::read_batch::<StreamTupleState>(
            &mut consumer,
            batch_size,
            max_wait,
        )
        .await
        {
            Ok(batch) => batch,
            Err(_) => break,
        };
        if batch.is_empty() {
            microbatch::release(&mut consumer);
            continue;
        }

        let now = core.now();
        let mut output_rows = 0u64;

        // per-batch acknowledgement bookkeeping: tuples consumed and
        // combiner messages generated, per ack handle
        let mut ack_tuples: HashMap<u64, i64> = HashMap::new();
        for tuple in &batch.tuples {
            if let Some(ack) = tuple.ack {
                *ack_tuples.entry(ack).or_default() += 1;
            }
        }
        let mut ack_messages: HashMap<u64, i64> = HashMap::new();
        let mut outgoing: Vec<(usize, CombinerMessage)> = Vec::new();

        for cv_id in batch_targets(&batch.tuples) {
            let runtime = match core.plans.get(&core, cv_id) {
                Ok(Some(runtime)) => runtime,
                Ok(None) => continue,
                Err(e) => {
                    warn!("planning view {cv_id} failed: {e:#}");
                    continue;
                }
            };
            if !runtime.cv.active {
                continue;
            }

            let tuples: Vec<&StreamTupleState> = batch
                .tuples
                .iter()
                .filter(|t| t.targets.contains(&cv_id))
                .collect();
            if tuples.is_empty() {
                continue;
            }

            match execute_cv(&core, &runtime, &tuples, now).await {
                Ok(ExecOutcome { messages, rows_out }) => {
                    output_rows += rows_out;
                    for (queue_idx, message) in messages {
                        for ack in &message.acks {
                            *ack_messages.entry(*ack).or_default() += 1;
                        }
                        outgoing.push((queue_idx, message));
                    }
                }
                Err(e) => {
                    warn!("batch failed for view {}: {e:#}", runtime.cv.name);
                    counters.record_error();
                    if let Some(view_counters) = core.stats.view_counters(cv_id) {
                        view_counters.record_error();
                    }
                }
            }
        }

        // a worker turning t consumed tuples into m combiner messages
        // shifts the outstanding count by m - t, and must do so before any
        // message is applied or the count could dip to zero early
        for (ack, tuples_consumed) in ack_tuples {
            let messages = ack_messages.get(&ack).copied().unwrap_or(0);
            core.acks.adjust(ack, messages - tuples_consumed);
        }

        for (queue_idx, message) in outgoing {
            match encode_cbor(&message) {
                Ok(payload) => {
                    if core.combiner_queues[queue_idx].push(&payload).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!("encoding combiner message failed: {e:#}"),
            }
        }

        counters.record_exec(batch.len() as u64, output_rows, batch.bytes as u64);
        microbatch::release(&mut consumer);
    }
    debug!("worker{index} exiting");
}

struct ExecOutcome {
    messages: Vec<(usize, CombinerMessage)>,
    rows_out: u64,
}

async fn execute_cv(
    core: &Arc<EngineCore>,
    runtime: &Arc<CvRuntime>,
    tuples: &[&StreamTupleState],
    now: DateTime<Utc>,
) -> Result<ExecOutcome> {
    // the projection scratchpad is keyed by the inserting session's
    // descriptor; batches are usually homogeneous
    let mut projections: Vec<(TupleDesc, StreamProjection)> = Vec::new();
    let mut rows = Vec::with_capacity(tuples.len());
    for tuple in tuples {
        let projection = match projections.iter().position(|(desc, _)| *desc == tuple.desc) {
            Some(found) => &projections[found].1,
            None => {
                let built = StreamProjection::new(&tuple.desc, &runtime.stream_desc);
                projections.push((tuple.desc.clone(), built));
                &projections.last().expect("just pushed").1
            }
        };
        rows.push(projection.project(tuple));
    }

    let output = run_worker_plan(
        &runtime.worker,
        &runtime.combiner.group_idxs,
        &runtime.stream_desc,
        &rows,
        &core.tables,
        now,
    )?;

    if let Some(view_counters) = core.stats.view_counters(runtime.cv.id) {
        view_counters.record_exec(rows.len() as u64, output.rows.len() as u64, 0);
    }

    match runtime.cv.action {
        ContAction::Dumped => Ok(ExecOutcome {
            messages: Vec::new(),
            rows_out: output.rows.len() as u64,
        }),
        ContAction::Transform => {
            // transform rows go to the output function and the output
            // stream, never to a matrel
            if let Some(func_name) = &runtime.cv.output_func
                && let Some(func) = core.outputs.get(func_name)
            {
                func(&runtime.cv.matrel_desc, &output.rows);
            }
            let deltas: Vec<(Option<Row>, Option<Row>)> = output
                .rows
                .iter()
                .map(|row| (None, Some(row.clone())))
                .collect();
            core.emit_osrel_deltas(&runtime.cv, &runtime.cv.matrel_desc, &deltas)
                .await?;
            Ok(ExecOutcome {
                messages: Vec::new(),
                rows_out: output.rows.len() as u64,
            })
        }
        ContAction::Materialize => {
            let mut acks: Vec<u64> = tuples.iter().filter_map(|t| t.ack).collect();
            acks.sort_unstable();
            acks.dedup();

            let num_combiners = core.combiner_queues.len();
            let mut partitions: Vec<Vec<Row>> = vec![Vec::new(); num_combiners];
            for (row, hash) in output.rows.iter().zip(output.hashes.iter()) {
                partitions[combiner_for(*hash, num_combiners)].push(row.clone());
            }

            let rows_out = output.rows.len() as u64;
            let messages = partitions
                .into_iter()
                .enumerate()
                .filter(|(_, rows)| !rows.is_empty())
                .map(|(idx, rows)| {
                    (
                        idx,
                        CombinerMessage {
                            cv: runtime.cv.id,
                            rows,
                            acks: acks.clone(),
                        },
                    )
                })
                .collect();
            Ok(ExecOutcome { messages, rows_out })
        }
    }
}
