use chrono::{DateTime, Utc};
use freshet_catalog::types::QueryId;
use freshet_common::cast;
use freshet_common::tuple::{ARRIVAL_TIMESTAMP, Row, TupleDesc};
use freshet_common::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// One stream tuple as it travels through a ring buffer: the inserting
/// session's descriptor, the payload, an optional acknowledgement handle,
/// and the continuous queries it targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamTupleState {
    pub desc: TupleDesc,
    pub values: Vec<Value>,
    pub arrival: DateTime<Utc>,
    pub ack: Option<u64>,
    pub targets: Vec<QueryId>,
}

/// Scratchpad mapping an arriving tuple's descriptor onto the columns a
/// continuous view expects. Built once per (descriptor, view) pair and
/// reused across a batch.
pub struct StreamProjection {
    /// For each expected column: the source attribute, if present.
    mapping: Vec<Option<usize>>,
    expected: TupleDesc,
    arrival_attr: Option<usize>,
}

impl StreamProjection {
    pub fn new(incoming: &TupleDesc, expected: &TupleDesc) -> Self {
        let mapping = expected
            .columns
            .iter()
            .map(|col| incoming.attr(&col.name))
            .collect();
        Self {
            mapping,
            expected: expected.clone(),
            arrival_attr: expected.attr(ARRIVAL_TIMESTAMP),
        }
    }

    /// Projects one stream tuple into the view's row shape, coercing each
    /// attribute first through the cast graph, then through the textual
    /// round trip. Unmappable attributes become nulls.
    pub fn project(&self, tuple: &StreamTupleState) -> Row {
        let mut values = Vec::with_capacity(self.expected.arity());
        for (idx, source) in self.mapping.iter().enumerate() {
            if Some(idx) == self.arrival_attr {
                values.push(Value::Timestamp(tuple.arrival));
                continue;
            }
            let value = match source {
                Some(src) => {
                    let raw = tuple.values.get(*src).cloned().unwrap_or(Value::Null);
                    let want = self.expected.columns[idx].data_type;
                    cast::coerce(&raw, want).unwrap_or(Value::Null)
                }
                None => Value::Null,
            };
            values.push(value);
        }
        Row::new(values)
    }
}

/// Lowers a row into a self-describing record datum for output-stream
/// deltas.
pub fn record_of(desc: &TupleDesc, row: &Row) -> Value {
    Value::Record(
        desc.columns
            .iter()
            .enumerate()
            .map(|(idx, col)| (col.name.clone(), row.get(idx).clone()))
            .collect(),
    )
}

struct InsertBatch {
    pending: AtomicI64,
    notify: Notify,
}

/// Acknowledgement batches for synchronous stream inserts. A batch is
/// created with one unit per tuple; workers and combiners shift units as
/// work fans out, and the inserting session waits for zero.
#[derive(Default)]
pub struct AckRegistry {
    next_id: AtomicU64,
    batches: Mutex<HashMap<u64, Arc<InsertBatch>>>,
}

impl AckRegistry {
    /// Registers a batch covering `tuples` pending units.
    pub fn create(&self, tuples: i64) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let batch = Arc::new(InsertBatch {
            pending: AtomicI64::new(tuples),
            notify: Notify::new(),
        });
        self.batches
            .lock()
            .expect("ack registry poisoned")
            .insert(id, batch);
        id
    }

    /// Shifts outstanding units: a worker converting t consumed tuples into
    /// m combiner messages adjusts by m - t; each applied message adjusts
    /// by -1.
    pub fn adjust(&self, id: u64, delta: i64) {
        let batch = {
            self.batches
                .lock()
                .expect("ack registry poisoned")
                .get(&id)
                .cloned()
        };
        if let Some(batch) = batch {
            let left = batch.pending.fetch_add(delta, Ordering::AcqRel) + delta;
            if left <= 0 {
                batch.notify.notify_waiters();
            }
        }
    }

    /// Blocks until the batch has fully drained, then forgets it.
    pub async fn wait(&self, id: u64) {
        let batch = {
            self.batches
                .lock()
                .expect("ack registry poisoned")
                .get(&id)
                .cloned()
        };
        let Some(batch) = batch else {
            return;
        };
        loop {
            if batch.pending.load(Ordering::Acquire) <= 0 {
                break;
            }
            let waiter = batch.notify.notified();
            if batch.pending.load(Ordering::Acquire) <= 0 {
                break;
            }
            waiter.await;
        }
        self.batches.lock().expect("ack registry poisoned").remove(&id);
    }
}
