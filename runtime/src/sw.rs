use crate::matrel::RowId;
use freshet_common::hash::hash_group;
use freshet_common::tuple::Row;
use freshet_common::value::Value;
use std::collections::{BTreeSet, HashMap};

/// Per-combiner bookkeeping for one sliding-window continuous view: every
/// matrel row threaded into its result group and its expiry bucket, plus
/// the ordered expiry set that drives the vacuum drain.
pub struct SwState {
    /// Matrel attribute carrying the truncated window timestamp.
    attno: usize,
    window_us: i64,
    /// Group columns minus the window bucket: the user-visible group.
    user_group_idxs: Vec<usize>,
    entries: HashMap<RowId, SwEntry>,
    result_groups: HashMap<u64, Vec<RowId>>,
    ts_buckets: HashMap<i64, Vec<RowId>>,
    expiries: BTreeSet<i64>,
}

#[derive(Debug, Clone)]
struct SwEntry {
    user_hash: u64,
    expiry_us: i64,
}

impl SwState {
    pub fn new(attno: usize, window_us: i64, group_cols: &[usize]) -> Self {
        let user_group_idxs = group_cols
            .iter()
            .copied()
            .filter(|idx| *idx != attno)
            .collect();
        Self {
            attno,
            window_us,
            user_group_idxs,
            entries: HashMap::new(),
            result_groups: HashMap::new(),
            ts_buckets: HashMap::new(),
            expiries: BTreeSet::new(),
        }
    }

    /// Builds the structures with one pass over the matrel.
    pub fn init_from_scan(&mut self, rows: &[(RowId, Row)]) {
        for (row_id, row) in rows {
            self.track_insert(*row_id, row);
        }
    }

    pub fn user_hash(&self, row: &Row) -> u64 {
        let key: Vec<Value> = self
            .user_group_idxs
            .iter()
            .map(|i| row.get(*i).clone())
            .collect();
        hash_group(&key)
    }

    fn expiry_of(&self, row: &Row) -> Option<i64> {
        let bucket = row.get(self.attno).as_timestamp()?;
        Some(bucket.timestamp_micros() + self.window_us)
    }

    /// Rows currently belonging to the same result group.
    pub fn result_group_rows(&self, user_hash: u64) -> Vec<RowId> {
        self.result_groups
            .get(&user_hash)
            .cloned()
            .unwrap_or_default()
    }

    pub fn track_insert(&mut self, row_id: RowId, row: &Row) {
        let Some(expiry_us) = self.expiry_of(row) else {
            return;
        };
        let user_hash = self.user_hash(row);
        self.entries.insert(
            row_id,
            SwEntry {
                user_hash,
                expiry_us,
            },
        );
        self.result_groups.entry(user_hash).or_default().push(row_id);
        self.ts_buckets.entry(expiry_us).or_default().push(row_id);
        self.expiries.insert(expiry_us);
    }

    /// Updates never move a row between groups or buckets; nothing to do,
    /// kept for symmetry with the change hooks.
    pub fn track_update(&mut self, _row_id: RowId, _row: &Row) {}

    pub fn track_delete(&mut self, row_id: RowId) {
        let Some(entry) = self.entries.remove(&row_id) else {
            return;
        };
        if let Some(rows) = self.result_groups.get_mut(&entry.user_hash) {
            rows.retain(|id| *id != row_id);
            if rows.is_empty() {
                self.result_groups.remove(&entry.user_hash);
            }
        }
        if let Some(rows) = self.ts_buckets.get_mut(&entry.expiry_us) {
            rows.retain(|id| *id != row_id);
            if rows.is_empty() {
                self.ts_buckets.remove(&entry.expiry_us);
                self.expiries.remove(&entry.expiry_us);
            }
        }
    }

    /// Pops every bucket whose expiry is at or before `now`, in timestamp
    /// order, returning the rows to delete as one combiner batch.
    pub fn drain_expired(&mut self, now_us: i64) -> Vec<RowId> {
        let mut expired = Vec::new();
        while let Some(first) = self.expiries.first().copied() {
            if first > now_us {
                break;
            }
            self.expiries.remove(&first);
            if let Some(rows) = self.ts_buckets.remove(&first) {
                for row_id in rows {
                    if let Some(entry) = self.entries.remove(&row_id) {
                        if let Some(group) = self.result_groups.get_mut(&entry.user_hash) {
                            group.retain(|id| *id != row_id);
                            if group.is_empty() {
                                self.result_groups.remove(&entry.user_hash);
                            }
                        }
                        expired.push(row_id);
                    }
                }
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
