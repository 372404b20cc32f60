use freshet_catalog::types::RelId;
use freshet_common::hash::hash_group;
use freshet_common::tuple::{Row, TupleDesc};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatRelError {
    #[error("materialization relation {0} does not exist")]
    Unknown(RelId),
}

pub type RowId = u64;

struct MatRelTable {
    desc: TupleDesc,
    group_cols: Vec<usize>,
    rows: HashMap<RowId, Row>,
    /// The hashed group-lookup index: fingerprint -> row ids.
    group_index: HashMap<u64, Vec<RowId>>,
    next_row_id: RowId,
}

impl MatRelTable {
    fn fingerprint(&self, row: &Row) -> u64 {
        let key: Vec<_> = self
            .group_cols
            .iter()
            .map(|i| row.get(*i).clone())
            .collect();
        hash_group(&key)
    }
}

/// Storage for materialization relations: slotted rows plus the hashed
/// group index the combiner looks rows up through. Each combiner owns the
/// groups that hash to it, which serializes writes per group the way the
/// original's row locks did.
#[derive(Default)]
pub struct MatRelStore {
    tables: RwLock<HashMap<RelId, MatRelTable>>,
}

impl MatRelStore {
    pub fn create(&self, relid: RelId, desc: TupleDesc, group_cols: Vec<usize>) {
        let mut tables = self.tables.write().expect("matrel store poisoned");
        tables.insert(
            relid,
            MatRelTable {
                desc,
                group_cols,
                rows: HashMap::new(),
                group_index: HashMap::new(),
                next_row_id: 1,
            },
        );
    }

    pub fn drop_table(&self, relid: RelId) {
        self.tables
            .write()
            .expect("matrel store poisoned")
            .remove(&relid);
    }

    pub fn truncate(&self, relid: RelId) {
        let mut tables = self.tables.write().expect("matrel store poisoned");
        if let Some(table) = tables.get_mut(&relid) {
            table.rows.clear();
            table.group_index.clear();
        }
    }

    pub fn desc(&self, relid: RelId) -> Option<TupleDesc> {
        self.tables
            .read()
            .expect("matrel store poisoned")
            .get(&relid)
            .map(|t| t.desc.clone())
    }

    pub fn len(&self, relid: RelId) -> usize {
        self.tables
            .read()
            .expect("matrel store poisoned")
            .get(&relid)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, relid: RelId) -> bool {
        self.len(relid) == 0
    }

    /// Rows matching a group fingerprint, via the hashed index.
    pub fn lookup_group(&self, relid: RelId, fingerprint: u64) -> Vec<(RowId, Row)> {
        let tables = self.tables.read().expect("matrel store poisoned");
        let Some(table) = tables.get(&relid) else {
            return Vec::new();
        };
        table
            .group_index
            .get(&fingerprint)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| table.rows.get(id).map(|r| (*id, r.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn insert(&self, relid: RelId, row: Row) -> Result<(RowId, u64), MatRelError> {
        let mut tables = self.tables.write().expect("matrel store poisoned");
        let table = tables.get_mut(&relid).ok_or(MatRelError::Unknown(relid))?;
        let fingerprint = table.fingerprint(&row);
        let id = table.next_row_id;
        table.next_row_id += 1;
        table.rows.insert(id, row);
        table.group_index.entry(fingerprint).or_default().push(id);
        Ok((id, fingerprint))
    }

    /// In-place update; the group key of a row never changes.
    pub fn update(&self, relid: RelId, row_id: RowId, row: Row) -> Result<(), MatRelError> {
        let mut tables = self.tables.write().expect("matrel store poisoned");
        let table = tables.get_mut(&relid).ok_or(MatRelError::Unknown(relid))?;
        table.rows.insert(row_id, row);
        Ok(())
    }

    pub fn delete(&self, relid: RelId, row_id: RowId) -> Result<Option<Row>, MatRelError> {
        let mut tables = self.tables.write().expect("matrel store poisoned");
        let table = tables.get_mut(&relid).ok_or(MatRelError::Unknown(relid))?;
        let removed = table.rows.remove(&row_id);
        if let Some(row) = &removed {
            let fingerprint = table.fingerprint(row);
            if let Some(ids) = table.group_index.get_mut(&fingerprint) {
                ids.retain(|id| *id != row_id);
                if ids.is_empty() {
                    table.group_index.remove(&fingerprint);
                }
            }
        }
        Ok(removed)
    }

    pub fn get(&self, relid: RelId, row_id: RowId) -> Option<Row> {
        self.tables
            .read()
            .expect("matrel store poisoned")
            .get(&relid)
            .and_then(|t| t.rows.get(&row_id).cloned())
    }

    pub fn scan(&self, relid: RelId) -> Vec<(RowId, Row)> {
        let tables = self.tables.read().expect("matrel store poisoned");
        let Some(table) = tables.get(&relid) else {
            return Vec::new();
        };
        let mut rows: Vec<(RowId, Row)> = table.rows.iter().map(|(id, r)| (*id, r.clone())).collect();
        rows.sort_by_key(|(id, _)| *id);
        rows
    }

    /// Group fingerprint of an arbitrary row of this relation.
    pub fn fingerprint(&self, relid: RelId, row: &Row) -> Option<u64> {
        self.tables
            .read()
            .expect("matrel store poisoned")
            .get(&relid)
            .map(|t| t.fingerprint(row))
    }
}
