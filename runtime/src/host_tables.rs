use freshet_common::tuple::{Row, TupleDesc};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("relation \"{0}\" already exists")]
    Duplicate(String),
    #[error("relation \"{0}\" does not exist")]
    Unknown(String),
}

struct HostTable {
    desc: TupleDesc,
    rows: Vec<Row>,
    indexed: HashSet<String>,
}

/// Ordinary relations streams can join against. Stand-in for host heap
/// tables; enough surface for stream-table joins and the unindexed-join
/// notice.
#[derive(Default)]
pub struct HostTables {
    tables: RwLock<HashMap<String, HostTable>>,
}

impl HostTables {
    pub fn create(&self, name: &str, desc: TupleDesc) -> Result<(), TableError> {
        let mut tables = self.tables.write().expect("tables poisoned");
        let key = name.to_ascii_lowercase();
        if tables.contains_key(&key) {
            return Err(TableError::Duplicate(key));
        }
        tables.insert(
            key,
            HostTable {
                desc,
                rows: Vec::new(),
                indexed: HashSet::new(),
            },
        );
        Ok(())
    }

    pub fn drop_table(&self, name: &str) {
        self.tables
            .write()
            .expect("tables poisoned")
            .remove(&name.to_ascii_lowercase());
    }

    pub fn insert(&self, name: &str, rows: Vec<Row>) -> Result<(), TableError> {
        let mut tables = self.tables.write().expect("tables poisoned");
        let table = tables
            .get_mut(&name.to_ascii_lowercase())
            .ok_or_else(|| TableError::Unknown(name.to_owned()))?;
        table.rows.extend(rows);
        Ok(())
    }

    pub fn create_index(&self, name: &str, column: &str) -> Result<(), TableError> {
        let mut tables = self.tables.write().expect("tables poisoned");
        let table = tables
            .get_mut(&name.to_ascii_lowercase())
            .ok_or_else(|| TableError::Unknown(name.to_owned()))?;
        table.indexed.insert(column.to_ascii_lowercase());
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.tables
            .read()
            .expect("tables poisoned")
            .contains_key(&name.to_ascii_lowercase())
    }

    pub fn has_index(&self, name: &str, column: &str) -> bool {
        self.tables
            .read()
            .expect("tables poisoned")
            .get(&name.to_ascii_lowercase())
            .map(|t| t.indexed.contains(&column.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    pub fn scan(&self, name: &str) -> Result<(TupleDesc, Vec<Row>), TableError> {
        let tables = self.tables.read().expect("tables poisoned");
        let table = tables
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| TableError::Unknown(name.to_owned()))?;
        Ok((table.desc.clone(), table.rows.clone()))
    }
}
