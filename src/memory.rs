//! In-memory StateStore: the reference adapter and test fixture.
//!
//! Keeps whole tables in BTreeMaps and actually enforces what the engine
//! expects from a real backend: truncation, bulk load, a deferred-
//! constraints toggle and an orphan count for the spot check. Fault
//! injection (fail while loading a named table) exists so rollback paths
//! can be exercised.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;

use crate::schema::{ForeignKey, RowIter, SchemaDescriptor, StateStore};
use crate::value::{Row, Value};

pub struct MemoryStore {
    schema: SchemaDescriptor,
    tables: BTreeMap<String, Vec<Row>>,
    /// Column names per table; first column is the primary key by
    /// convention. Needed only for the orphan spot check.
    columns: BTreeMap<String, Vec<String>>,
    constraints_deferred: bool,
    /// Tests set this to make load() fail on a specific table.
    fail_loading: Option<String>,
}

impl MemoryStore {
    pub fn new(schema: SchemaDescriptor) -> Self {
        let tables = schema
            .tables
            .iter()
            .map(|t| (t.name.clone(), Vec::new()))
            .collect();
        Self {
            schema,
            tables,
            columns: BTreeMap::new(),
            constraints_deferred: false,
            fail_loading: None,
        }
    }

    pub fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    /// Declare column names for a table so orphan_count can resolve FK
    /// columns positionally. Optional; without it the spot check reports
    /// "cannot answer" for that table.
    pub fn define_columns(&mut self, table: &str, cols: &[&str]) {
        self.columns
            .insert(table.to_string(), cols.iter().map(|c| c.to_string()).collect());
    }

    pub fn insert(&mut self, table: &str, row: Row) -> Result<()> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| anyhow!("unknown table {table}"))?
            .push(row);
        Ok(())
    }

    pub fn rows(&self, table: &str) -> Option<&[Row]> {
        self.tables.get(table).map(|r| r.as_slice())
    }

    pub fn constraints_deferred(&self) -> bool {
        self.constraints_deferred
    }

    /// Arm fault injection: the next load() of `table` fails mid-way.
    pub fn fail_next_load_of(&mut self, table: Option<&str>) {
        self.fail_loading = table.map(|t| t.to_string());
    }

    fn table(&self, name: &str) -> Result<&Vec<Row>> {
        self.tables
            .get(name)
            .ok_or_else(|| anyhow!("unknown table {name}"))
    }

    /// Primary-key values of a table (first field by convention).
    fn key_set(&self, table: &str) -> Result<Vec<Value>> {
        Ok(self
            .table(table)?
            .iter()
            .filter_map(|r| r.first().cloned())
            .collect())
    }
}

impl StateStore for MemoryStore {
    fn scan<'a>(&'a self, table: &str) -> Result<RowIter<'a>> {
        let rows = self.table(table)?;
        Ok(Box::new(rows.iter().cloned().map(Ok)))
    }

    fn row_count(&self, table: &str) -> Result<u64> {
        Ok(self.table(table)?.len() as u64)
    }

    fn truncate(&mut self, table: &str) -> Result<()> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| anyhow!("unknown table {table}"))?
            .clear();
        Ok(())
    }

    fn load(&mut self, table: &str, rows: &mut dyn Iterator<Item = Result<Row>>) -> Result<u64> {
        // One-shot: a later load of the same table (e.g. rollback) succeeds.
        let fail_here = if self.fail_loading.as_deref() == Some(table) {
            self.fail_loading = None;
            true
        } else {
            false
        };
        let target = self
            .tables
            .get_mut(table)
            .ok_or_else(|| anyhow!("unknown table {table}"))?;
        let mut loaded = 0u64;
        for row in rows {
            if fail_here && loaded > 0 {
                return Err(anyhow!(
                    "injected load failure in {table} after {loaded} rows"
                ));
            }
            target.push(row?);
            loaded += 1;
        }
        if fail_here {
            return Err(anyhow!("injected load failure in {table}"));
        }
        Ok(loaded)
    }

    fn set_constraints_deferred(&mut self, deferred: bool) -> Result<()> {
        self.constraints_deferred = deferred;
        Ok(())
    }

    fn orphan_count(&self, table: &str, fk: &ForeignKey) -> Result<Option<u64>> {
        let idx = match self
            .columns
            .get(table)
            .and_then(|cols| cols.iter().position(|c| c == &fk.column))
        {
            Some(i) => i,
            None => return Ok(None),
        };
        let parent_keys = self.key_set(&fk.references_table)?;
        let mut orphans = 0u64;
        for row in self.table(table)? {
            match row.get(idx) {
                Some(Value::Null) | None => continue,
                Some(v) => {
                    if !parent_keys.contains(v) {
                        orphans += 1;
                    }
                }
            }
        }
        Ok(Some(orphans))
    }
}
