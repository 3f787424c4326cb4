//! Explicit schema descriptor and the live-state seam.
//!
//! The engine performs no runtime reflection: an external collaborator
//! builds a SchemaDescriptor once (table names + foreign-key adjacency)
//! and hands it in, together with a StateStore implementation that knows
//! how to scan/truncate/load actual rows.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::value::Row;

/// One foreign key: a column of the owning table referencing another table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub references_table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

/// The full set of tables the engine is responsible for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub tables: Vec<TableSpec>,
}

impl SchemaDescriptor {
    pub fn new(tables: Vec<TableSpec>) -> Self {
        Self { tables }
    }

    pub fn table(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    /// Tables outside `subset` that have a foreign key into `subset`.
    /// Truncating a subset member while such dependents hold live rows
    /// violates delete-time constraints unless they are deferred.
    pub fn out_of_set_dependents(&self, subset: &[String]) -> Vec<(String, String)> {
        let mut conflicts = Vec::new();
        for t in &self.tables {
            if subset.iter().any(|s| s == &t.name) {
                continue;
            }
            for fk in &t.foreign_keys {
                if subset.iter().any(|s| s == &fk.references_table) {
                    conflicts.push((t.name.clone(), fk.references_table.clone()));
                }
            }
        }
        conflicts
    }
}

/// Lazy row stream; errors abort the run at the serializer level.
pub type RowIter<'a> = Box<dyn Iterator<Item = Result<Row>> + Send + 'a>;

/// The live transactional target, as seen by the engine.
///
/// Implementations wrap the real database (or an in-memory fixture). The
/// engine drives them strictly in dependency order; implementations do not
/// need to reason about ordering themselves.
pub trait StateStore: Send {
    /// Stream all rows of a table.
    fn scan<'a>(&'a self, table: &str) -> Result<RowIter<'a>>;

    /// Current row count of a table.
    fn row_count(&self, table: &str) -> Result<u64>;

    /// Delete all rows of a table.
    fn truncate(&mut self, table: &str) -> Result<()>;

    /// Insert rows into a table, consuming the iterator. Returns the number
    /// of rows inserted. A failed insert must leave a well-defined state
    /// (the orchestrator will roll back from the pre-restore snapshot).
    fn load(&mut self, table: &str, rows: &mut dyn Iterator<Item = Result<Row>>) -> Result<u64>;

    /// Defer (or re-apply) FK constraint enforcement for the current
    /// operation, where the backend supports it.
    fn set_constraints_deferred(&mut self, deferred: bool) -> Result<()>;

    /// Optional referential-integrity spot check: number of rows in `table`
    /// whose `fk` column references a missing parent. None means the
    /// backend cannot answer and the check is skipped.
    fn orphan_count(&self, _table: &str, _fk: &ForeignKey) -> Result<Option<u64>> {
        Ok(None)
    }
}
