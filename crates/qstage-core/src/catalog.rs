//! In-memory table catalog shared by the analyzer, the stats estimator and
//! the runtime.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::schema::Schema;
use crate::types::{Row, RowBatch, Scalar};

/// One stored partition. `value` is the partition column value shared by
/// every row when the table is partitioned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TablePartition {
    pub value: Option<Scalar>,
    pub batch: RowBatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub schema: Schema,
    pub partition_column: Option<String>,
    pub streaming: bool,
    pub partitions: Vec<TablePartition>,
}

impl TableDef {
    /// Split `rows` into partitions: one per distinct partition column value
    /// (ordered by first appearance) when `partition_column` is set,
    /// otherwise `num_partitions` round-robin chunks.
    pub fn from_rows(
        name: impl Into<String>,
        schema: Schema,
        rows: Vec<Row>,
        partition_column: Option<String>,
        num_partitions: usize,
    ) -> Result<TableDef> {
        let name = name.into();
        let names = schema.names();
        let mut partitions = Vec::new();

        match &partition_column {
            Some(col) => {
                let idx = schema.index_of(col).ok_or_else(|| {
                    Error::Config(format!("partition column '{col}' not in table '{name}'"))
                })?;
                let mut groups: Vec<(Scalar, Vec<Row>)> = Vec::new();
                for row in rows {
                    let key = row.get(idx).cloned().unwrap_or(Scalar::Null);
                    match groups.iter_mut().find(|(k, _)| *k == key) {
                        Some((_, g)) => g.push(row),
                        None => groups.push((key, vec![row])),
                    }
                }
                for (value, group) in groups {
                    let batch = RowBatch::from_rows(&names, &group)
                        .map_err(|e| Error::Config(format!("table '{name}': {e}")))?;
                    partitions.push(TablePartition {
                        value: Some(value),
                        batch,
                    });
                }
            }
            None => {
                let n = num_partitions.max(1);
                let mut chunks: Vec<Vec<Row>> = (0..n).map(|_| Vec::new()).collect();
                for (i, row) in rows.into_iter().enumerate() {
                    chunks[i % n].push(row);
                }
                for chunk in chunks {
                    let batch = RowBatch::from_rows(&names, &chunk)
                        .map_err(|e| Error::Config(format!("table '{name}': {e}")))?;
                    partitions.push(TablePartition { value: None, batch });
                }
            }
        }

        Ok(TableDef {
            name,
            schema,
            partition_column,
            streaming: false,
            partitions,
        })
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn row_count(&self) -> u64 {
        self.partitions.iter().map(|p| p.batch.num_rows() as u64).sum()
    }
}

/// Thread-safe name → table map.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: RwLock<BTreeMap<String, Arc<TableDef>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a table.
    pub fn register(&self, table: TableDef) {
        if let Ok(mut map) = self.tables.write() {
            map.insert(table.name.clone(), Arc::new(table));
        }
    }

    pub fn table(&self, name: &str) -> Option<Arc<TableDef>> {
        self.tables.read().ok()?.get(name).cloned()
    }

    pub fn row_count(&self, name: &str) -> Option<u64> {
        self.table(name).map(|t| t.row_count())
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, Field};

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("p", DataType::Int32, false),
            Field::new("v", DataType::Int64, false),
        ])
    }

    fn rows() -> Vec<Row> {
        (0..6)
            .map(|i| vec![Scalar::I32(i % 2), Scalar::I64(i as i64)])
            .collect()
    }

    #[test]
    fn partitions_by_column_value() {
        let t = TableDef::from_rows("t", schema(), rows(), Some("p".into()), 8).expect("table");
        assert_eq!(t.partitions.len(), 2);
        assert_eq!(t.partitions[0].value, Some(Scalar::I32(0)));
        assert_eq!(t.row_count(), 6);
    }

    #[test]
    fn round_robin_without_partition_column() {
        let t = TableDef::from_rows("t", schema(), rows(), None, 4).expect("table");
        assert_eq!(t.partitions.len(), 4);
        assert_eq!(t.partitions[0].batch.num_rows(), 2);
        assert_eq!(t.row_count(), 6);
    }

    #[test]
    fn catalog_lookup() {
        let c = Catalog::new();
        c.register(TableDef::from_rows("t", schema(), rows(), None, 1).expect("table"));
        assert_eq!(c.row_count("t"), Some(6));
        assert!(c.table("missing").is_none());
        assert_eq!(c.table_names(), vec!["t".to_string()]);
    }

    #[test]
    fn unknown_partition_column_rejected() {
        assert!(TableDef::from_rows("t", schema(), rows(), Some("zz".into()), 1).is_err());
    }
}
