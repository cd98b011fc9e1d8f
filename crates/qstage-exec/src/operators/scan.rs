//! Table scans with partition pruning.

use qstage_core::catalog::TableDef;
use qstage_core::types::{RowBatch, Scalar};

use crate::data::PartitionData;
use crate::error::ExecResult;
use crate::eval::BoundExpr;

pub struct ScanOutput {
    pub partitions: Vec<PartitionData>,
    pub pruned: u64,
}

/// Read every partition of `table` whose partition value passes all
/// `filters` (bound against a one-column schema holding the partition
/// column). Partitions without a value are never pruned.
pub fn scan_table(table: &TableDef, filters: &[BoundExpr], columnar: bool) -> ExecResult<ScanOutput> {
    let mut partitions = Vec::with_capacity(table.partitions.len());
    let mut pruned = 0;
    for part in &table.partitions {
        if let Some(value) = &part.value {
            if !keep(value, filters)? {
                pruned += 1;
                continue;
            }
        }
        partitions.push(if columnar {
            PartitionData::Columnar(part.batch.clone())
        } else {
            PartitionData::Rows(part.batch.to_rows())
        });
    }
    // Downstream operators expect at least one partition.
    if partitions.is_empty() {
        partitions.push(if columnar {
            let names = table.schema.names();
            PartitionData::Columnar(RowBatch::from_rows(&names, &[]).unwrap_or_default())
        } else {
            PartitionData::Rows(vec![])
        });
    }
    Ok(ScanOutput { partitions, pruned })
}

fn keep(value: &Scalar, filters: &[BoundExpr]) -> ExecResult<bool> {
    let row = [value.clone()];
    for f in filters {
        if !f.passes(&row)? {
            return Ok(false);
        }
    }
    Ok(true)
}
