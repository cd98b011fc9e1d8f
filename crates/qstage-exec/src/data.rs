//! Partition payloads passed between operators.

use qstage_core::types::{Row, RowBatch};

use crate::error::{ExecError, ExecResult};

/// One partition of an operator's output.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionData {
    Rows(Vec<Row>),
    Columnar(RowBatch),
}

impl PartitionData {
    pub fn num_rows(&self) -> usize {
        match self {
            PartitionData::Rows(r) => r.len(),
            PartitionData::Columnar(b) => b.num_rows(),
        }
    }

    /// Row payload; columnar partitions are an error for row operators.
    pub fn into_rows(self, op: &'static str) -> ExecResult<Vec<Row>> {
        match self {
            PartitionData::Rows(r) => Ok(r),
            PartitionData::Columnar(_) => Err(ExecError::ColumnarInput { op }),
        }
    }

    pub fn into_batch(self, op: &'static str) -> ExecResult<RowBatch> {
        match self {
            PartitionData::Columnar(b) => Ok(b),
            PartitionData::Rows(_) => Err(ExecError::RowInput { op }),
        }
    }
}

pub type Partitions = Vec<PartitionData>;

/// Row payloads of every partition, in order.
pub fn rows_of(parts: Partitions, op: &'static str) -> ExecResult<Vec<Vec<Row>>> {
    parts.into_iter().map(|p| p.into_rows(op)).collect()
}

pub fn total_rows(parts: &[PartitionData]) -> u64 {
    parts.iter().map(|p| p.num_rows() as u64).sum()
}
